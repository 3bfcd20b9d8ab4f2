//! # Background Dispatcher
//!
//! One coordinating thread owns every named queue and the single reserved
//! task. Bus owner threads and workers only send it commands, so enqueue,
//! advance and completion never run concurrently.
//!
//! ## Advance
//!
//! 1. With nothing reserved, scan the queues in creation order, skip any with
//!    a task in flight, and reserve the head of the first remaining queue,
//!    marking that queue in flight.
//! 2. Offer the reserved task to the worker pool. The first idle worker takes
//!    it and the reservation clears; the scan then repeats.
//! 3. If every worker is busy the task stays reserved until the next
//!    completion or enqueue.

use crate::config::BusConfig;
use crate::error::{BusError, BusResult, FaultChannel};
use crate::task::{Task, TaskPool, TaskQueue};
use crate::worker::{self, WorkerPool};
use crate::DEFAULT_QUEUE;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Messages processed by the dispatcher thread.
pub(crate) enum Command {
    Dispatch(Box<Task>),
    Completed(Box<Task>),
    Shutdown,
}

/// FIFO of background tasks sharing one queue name. At most one of its tasks
/// is on a worker at any time.
#[derive(Debug)]
pub(crate) struct SerialTaskQueue {
    name: Arc<str>,
    tasks: TaskQueue,
    in_flight: bool,
}

impl SerialTaskQueue {
    fn new(name: Arc<str>) -> Self {
        Self {
            name,
            tasks: TaskQueue::new(),
            in_flight: false,
        }
    }
}

struct Coordinator {
    queues: Vec<SerialTaskQueue>,
    reserved: Option<Box<Task>>,
    workers: WorkerPool,
    task_pool: Arc<TaskPool>,
}

impl Coordinator {
    fn run(mut self, mut commands: UnboundedReceiver<Command>) {
        debug!("Dispatcher started");
        while let Some(command) = commands.blocking_recv() {
            match command {
                Command::Dispatch(task) => self.enqueue(task),
                Command::Completed(task) => self.complete(task),
                Command::Shutdown => break,
            }
            self.advance();
        }

        let dropped = self.queues.iter().map(|q| q.tasks.len()).sum::<usize>()
            + usize::from(self.reserved.is_some());
        if dropped > 0 {
            warn!(dropped, "Dispatcher stopped with undispatched tasks");
        }
        self.workers.shutdown();
        debug!("Dispatcher stopped");
    }

    fn queue_mut(&mut self, name: &Arc<str>) -> &mut SerialTaskQueue {
        match self.queues.iter().position(|q| q.name == *name) {
            Some(index) => &mut self.queues[index],
            None => {
                debug!(queue = %name, "Created background queue");
                self.queues.push(SerialTaskQueue::new(name.clone()));
                let last = self.queues.len() - 1;
                &mut self.queues[last]
            }
        }
    }

    fn enqueue(&mut self, task: Box<Task>) {
        let name = task
            .queue()
            .cloned()
            .unwrap_or_else(|| Arc::from(DEFAULT_QUEUE));
        trace!(queue = %name, event_type = task.event_type(), "Background task queued");
        self.queue_mut(&name).tasks.offer(task);
    }

    fn complete(&mut self, task: Box<Task>) {
        if let Some(name) = task.queue() {
            if let Some(queue) = self.queues.iter_mut().find(|q| q.name == *name) {
                queue.in_flight = false;
            }
        }
        self.task_pool.release(task);
    }

    fn reserve_next(&mut self) -> Option<Box<Task>> {
        self.queues
            .iter_mut()
            .filter(|q| !q.in_flight)
            .find_map(|queue| {
                let task = queue.tasks.poll()?;
                queue.in_flight = true;
                Some(task)
            })
    }

    fn advance(&mut self) {
        loop {
            if self.reserved.is_none() {
                self.reserved = self.reserve_next();
            }
            let Some(task) = self.reserved.take() else {
                return;
            };
            if let Err(task) = self.workers.offer(task) {
                trace!(event_type = task.event_type(), "All workers busy, task stays reserved");
                self.reserved = Some(task);
                return;
            }
        }
    }
}

/// Handle to the dispatcher thread.
pub struct Dispatcher {
    id: u64,
    commands: UnboundedSender<Command>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the dispatcher thread. Workers start lazily.
    ///
    /// # Errors
    ///
    /// `BusError::ThreadSpawn` if the thread cannot be started.
    pub fn start(
        config: &BusConfig,
        task_pool: Arc<TaskPool>,
        faults: FaultChannel,
    ) -> BusResult<Self> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (commands, receiver) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            queues: Vec::new(),
            reserved: None,
            workers: WorkerPool::new(config, id, commands.clone(), faults),
            task_pool,
        };

        let name = config.dispatcher_thread_name();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || coordinator.run(receiver))
            .map_err(|source| BusError::ThreadSpawn { name, source })?;

        Ok(Self {
            id,
            commands,
            running: AtomicBool::new(true),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a background task on its named queue. Never blocks.
    pub(crate) fn dispatch_in_background(&self, task: Box<Task>) {
        if let Err(mpsc::error::SendError(Command::Dispatch(task))) =
            self.commands.send(Command::Dispatch(task))
        {
            warn!(
                event_type = task.event_type(),
                "Dispatcher stopped, background task dropped"
            );
        }
    }

    /// Whether the dispatcher thread accepts tasks.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.commands.is_closed()
    }

    /// Stop the dispatcher and join it along with its workers.
    ///
    /// Idempotent. Called from the dispatcher thread or from one of its own
    /// workers, the threads are left to finish on their own; the worker is
    /// joined by the dispatcher once its callback returns.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.commands.send(Command::Shutdown);

        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if worker::current_pool() == Some(self.id) {
            debug!("Dispatcher shut down from one of its workers, not joining");
            return;
        }
        if thread.join().is_err() {
            warn!("Dispatcher thread terminated abnormally");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("running", &self.is_running())
            .finish()
    }
}
