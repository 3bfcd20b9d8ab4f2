//! # Worker Pool
//!
//! A fixed number of worker threads, started lazily on first use. Each worker
//! owns a one-task slot and sleeps on a condition variable while the slot is
//! empty. The pool is driven exclusively by the dispatcher thread.
//!
//! A callback that fails or panics is a programming defect: the fault is
//! reported, the task is still completed so its queue keeps moving, and the
//! worker thread exits. The pool replaces it on the next offer.

use crate::config::BusConfig;
use crate::dispatcher::Command;
use crate::error::{BusError, BusResult, DispatchFault, FaultChannel};
use crate::task::Task;
use anyhow::anyhow;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

thread_local! {
    /// Pool the current thread works for, if it is a worker.
    static WORKER_OF: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Pool id of the calling thread when it is a worker thread.
pub(crate) fn current_pool() -> Option<u64> {
    WORKER_OF.with(Cell::get)
}

#[derive(Default)]
struct Slot {
    task: Option<Box<Task>>,
    busy: bool,
    dead: bool,
    stop: bool,
}

#[derive(Default)]
struct Shared {
    slot: Mutex<Slot>,
    wake: Condvar,
}

struct Worker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        name: String,
        pool_id: u64,
        completions: UnboundedSender<Command>,
        faults: FaultChannel,
    ) -> BusResult<Self> {
        let shared = Arc::new(Shared::default());
        let state = shared.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                WORKER_OF.with(|pool| pool.set(Some(pool_id)));
                run(&state, &completions, &faults);
            })
            .map_err(|source| BusError::ThreadSpawn { name, source })?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    fn is_dead(&self) -> bool {
        self.shared.slot.lock().dead
    }

    /// Hand `task` over if the worker is idle, otherwise give it back.
    fn assign(&self, task: Box<Task>) -> Result<(), Box<Task>> {
        let mut slot = self.shared.slot.lock();
        if slot.busy || slot.dead || slot.stop {
            return Err(task);
        }
        slot.task = Some(task);
        slot.busy = true;
        self.shared.wake.notify_one();
        Ok(())
    }

    fn stop(&self) {
        self.shared.slot.lock().stop = true;
        self.shared.wake.notify_one();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Worker thread terminated abnormally");
            }
        }
    }
}

fn run(shared: &Shared, completions: &UnboundedSender<Command>, faults: &FaultChannel) {
    let name = thread::current().name().unwrap_or("worker").to_string();
    debug!(worker = %name, "Worker started");

    loop {
        let task = {
            let mut slot = shared.slot.lock();
            loop {
                if slot.stop {
                    debug!(worker = %name, "Worker stopped");
                    return;
                }
                if let Some(task) = slot.task.take() {
                    break task;
                }
                shared.wake.wait(&mut slot);
            }
        };

        let failure = match panic::catch_unwind(AssertUnwindSafe(|| task.dispatch_in_background()))
        {
            Ok(Ok(delivered)) => {
                if !delivered {
                    debug!(
                        worker = %name,
                        event_type = task.event_type(),
                        "Receiver gone, background delivery skipped"
                    );
                }
                None
            }
            Ok(Err(error)) => Some(error),
            Err(payload) => Some(anyhow!("callback panicked: {}", panic_message(&*payload))),
        };
        let fatal = failure.is_some();

        if let Some(error) = failure {
            faults.report(DispatchFault {
                thread: name.clone(),
                queue: task.queue().cloned(),
                event_type: task.event_type(),
                error,
            });
        }

        {
            let mut slot = shared.slot.lock();
            slot.busy = false;
            slot.dead = fatal;
        }

        if completions.send(Command::Completed(task)).is_err() || fatal {
            return;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Fixed-size set of lazily started workers.
pub(crate) struct WorkerPool {
    id: u64,
    config: BusConfig,
    workers: Vec<Option<Worker>>,
    completions: UnboundedSender<Command>,
    faults: FaultChannel,
}

impl WorkerPool {
    pub(crate) fn new(
        config: &BusConfig,
        id: u64,
        completions: UnboundedSender<Command>,
        faults: FaultChannel,
    ) -> Self {
        Self {
            id,
            config: config.clone(),
            workers: (0..config.worker_count.max(1)).map(|_| None).collect(),
            completions,
            faults,
        }
    }

    /// Give `task` to the first idle worker, starting or replacing workers as
    /// needed. Returns the task when every worker is busy.
    pub(crate) fn offer(&mut self, mut task: Box<Task>) -> Result<(), Box<Task>> {
        for index in 0..self.workers.len() {
            let replace = self.workers[index].as_ref().map_or(true, Worker::is_dead);
            if replace {
                if let Some(mut dead) = self.workers[index].take() {
                    dead.join();
                    debug!(worker = index, "Replacing dead worker");
                }
                match Worker::spawn(
                    self.config.worker_thread_name(index),
                    self.id,
                    self.completions.clone(),
                    self.faults.clone(),
                ) {
                    Ok(worker) => self.workers[index] = Some(worker),
                    Err(err) => {
                        warn!(worker = index, error = %err, "Failed to start worker");
                        continue;
                    }
                }
            }

            if let Some(worker) = &self.workers[index] {
                match worker.assign(task) {
                    Ok(()) => return Ok(()),
                    Err(busy) => task = busy,
                }
            }
        }
        Err(task)
    }

    /// Number of workers started so far.
    #[cfg(test)]
    pub(crate) fn started(&self) -> usize {
        self.workers.iter().filter(|w| w.is_some()).count()
    }

    /// Stop and join every worker. A worker finishes its current task first.
    pub(crate) fn shutdown(&mut self) {
        for worker in self.workers.iter().flatten() {
            worker.stop();
        }
        for worker in self.workers.iter_mut().flatten() {
            worker.join();
        }
        self.workers.iter_mut().for_each(|w| *w = None);
    }
}
