//! # Tasks
//!
//! A [`Task`] is one pending bus operation. Tasks travel through the owner
//! thread's [`TaskQueue`], the dispatcher's named queues and the workers, and
//! are recycled through a bounded [`TaskPool`] so posting does not allocate a
//! fresh record per event. The pool is only an optimization: when it is empty
//! a new task is allocated, when it is full a released task is dropped.

use crate::binding::{Receiver, SubscriberBinding};
use crate::bus::{Bus, Registrant};
use crate::event::{AnyEvent, Mode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

/// Kind of work a task carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCode {
    /// Add an object to the bus tables.
    Register,
    /// Remove an object from the bus tables.
    Unregister,
    /// Deliver an event posted on the owner thread.
    Post,
    /// Deliver an event posted from another thread, marshalled onto the owner.
    PostFromBackground,
    /// Deliver an event whose delay elapsed.
    PostDelayed,
    /// Run one background callback on a worker.
    DispatchInBackground,
}

pub(crate) enum Payload {
    Object(Registrant),
    Event(AnyEvent),
}

/// Receiver side of a background delivery.
///
/// The receiver is held weakly: a pending task never keeps an unregistered
/// object alive, and a receiver that is gone by execution time is skipped.
pub(crate) struct BackgroundTarget {
    pub(crate) binding: Arc<SubscriberBinding>,
    pub(crate) receiver: Weak<Receiver>,
    pub(crate) bus: Bus,
}

/// A pooled unit of bus work.
pub struct Task {
    code: TaskCode,
    payload: Option<Payload>,
    target: Option<BackgroundTarget>,
}

impl Task {
    fn empty() -> Self {
        Self {
            code: TaskCode::Post,
            payload: None,
            target: None,
        }
    }

    /// Kind of work.
    #[must_use]
    pub fn code(&self) -> TaskCode {
        self.code
    }

    pub(crate) fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub(crate) fn with_target(mut self: Box<Self>, target: BackgroundTarget) -> Box<Self> {
        self.target = Some(target);
        self
    }

    /// Event carried by post and dispatch tasks.
    #[must_use]
    pub fn event(&self) -> Option<&AnyEvent> {
        match &self.payload {
            Some(Payload::Event(event)) => Some(event),
            _ => None,
        }
    }

    /// Type name used in logs.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match &self.payload {
            Some(Payload::Event(event)) => event.key().name(),
            Some(Payload::Object(registrant)) => registrant.object_type(),
            None => "<empty>",
        }
    }

    /// Background queue this task is serialized on.
    #[must_use]
    pub fn queue(&self) -> Option<&Arc<str>> {
        match self.target.as_ref().map(|target| target.binding.mode()) {
            Some(Mode::Background(queue)) => Some(queue),
            _ => None,
        }
    }

    /// Run the background callback.
    ///
    /// Returns `Ok(false)` when the receiver no longer exists and nothing ran.
    pub(crate) fn dispatch_in_background(&self) -> anyhow::Result<bool> {
        let (Some(target), Some(event)) = (self.target.as_ref(), self.event()) else {
            anyhow::bail!("task {:?} carries no background target", self.code);
        };
        let Some(receiver) = target.receiver.upgrade() else {
            return Ok(false);
        };
        target.binding.invoke(&*receiver, event, &target.bus)?;
        Ok(true)
    }

    fn clear(&mut self) {
        self.payload = None;
        self.target = None;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("code", &self.code)
            .field("type", &self.event_type())
            .field("queue", &self.queue())
            .finish()
    }
}

/// FIFO of tasks.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Box<Task>>,
}

impl TaskQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail.
    pub fn offer(&mut self, task: Box<Task>) {
        self.tasks.push_back(task);
    }

    /// Take from the head.
    pub fn poll(&mut self) -> Option<Box<Task>> {
        self.tasks.pop_front()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Bounded free list of cleared tasks.
#[derive(Debug)]
pub struct TaskPool {
    capacity: usize,
    free: Mutex<Vec<Box<Task>>>,
}

impl TaskPool {
    /// Create a pool keeping at most `capacity` idle tasks.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub(crate) fn acquire(&self, code: TaskCode, payload: Payload) -> Box<Task> {
        let mut task = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(Task::empty()));
        task.code = code;
        task.payload = Some(payload);
        task
    }

    pub(crate) fn acquire_event(&self, code: TaskCode, event: AnyEvent) -> Box<Task> {
        self.acquire(code, Payload::Event(event))
    }

    /// Clear a finished task and keep it for reuse if there is room.
    pub fn release(&self, mut task: Box<Task>) {
        task.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(task);
        }
    }

    /// Number of idle tasks ready for reuse.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Maximum number of idle tasks kept.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
