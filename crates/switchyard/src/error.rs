//! # Bus Errors
//!
//! Synchronous failures returned to the caller of a bus operation, and the
//! out-of-band fault channel for failures that have no caller to return to
//! (background callbacks, posts marshalled onto the owner's run loop).

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;
use thiserror::Error;
use tracing::error;

/// Result alias used by every bus operation.
pub type BusResult<T> = Result<T, BusError>;

/// Role a binding plays for its event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Consumes events of the type.
    Subscriber,
    /// Supplies the current value of the type on demand.
    Producer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscriber => f.write_str("subscriber"),
            Self::Producer => f.write_str("producer"),
        }
    }
}

/// Errors from bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// An owner-thread operation was called from another thread.
    #[error("{operation}() must be called from the owner thread {owner:?}, called from {current:?}")]
    ThreadAffinityViolation {
        operation: &'static str,
        owner: ThreadId,
        current: ThreadId,
    },

    /// A cross-thread post or a timer needs the owner's run loop, and there is none.
    #[error("cannot deliver {event_type} on the owner thread: it has no run loop")]
    NoTargetRunLoop { event_type: &'static str },

    /// The object is already registered, or another producer owns the event type.
    #[error("{object_type} cannot be registered as {role} of {event_type}: already registered")]
    DuplicateRegistration {
        object_type: &'static str,
        event_type: &'static str,
        role: Role,
    },

    /// The object is not currently registered.
    #[error("{object_type} is not registered")]
    NotRegistered { object_type: &'static str },

    /// Background dispatch or delayed posting on a bus without a bound context.
    #[error("{operation} requires a bus bound to a context with a running dispatcher")]
    NoDispatcherBound { operation: &'static str },

    /// A type declared two bindings of one role for the same event type.
    #[error("{object_type} declares more than one {role} binding for {event_type}")]
    BindingConflict {
        object_type: &'static str,
        event_type: &'static str,
        role: Role,
    },

    /// A Main-mode callback returned an error.
    #[error("{receiver_type} failed handling {event_type}")]
    CallbackFailure {
        event_type: &'static str,
        receiver_type: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The OS refused to start a bus thread.
    #[error("failed to spawn thread {name}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// A failure that surfaced away from any synchronous caller.
#[derive(Debug)]
pub struct DispatchFault {
    /// Name of the thread the failure happened on.
    pub thread: String,
    /// Background queue of the failed task, if any.
    pub queue: Option<Arc<str>>,
    /// Event being delivered.
    pub event_type: &'static str,
    /// What went wrong.
    pub error: anyhow::Error,
}

impl fmt::Display for DispatchFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.queue {
            Some(queue) => write!(
                f,
                "{} on {} (queue {}): {:#}",
                self.event_type, self.thread, queue, self.error
            ),
            None => write!(f, "{} on {}: {:#}", self.event_type, self.thread, self.error),
        }
    }
}

type FaultHandler = Arc<dyn Fn(&DispatchFault) + Send + Sync>;

/// Out-of-band sink for [`DispatchFault`]s.
///
/// Every fault is logged at `error` level; an optional host handler receives
/// it afterwards.
#[derive(Clone, Default)]
pub struct FaultChannel {
    handler: Arc<RwLock<Option<FaultHandler>>>,
}

impl FaultChannel {
    /// Create a channel that only logs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the host handler, replacing any previous one.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&DispatchFault) + Send + Sync + 'static,
    {
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Install `handler` after the current one. Both see every fault, the
    /// earlier handler first.
    pub fn chain_handler<F>(&self, handler: F)
    where
        F: Fn(&DispatchFault) + Send + Sync + 'static,
    {
        let mut slot = self.handler.write();
        let chained: FaultHandler = match slot.take() {
            Some(previous) => Arc::new(move |fault: &DispatchFault| {
                previous(fault);
                handler(fault);
            }),
            None => Arc::new(handler),
        };
        *slot = Some(chained);
    }

    /// Remove the host handler.
    pub fn clear_handler(&self) {
        *self.handler.write() = None;
    }

    /// Report a fault.
    pub fn report(&self, fault: DispatchFault) {
        error!(
            thread = %fault.thread,
            queue = fault.queue.as_deref().unwrap_or("-"),
            event_type = fault.event_type,
            error = %format!("{:#}", fault.error),
            "Dispatch fault"
        );
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(&fault);
        }
    }
}

impl fmt::Debug for FaultChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultChannel")
            .field("has_handler", &self.handler.read().is_some())
            .finish()
    }
}
