//! # Events
//!
//! Any `Send + Sync + 'static` value can be posted. Its routing identity is
//! its exact concrete type, captured as an [`EventKey`].

use crate::DEFAULT_QUEUE;
use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Routing key of an event type.
///
/// Equality and hashing use the `TypeId` only; the name is kept for logs and
/// error messages.
#[derive(Clone, Copy)]
pub struct EventKey {
    id: TypeId,
    name: &'static str,
}

impl EventKey {
    /// Key of the event type `E`.
    #[must_use]
    pub fn of<E: Any>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: type_name::<E>(),
        }
    }

    /// The `TypeId` events are routed by.
    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for EventKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventKey {}

impl Hash for EventKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A posted event with its type erased.
///
/// Cloning is cheap: every receiver and every background task shares the
/// same allocation.
#[derive(Clone)]
pub struct AnyEvent {
    key: EventKey,
    value: Arc<dyn Any + Send + Sync>,
}

impl AnyEvent {
    /// Wrap an event value.
    pub fn new<E: Send + Sync + 'static>(event: E) -> Self {
        Self {
            key: EventKey::of::<E>(),
            value: Arc::new(event),
        }
    }

    /// Routing key of the wrapped value.
    #[must_use]
    pub fn key(&self) -> EventKey {
        self.key
    }

    /// Borrow the value as `E` if that is its exact type.
    #[must_use]
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }

    /// Whether the value is exactly of type `E`.
    #[must_use]
    pub fn is<E: Any>(&self) -> bool {
        self.key.id == TypeId::of::<E>()
    }
}

impl fmt::Debug for AnyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyEvent").field("type", &self.key).finish()
    }
}

/// Where a subscriber binding runs its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Inline, inside the owner thread's drain loop.
    Main,
    /// On a background worker, serialized with every other binding on the
    /// same named queue.
    Background(Arc<str>),
}

impl Mode {
    /// Background mode on the default queue.
    #[must_use]
    pub fn background() -> Self {
        Self::Background(Arc::from(DEFAULT_QUEUE))
    }

    /// Background mode on a named queue.
    #[must_use]
    pub fn background_on(queue: &str) -> Self {
        Self::Background(Arc::from(queue))
    }

    /// Queue name for background bindings.
    #[must_use]
    pub fn queue(&self) -> Option<&str> {
        match self {
            Self::Main => None,
            Self::Background(queue) => Some(queue),
        }
    }

    /// Whether callbacks run on a worker.
    #[must_use]
    pub fn is_background(&self) -> bool {
        matches!(self, Self::Background(_))
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::Main
    }
}
