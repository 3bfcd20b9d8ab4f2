//! # Bindings
//!
//! A type takes part in the bus by implementing [`BusObject`], whose
//! `bindings` function is the static description of what the type consumes
//! and produces. The description is resolved once per type into an immutable
//! [`BindingTable`] and cached by the [`BindingRegistry`](crate::BindingRegistry).

use crate::bus::Bus;
use crate::error::{BusError, BusResult, Role};
use crate::event::{AnyEvent, EventKey, Mode};
use anyhow::anyhow;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A registered object with its type erased.
pub(crate) type Receiver = dyn Any + Send + Sync;

type Handler = dyn Fn(&Receiver, &AnyEvent, &Bus) -> anyhow::Result<()> + Send + Sync;
type Supplier = dyn Fn(&Receiver) -> Option<AnyEvent> + Send + Sync;

/// A type whose instances can be registered on a [`Bus`].
pub trait BusObject: Send + Sync + 'static {
    /// Declare the subscriber and producer bindings of this type.
    ///
    /// Called once per type and process; the result is cached.
    fn bindings(bindings: &mut BindingsBuilder<Self>)
    where
        Self: Sized;
}

/// Event type → callback, declared by a type.
pub struct SubscriberBinding {
    event: EventKey,
    mode: Mode,
    owner: &'static str,
    handler: Box<Handler>,
}

impl SubscriberBinding {
    /// Event type this binding consumes.
    #[must_use]
    pub fn event(&self) -> EventKey {
        self.event
    }

    /// Where the callback runs.
    #[must_use]
    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Type that declared the binding.
    #[must_use]
    pub fn owner(&self) -> &'static str {
        self.owner
    }

    pub(crate) fn invoke(
        &self,
        receiver: &Receiver,
        event: &AnyEvent,
        bus: &Bus,
    ) -> anyhow::Result<()> {
        (self.handler)(receiver, event, bus)
    }
}

impl fmt::Debug for SubscriberBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberBinding")
            .field("event", &self.event)
            .field("mode", &self.mode)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Event type → supplier of its current value, declared by a type.
pub struct ProducerBinding {
    event: EventKey,
    supplier: Box<Supplier>,
}

impl ProducerBinding {
    /// Event type this binding supplies.
    #[must_use]
    pub fn event(&self) -> EventKey {
        self.event
    }

    /// Ask `producer` for its current value. `None` means nothing to deliver.
    pub(crate) fn produce(&self, producer: &Receiver) -> Option<AnyEvent> {
        (self.supplier)(producer)
    }
}

impl fmt::Debug for ProducerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerBinding")
            .field("event", &self.event)
            .finish()
    }
}

/// All bindings of one concrete type. Immutable once built.
pub struct BindingTable {
    object_type: &'static str,
    subscribers: HashMap<EventKey, Arc<SubscriberBinding>>,
    producers: HashMap<EventKey, ProducerBinding>,
}

impl BindingTable {
    /// Run `T`'s binding description.
    ///
    /// # Errors
    ///
    /// `BusError::BindingConflict` if `T` declares two subscribers, or two
    /// producers, for the same event type.
    pub fn discover<T: BusObject>() -> BusResult<Self> {
        let mut builder = BindingsBuilder::<T>::new();
        T::bindings(&mut builder);
        builder.finish()
    }

    /// Name of the type the table describes.
    #[must_use]
    pub fn object_type(&self) -> &'static str {
        self.object_type
    }

    /// Subscriber binding for an event type.
    #[must_use]
    pub fn subscriber(&self, event: &EventKey) -> Option<&Arc<SubscriberBinding>> {
        self.subscribers.get(event)
    }

    /// Producer binding for an event type.
    #[must_use]
    pub fn producer(&self, event: &EventKey) -> Option<&ProducerBinding> {
        self.producers.get(event)
    }

    /// Event types the type subscribes to.
    pub fn subscribed_events(&self) -> impl Iterator<Item = EventKey> + '_ {
        self.subscribers.keys().copied()
    }

    /// Event types the type produces.
    pub fn produced_events(&self) -> impl Iterator<Item = EventKey> + '_ {
        self.producers.keys().copied()
    }

    /// Whether the type declares no bindings at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.producers.is_empty()
    }
}

impl fmt::Debug for BindingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingTable")
            .field("object_type", &self.object_type)
            .field("subscribers", &self.subscribers.keys().collect::<Vec<_>>())
            .field("producers", &self.producers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Collects the bindings of `T` inside [`BusObject::bindings`].
pub struct BindingsBuilder<T> {
    table: BindingTable,
    conflict: Option<BusError>,
    _owner: PhantomData<fn(&T)>,
}

impl<T: BusObject> BindingsBuilder<T> {
    fn new() -> Self {
        Self {
            table: BindingTable {
                object_type: type_name::<T>(),
                subscribers: HashMap::new(),
                producers: HashMap::new(),
            },
            conflict: None,
            _owner: PhantomData,
        }
    }

    /// Consume `E` inline on the owner thread.
    pub fn subscribe<E, F>(&mut self, handler: F) -> &mut Self
    where
        E: Send + Sync + 'static,
        F: Fn(&T, &E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_with_bus(Mode::Main, move |this: &T, event: &E, _bus: &Bus| {
            handler(this, event)
        })
    }

    /// Consume `E` on a background worker, serialized on `queue`.
    pub fn subscribe_in_background<E, F>(&mut self, queue: &str, handler: F) -> &mut Self
    where
        E: Send + Sync + 'static,
        F: Fn(&T, &E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_with_bus(
            Mode::background_on(queue),
            move |this: &T, event: &E, _bus: &Bus| handler(this, event),
        )
    }

    /// Consume `E` in the given mode, with the bus handed to the callback so
    /// it can post follow-up events.
    pub fn subscribe_with_bus<E, F>(&mut self, mode: Mode, handler: F) -> &mut Self
    where
        E: Send + Sync + 'static,
        F: Fn(&T, &E, &Bus) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let event = EventKey::of::<E>();
        let owner = self.table.object_type;
        let erased =
            move |receiver: &Receiver, posted: &AnyEvent, bus: &Bus| -> anyhow::Result<()> {
                let this = receiver
                    .downcast_ref::<T>()
                    .ok_or_else(|| anyhow!("receiver is not a {owner}"))?;
                let posted = posted
                    .downcast_ref::<E>()
                    .ok_or_else(|| anyhow!("event is not a {}", event.name()))?;
                handler(this, posted, bus)
            };

        if self.table.subscribers.contains_key(&event) {
            self.record_conflict(event, Role::Subscriber);
        } else {
            self.table.subscribers.insert(
                event,
                Arc::new(SubscriberBinding {
                    event,
                    mode,
                    owner,
                    handler: Box::new(erased),
                }),
            );
        }
        self
    }

    /// Supply the current value of `E` on demand. Returning `None` suppresses
    /// delivery.
    pub fn produce<E, F>(&mut self, supplier: F) -> &mut Self
    where
        E: Send + Sync + 'static,
        F: Fn(&T) -> Option<E> + Send + Sync + 'static,
    {
        let event = EventKey::of::<E>();
        let erased = move |producer: &Receiver| -> Option<AnyEvent> {
            producer
                .downcast_ref::<T>()
                .and_then(|this| supplier(this))
                .map(AnyEvent::new)
        };

        if self.table.producers.contains_key(&event) {
            self.record_conflict(event, Role::Producer);
        } else {
            self.table.producers.insert(
                event,
                ProducerBinding {
                    event,
                    supplier: Box::new(erased),
                },
            );
        }
        self
    }

    fn record_conflict(&mut self, event: EventKey, role: Role) {
        if self.conflict.is_none() {
            self.conflict = Some(BusError::BindingConflict {
                object_type: self.table.object_type,
                event_type: event.name(),
                role,
            });
        }
    }

    fn finish(self) -> BusResult<BindingTable> {
        match self.conflict {
            Some(conflict) => Err(conflict),
            None => Ok(self.table),
        }
    }
}
