//! # Bus Core
//!
//! A [`Bus`] is pinned to the thread that created it. Register, unregister
//! and same-thread posts go through one FIFO of tasks drained by the first
//! call that finds the bus idle; calls made from inside a callback while the
//! drain is running only enqueue. Posts from other threads are marshalled
//! onto the owner's [`RunLoop`].
//!
//! Internal tables are only locked long enough to copy what a step needs, so
//! callbacks and producers may call back into the bus freely.

use crate::binding::{BindingTable, BusObject, Receiver, SubscriberBinding};
use crate::context::{BusContext, Wireable};
use crate::delayed::DelayedScheduler;
use crate::depot::Depot;
use crate::error::{BusError, BusResult, DispatchFault, Role};
use crate::event::{AnyEvent, EventKey, Mode};
use crate::runloop::RunLoop;
use crate::task::{BackgroundTarget, Payload, Task, TaskCode, TaskQueue};
use parking_lot::{Mutex, RwLock};
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// A registered object together with its bindings.
#[derive(Clone)]
pub(crate) struct Registrant {
    id: usize,
    object: Arc<Receiver>,
    table: Arc<BindingTable>,
}

impl Registrant {
    fn new<T: BusObject>(object: &Arc<T>, table: Arc<BindingTable>) -> Self {
        let object: Arc<Receiver> = object.clone();
        Self {
            id: identity(&object),
            object,
            table,
        }
    }

    pub(crate) fn object_type(&self) -> &'static str {
        self.table.object_type()
    }

    fn produce(&self, event: &EventKey) -> Option<AnyEvent> {
        self.table.producer(event)?.produce(&*self.object)
    }
}

/// Identity of a shared object: the address of its allocation.
fn identity<T: ?Sized>(object: &Arc<T>) -> usize {
    Arc::as_ptr(object).cast::<()>() as usize
}

#[derive(Default)]
struct Tables {
    subscribers: HashMap<TypeId, Vec<Registrant>>,
    producers: HashMap<TypeId, Registrant>,
}

impl Tables {
    fn check_insert(&self, registrant: &Registrant) -> BusResult<()> {
        for event in registrant.table.subscribed_events() {
            let present = self
                .subscribers
                .get(&event.id())
                .is_some_and(|list| list.iter().any(|s| s.id == registrant.id));
            if present {
                return Err(BusError::DuplicateRegistration {
                    object_type: registrant.object_type(),
                    event_type: event.name(),
                    role: Role::Subscriber,
                });
            }
        }
        for event in registrant.table.produced_events() {
            if self.producers.contains_key(&event.id()) {
                return Err(BusError::DuplicateRegistration {
                    object_type: registrant.object_type(),
                    event_type: event.name(),
                    role: Role::Producer,
                });
            }
        }
        Ok(())
    }

    fn insert(&mut self, registrant: &Registrant) {
        for event in registrant.table.subscribed_events() {
            self.subscribers
                .entry(event.id())
                .or_default()
                .push(registrant.clone());
        }
        for event in registrant.table.produced_events() {
            self.producers.insert(event.id(), registrant.clone());
        }
    }

    /// Remove every entry of the object. Returns whether anything was removed.
    fn remove(&mut self, registrant: &Registrant) -> bool {
        let mut removed = false;
        for event in registrant.table.subscribed_events() {
            if let Some(list) = self.subscribers.get_mut(&event.id()) {
                let before = list.len();
                list.retain(|s| s.id != registrant.id);
                removed |= list.len() != before;
                if list.is_empty() {
                    self.subscribers.remove(&event.id());
                }
            }
        }
        for event in registrant.table.produced_events() {
            if self
                .producers
                .get(&event.id())
                .is_some_and(|p| p.id == registrant.id)
            {
                self.producers.remove(&event.id());
                removed = true;
            }
        }
        removed
    }

    fn contains(&self, id: usize) -> bool {
        self.producers.values().any(|p| p.id == id)
            || self
                .subscribers
                .values()
                .any(|list| list.iter().any(|s| s.id == id))
    }

    fn subscribers_of(&self, event: TypeId) -> Vec<Registrant> {
        self.subscribers.get(&event).cloned().unwrap_or_default()
    }

    fn producer_of(&self, event: TypeId) -> Option<Registrant> {
        self.producers.get(&event).cloned()
    }
}

/// Snapshot of a bus's activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Events accepted by `post`, from any thread.
    pub posted: u64,
    /// Main-mode callbacks completed.
    pub delivered: u64,
    /// Deliveries handed to the background dispatcher.
    pub dispatched_in_background: u64,
    /// Delayed events whose timer fired.
    pub delayed_fired: u64,
}

#[derive(Default)]
struct Counters {
    posted: AtomicU64,
    delivered: AtomicU64,
    dispatched_in_background: AtomicU64,
    delayed_fired: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BusStats {
        BusStats {
            posted: self.posted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dispatched_in_background: self.dispatched_in_background.load(Ordering::Relaxed),
            delayed_fired: self.delayed_fired.load(Ordering::Relaxed),
        }
    }
}

struct BusInner {
    owner: ThreadId,
    run_loop: Option<RunLoop>,
    depot: Arc<Depot>,
    context: RwLock<Option<BusContext>>,
    tables: Mutex<Tables>,
    queue: Mutex<TaskQueue>,
    processing: AtomicBool,
    delayed: DelayedScheduler,
    adapters: Mutex<Vec<Box<dyn Wireable>>>,
    started: AtomicBool,
    stats: Counters,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.delayed.cancel_all();
    }
}

/// Clears the processing flag when the drain loop ends, including by panic.
struct Processing<'a>(&'a AtomicBool);

impl Drop for Processing<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Typed publish/subscribe bus pinned to its creating thread.
///
/// Cloning is cheap and every clone refers to the same bus. Clones may be
/// moved to other threads, where only `post` and the delayed-post operations
/// are available.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Bus on the process-wide depot, without a context.
    ///
    /// Only Main-mode delivery is available until a context is attached.
    #[must_use]
    pub fn new() -> Self {
        Self::with_depot(Depot::global())
    }

    /// Bus on a specific depot, without a context.
    #[must_use]
    pub fn with_depot(depot: Arc<Depot>) -> Self {
        Self::build(depot, None)
    }

    /// Bus bound to a host context, enabling Background mode and delayed posts.
    #[must_use]
    pub fn with_context(context: BusContext) -> Self {
        Self::build(context.depot().clone(), Some(context))
    }

    fn build(depot: Arc<Depot>, context: Option<BusContext>) -> Self {
        let run_loop = RunLoop::current();
        let owner = thread::current().id();
        debug!(
            ?owner,
            run_loop = run_loop.is_some(),
            context = ?context.as_ref().map(BusContext::name),
            "Bus created"
        );
        Self {
            inner: Arc::new(BusInner {
                owner,
                run_loop,
                depot,
                context: RwLock::new(context),
                tables: Mutex::new(Tables::default()),
                queue: Mutex::new(TaskQueue::new()),
                processing: AtomicBool::new(false),
                delayed: DelayedScheduler::new(),
                adapters: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stats: Counters::default(),
            }),
        }
    }

    /// Thread the bus is pinned to.
    #[must_use]
    pub fn owner_thread(&self) -> ThreadId {
        self.inner.owner
    }

    /// Whether the caller runs on the owner thread.
    #[must_use]
    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.inner.owner
    }

    /// Depot providing the registry and task pool.
    #[must_use]
    pub fn depot(&self) -> &Arc<Depot> {
        &self.inner.depot
    }

    /// Run loop captured on the owner thread, if any.
    #[must_use]
    pub fn run_loop(&self) -> Option<&RunLoop> {
        self.inner.run_loop.as_ref()
    }

    fn check_owner(&self, operation: &'static str) -> BusResult<()> {
        let current = thread::current().id();
        if current == self.inner.owner {
            Ok(())
        } else {
            Err(BusError::ThreadAffinityViolation {
                operation,
                owner: self.inner.owner,
                current,
            })
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register an object's subscriber and producer bindings.
    ///
    /// New subscribers are primed with the current value of a registered
    /// producer; a new producer primes the subscribers already present.
    ///
    /// # Errors
    ///
    /// - `ThreadAffinityViolation` off the owner thread
    /// - `BindingConflict` if `T` declares conflicting bindings
    /// - `DuplicateRegistration` if the object is already registered or
    ///   another producer owns one of its event types
    /// - any error raised while draining, such as `CallbackFailure`
    ///
    /// Only the first three leave the tables untouched. A priming failure is
    /// raised after insertion and the object stays registered.
    pub fn register<T: BusObject>(&self, object: &Arc<T>) -> BusResult<()> {
        self.check_owner("register")?;
        let table = self.inner.depot.registry().bindings_for::<T>()?;
        let task = self.inner.depot.task_pool().acquire(
            TaskCode::Register,
            Payload::Object(Registrant::new(object, table)),
        );
        self.enqueue(task)
    }

    /// Remove an object from every table it populated.
    ///
    /// # Errors
    ///
    /// - `ThreadAffinityViolation` off the owner thread
    /// - `NotRegistered` if the object holds no entry
    pub fn unregister<T: BusObject>(&self, object: &Arc<T>) -> BusResult<()> {
        self.check_owner("unregister")?;
        let table = self.inner.depot.registry().bindings_for::<T>()?;
        let task = self.inner.depot.task_pool().acquire(
            TaskCode::Unregister,
            Payload::Object(Registrant::new(object, table)),
        );
        self.enqueue(task)
    }

    /// Whether the object currently holds an entry in any table.
    ///
    /// # Errors
    ///
    /// `ThreadAffinityViolation` off the owner thread.
    pub fn has_registered<T: BusObject>(&self, object: &Arc<T>) -> BusResult<bool> {
        self.check_owner("has_registered")?;
        Ok(self.inner.tables.lock().contains(identity(object)))
    }

    /// Number of registered subscribers of `E`.
    #[must_use]
    pub fn subscriber_count<E: 'static>(&self) -> usize {
        self.inner
            .tables
            .lock()
            .subscribers
            .get(&TypeId::of::<E>())
            .map_or(0, Vec::len)
    }

    /// Whether a producer of `E` is registered.
    #[must_use]
    pub fn has_producer<E: 'static>(&self) -> bool {
        self.inner
            .tables
            .lock()
            .producers
            .contains_key(&TypeId::of::<E>())
    }

    // =========================================================================
    // Posting
    // =========================================================================

    /// Deliver `event` to every subscriber of its exact type.
    ///
    /// On the owner thread the event is queued and, if the bus is idle,
    /// delivered before returning. From any other thread it is marshalled
    /// onto the owner's run loop; failures there are reported on the depot's
    /// fault channel.
    ///
    /// # Errors
    ///
    /// - `NoTargetRunLoop` off the owner thread when the owner has no run loop
    /// - `CallbackFailure` if a Main-mode callback fails while draining
    /// - `NoDispatcherBound` if a Background-mode receiver is reached on a bus
    ///   without a context
    pub fn post<E: Send + Sync + 'static>(&self, event: E) -> BusResult<()> {
        self.post_event(AnyEvent::new(event))
    }

    /// [`post`](Self::post) for an already type-erased event.
    ///
    /// # Errors
    ///
    /// As for [`post`](Self::post).
    pub fn post_event(&self, event: AnyEvent) -> BusResult<()> {
        if self.is_owner_thread() {
            Counters::bump(&self.inner.stats.posted);
            let task = self
                .inner
                .depot
                .task_pool()
                .acquire_event(TaskCode::Post, event);
            return self.enqueue(task);
        }

        let Some(run_loop) = &self.inner.run_loop else {
            return Err(BusError::NoTargetRunLoop {
                event_type: event.key().name(),
            });
        };
        Counters::bump(&self.inner.stats.posted);
        trace!(event_type = event.key().name(), "Marshalling post onto owner thread");
        let bus = self.clone();
        run_loop.post(move || bus.run_marshalled(TaskCode::PostFromBackground, event));
        Ok(())
    }

    /// Enqueue on the owner thread on behalf of a caller that is gone.
    fn run_marshalled(&self, code: TaskCode, event: AnyEvent) {
        let event_type = event.key().name();
        let task = self.inner.depot.task_pool().acquire_event(code, event);
        if let Err(err) = self.enqueue(task) {
            self.inner.depot.faults().report(DispatchFault {
                thread: thread::current().name().unwrap_or("owner").to_string(),
                queue: None,
                event_type,
                error: err.into(),
            });
        }
    }

    // =========================================================================
    // Delayed posting
    // =========================================================================

    /// Post `event` on the owner thread once `delay` has elapsed.
    ///
    /// At most one delayed event per type is pending: a second call for the
    /// same type replaces the value and restarts the delay.
    ///
    /// # Errors
    ///
    /// - `NoDispatcherBound` if the bus has no context
    /// - `NoTargetRunLoop` if the owner thread has no run loop
    pub fn post_delayed<E: Send + Sync + 'static>(
        &self,
        event: E,
        delay: Duration,
    ) -> BusResult<()> {
        if self.inner.context.read().is_none() {
            return Err(BusError::NoDispatcherBound {
                operation: "post_delayed",
            });
        }
        let event = AnyEvent::new(event);
        let event_type = event.key().name();
        let Some(run_loop) = &self.inner.run_loop else {
            return Err(BusError::NoTargetRunLoop { event_type });
        };

        let bus = Arc::downgrade(&self.inner);
        let replaced =
            self.inner
                .delayed
                .schedule(event, delay, run_loop, move |type_id, generation| {
                    if let Some(inner) = bus.upgrade() {
                        Bus { inner }.fire_delayed(type_id, generation);
                    }
                });
        debug!(event_type, ?delay, replaced, "Delayed post scheduled");
        Ok(())
    }

    /// Cancel the pending delayed event of type `E`. Returns whether one was
    /// pending.
    pub fn cancel_delayed<E: 'static>(&self) -> bool {
        let cancelled = self.inner.delayed.cancel(TypeId::of::<E>());
        if cancelled {
            debug!(event_type = std::any::type_name::<E>(), "Delayed post cancelled");
        }
        cancelled
    }

    /// Whether a delayed event of type `E` is pending.
    #[must_use]
    pub fn has_pending_delayed<E: 'static>(&self) -> bool {
        self.inner.delayed.contains(TypeId::of::<E>())
    }

    /// Number of pending delayed events.
    #[must_use]
    pub fn pending_delayed(&self) -> usize {
        self.inner.delayed.len()
    }

    fn fire_delayed(&self, type_id: TypeId, generation: u64) {
        let Some(event) = self.inner.delayed.take(type_id, generation) else {
            return;
        };
        Counters::bump(&self.inner.stats.delayed_fired);
        self.run_marshalled(TaskCode::PostDelayed, event);
    }

    // =========================================================================
    // Drain loop
    // =========================================================================

    fn enqueue(&self, task: Box<Task>) -> BusResult<()> {
        self.inner.queue.lock().offer(task);
        if self.inner.processing.swap(true, Ordering::AcqRel) {
            // A drain further up the stack will reach it
            return Ok(());
        }
        let _processing = Processing(&self.inner.processing);
        self.drain()
    }

    fn drain(&self) -> BusResult<()> {
        loop {
            let next = self.inner.queue.lock().poll();
            let Some(task) = next else {
                return Ok(());
            };
            let result = self.execute(&task);
            self.inner.depot.task_pool().release(task);
            result?;
        }
    }

    fn execute(&self, task: &Task) -> BusResult<()> {
        match (task.code(), task.payload()) {
            (TaskCode::Register, Some(Payload::Object(registrant))) => {
                self.apply_register(registrant)
            }
            (TaskCode::Unregister, Some(Payload::Object(registrant))) => {
                self.apply_unregister(registrant)
            }
            (
                TaskCode::Post | TaskCode::PostFromBackground | TaskCode::PostDelayed,
                Some(Payload::Event(event)),
            ) => self.deliver(event),
            (code, _) => {
                warn!(?code, "Discarding task not meant for the owner queue");
                Ok(())
            }
        }
    }

    fn apply_register(&self, registrant: &Registrant) -> BusResult<()> {
        {
            let mut tables = self.inner.tables.lock();
            tables.check_insert(registrant)?;
            tables.insert(registrant);
        }
        debug!(object_type = registrant.object_type(), "Registered");

        // Prime the new subscriber from existing producers
        for event in registrant.table.subscribed_events() {
            let producer = self.inner.tables.lock().producer_of(event.id());
            let Some(producer) = producer.filter(|p| p.id != registrant.id) else {
                continue;
            };
            if let Some(value) = producer.produce(&event) {
                self.deliver_to(registrant, &value)?;
            }
        }

        // Prime existing subscribers from the new producer
        for event in registrant.table.produced_events() {
            let subscribers = self.inner.tables.lock().subscribers_of(event.id());
            if subscribers.is_empty() {
                continue;
            }
            if let Some(value) = registrant.produce(&event) {
                for subscriber in &subscribers {
                    self.deliver_to(subscriber, &value)?;
                }
            }
        }
        Ok(())
    }

    fn apply_unregister(&self, registrant: &Registrant) -> BusResult<()> {
        if !self.inner.tables.lock().remove(registrant) {
            return Err(BusError::NotRegistered {
                object_type: registrant.object_type(),
            });
        }
        debug!(object_type = registrant.object_type(), "Unregistered");
        Ok(())
    }

    fn deliver(&self, event: &AnyEvent) -> BusResult<()> {
        let receivers = self.inner.tables.lock().subscribers_of(event.key().id());
        trace!(
            event_type = event.key().name(),
            receivers = receivers.len(),
            "Delivering"
        );
        for receiver in &receivers {
            self.deliver_to(receiver, event)?;
        }
        Ok(())
    }

    fn deliver_to(&self, receiver: &Registrant, event: &AnyEvent) -> BusResult<()> {
        let Some(binding) = receiver.table.subscriber(&event.key()) else {
            return Ok(());
        };
        match binding.mode() {
            Mode::Main => {
                binding
                    .invoke(&*receiver.object, event, self)
                    .map_err(|source| BusError::CallbackFailure {
                        event_type: event.key().name(),
                        receiver_type: receiver.object_type(),
                        source,
                    })?;
                Counters::bump(&self.inner.stats.delivered);
                Ok(())
            }
            Mode::Background(_) => self.dispatch_in_background(binding, receiver, event),
        }
    }

    fn dispatch_in_background(
        &self,
        binding: &Arc<SubscriberBinding>,
        receiver: &Registrant,
        event: &AnyEvent,
    ) -> BusResult<()> {
        let context = self
            .inner
            .context
            .read()
            .clone()
            .ok_or(BusError::NoDispatcherBound {
                operation: "background delivery",
            })?;
        let dispatcher = context.dispatcher()?;

        let task = self
            .inner
            .depot
            .task_pool()
            .acquire_event(TaskCode::DispatchInBackground, event.clone())
            .with_target(BackgroundTarget {
                binding: binding.clone(),
                receiver: Arc::downgrade(&receiver.object),
                bus: self.clone(),
            });
        trace!(
            queue = ?binding.mode().queue(),
            event_type = event.key().name(),
            receiver = receiver.object_type(),
            "Handing off to background"
        );
        dispatcher.dispatch_in_background(task);
        Counters::bump(&self.inner.stats.dispatched_in_background);
        Ok(())
    }

    // =========================================================================
    // Host lifecycle
    // =========================================================================

    /// Bind the bus to a (new) host context. Registrations and pending
    /// delayed events are kept.
    pub fn attach_context(&self, context: BusContext) {
        info!(context = context.name(), "Bus attached to context");
        *self.inner.context.write() = Some(context);
    }

    /// Unbind the bus from its context, returning it.
    pub fn detach_context(&self) -> Option<BusContext> {
        let previous = self.inner.context.write().take();
        if let Some(context) = &previous {
            info!(context = context.name(), "Bus detached from context");
        }
        previous
    }

    /// Current host context.
    #[must_use]
    pub fn context(&self) -> Option<BusContext> {
        self.inner.context.read().clone()
    }

    /// Attach an external event source. It is started right away if the
    /// owner is already started.
    pub fn wire<W: Wireable + 'static>(&self, adapter: W) {
        let mut adapter: Box<dyn Wireable> = Box::new(adapter);
        if self.inner.started.load(Ordering::Acquire) {
            self.start_adapter(adapter.as_mut());
        }
        self.inner.adapters.lock().push(adapter);
    }

    /// Number of wired adapters.
    #[must_use]
    pub fn wired(&self) -> usize {
        self.inner.adapters.lock().len()
    }

    /// Whether the owner is between start and stop.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// The owner became active: start every wired adapter.
    pub fn on_owner_start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.for_each_adapter(|bus, adapter| bus.start_adapter(adapter));
    }

    /// The owner became inactive: stop every wired adapter.
    pub fn on_owner_stop(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.for_each_adapter(|bus, adapter| bus.stop_adapter(adapter));
    }

    /// The owner is being destroyed: stop adapters, cancel every pending
    /// delayed event and detach from the context.
    pub fn on_owner_destroy(&self) {
        self.on_owner_stop();
        let cancelled = self.inner.delayed.cancel_all();
        let context = self.detach_context();
        info!(
            cancelled,
            context = ?context.as_ref().map(BusContext::name),
            "Bus owner destroyed"
        );
    }

    fn for_each_adapter(&self, mut visit: impl FnMut(&Self, &mut dyn Wireable)) {
        // Adapters may wire further adapters while being visited
        let mut adapters = std::mem::take(&mut *self.inner.adapters.lock());
        for adapter in &mut adapters {
            visit(self, adapter.as_mut());
        }
        let mut slot = self.inner.adapters.lock();
        adapters.append(&mut slot);
        *slot = adapters;
    }

    fn start_adapter(&self, adapter: &mut dyn Wireable) {
        match adapter.on_start(self) {
            Ok(()) => debug!(adapter = adapter.name(), "Adapter started"),
            Err(err) => warn!(
                adapter = adapter.name(),
                error = %format!("{err:#}"),
                "Adapter failed to start"
            ),
        }
    }

    fn stop_adapter(&self, adapter: &mut dyn Wireable) {
        match adapter.on_stop(self) {
            Ok(()) => debug!(adapter = adapter.name(), "Adapter stopped"),
            Err(err) => warn!(
                adapter = adapter.name(),
                error = %format!("{err:#}"),
                "Adapter failed to stop"
            ),
        }
    }

    /// Activity counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        self.inner.stats.snapshot()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("owner", &self.inner.owner)
            .field("run_loop", &self.inner.run_loop.is_some())
            .field("context", &self.inner.context.read().as_ref().map(BusContext::name))
            .field("processing", &self.inner.processing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
