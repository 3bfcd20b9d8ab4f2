//! # Switchyard - Typed In-Process Event Bus
//!
//! Objects declare which event types they consume (subscriber bindings) and
//! which they can supply on demand (producer bindings). A [`Bus`] routes every
//! posted event to the registered subscribers of its *exact* type and primes
//! newly registered subscribers with the current value of a matching producer.
//!
//! ## Dispatch Model
//!
//! ```text
//!   owner thread                          dispatcher thread        workers
//! ┌──────────────────────────┐          ┌──────────────────┐    ┌──────────┐
//! │ register / unregister    │          │ named queues     │    │ worker-0 │
//! │ post ──► TaskQueue ──►   │  Mode::  │  "global" [...]  │──► │ worker-1 │
//! │        drain loop        │ ───────► │  "io"     [...]  │    │ worker-2 │
//! │  Mode::Main callbacks    │Background│ one in flight    │ ◄──│ completed│
//! └──────────────────────────┘          │ per queue        │    └──────────┘
//!        ▲           ▲                  └──────────────────┘
//!        │           └── RunLoop: cross-thread posts, delayed timers
//!        └────────────── BindingRegistry (per type, built once)
//! ```
//!
//! ## Ordering Guarantees
//!
//! - Operations invoked from inside a callback are queued, never nested: an
//!   event posted while handling another is delivered after the current one.
//! - A single receiver observes its events in post order.
//! - Background deliveries on one named queue run strictly one at a time in
//!   FIFO order; different queues run in parallel up to the pool size.
//!
//! ## Example
//!
//! ```rust,ignore
//! struct Ping(u32);
//!
//! struct Logger;
//!
//! impl BusObject for Logger {
//!     fn bindings(bindings: &mut BindingsBuilder<Self>) {
//!         bindings.subscribe(|_this: &Logger, ping: &Ping| {
//!             println!("ping {}", ping.0);
//!             Ok(())
//!         });
//!     }
//! }
//!
//! let bus = Bus::new();
//! bus.register(&Arc::new(Logger))?;
//! bus.post(Ping(1))?;
//! ```

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod binding;
pub mod bus;
pub mod config;
pub mod context;
pub mod delayed;
pub mod depot;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod registry;
pub mod runloop;
pub mod task;
pub mod worker;

// Re-export main types
pub use binding::{BindingTable, BindingsBuilder, BusObject, ProducerBinding, SubscriberBinding};
pub use bus::{Bus, BusStats};
pub use config::BusConfig;
pub use context::{BusContext, Wireable};
pub use depot::Depot;
pub use dispatcher::Dispatcher;
pub use error::{BusError, BusResult, DispatchFault, FaultChannel, Role};
pub use event::{AnyEvent, EventKey, Mode};
pub use registry::BindingRegistry;
pub use runloop::RunLoop;

/// Name of the background queue used when a binding does not name one.
pub const DEFAULT_QUEUE: &str = "global";

/// Number of background worker threads shared by all buses of a depot.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Maximum number of recycled tasks kept by a task pool.
pub const DEFAULT_TASK_POOL_CAPACITY: usize = 32;
