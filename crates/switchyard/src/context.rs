//! # Host Boundary
//!
//! A [`BusContext`] is the handle a host gives a bus to unlock Background
//! mode and delayed posting. A [`Wireable`] is an external event source that
//! follows the host's start/stop lifecycle.

use crate::bus::Bus;
use crate::depot::Depot;
use crate::dispatcher::Dispatcher;
use crate::error::BusResult;
use std::fmt;
use std::sync::Arc;

/// Host context a bus is bound to.
#[derive(Clone)]
pub struct BusContext {
    name: Arc<str>,
    depot: Arc<Depot>,
}

impl BusContext {
    /// Context backed by the process-wide depot.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::with_depot(name, Depot::global())
    }

    /// Context backed by a specific depot.
    #[must_use]
    pub fn with_depot(name: &str, depot: Arc<Depot>) -> Self {
        Self {
            name: Arc::from(name),
            depot,
        }
    }

    /// Host-assigned name, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Depot providing the dispatcher.
    #[must_use]
    pub fn depot(&self) -> &Arc<Depot> {
        &self.depot
    }

    pub(crate) fn dispatcher(&self) -> BusResult<Arc<Dispatcher>> {
        self.depot.dispatcher()
    }
}

impl fmt::Debug for BusContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusContext")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// An external event source driven by the owner's lifecycle.
///
/// Adapters start emitting on [`Bus::on_owner_start`] and stop on
/// [`Bus::on_owner_stop`]. Errors are logged and do not stop the other
/// adapters.
pub trait Wireable: Send {
    /// Begin emitting events into `bus`.
    fn on_start(&mut self, bus: &Bus) -> anyhow::Result<()>;

    /// Stop emitting events.
    fn on_stop(&mut self, bus: &Bus) -> anyhow::Result<()>;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
