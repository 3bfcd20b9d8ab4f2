//! # Depot
//!
//! Process-scoped state shared by every bus: the binding registry, the task
//! pool, the fault channel and the background dispatcher. At most one
//! dispatcher (and so one worker pool) runs per depot, however many buses
//! request background capability.

use crate::config::BusConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{BusResult, FaultChannel};
use crate::registry::BindingRegistry;
use crate::task::TaskPool;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::info;

lazy_static! {
    static ref GLOBAL_DEPOT: Arc<Depot> = Arc::new(Depot::new(BusConfig::from_env()));
}

/// Owner of the process-wide bus machinery.
pub struct Depot {
    config: BusConfig,
    registry: BindingRegistry,
    task_pool: Arc<TaskPool>,
    faults: FaultChannel,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
}

impl Depot {
    /// The process-wide depot, configured from the environment.
    #[must_use]
    pub fn global() -> Arc<Self> {
        GLOBAL_DEPOT.clone()
    }

    /// Create an isolated depot.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        let config = config.normalized();
        Self {
            registry: BindingRegistry::new(),
            task_pool: Arc::new(TaskPool::new(config.task_pool_capacity)),
            faults: FaultChannel::new(),
            dispatcher: Mutex::new(None),
            config,
        }
    }

    /// Configuration the depot was built with.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Binding tables cache.
    #[must_use]
    pub fn registry(&self) -> &BindingRegistry {
        &self.registry
    }

    /// Recycled tasks.
    #[must_use]
    pub fn task_pool(&self) -> &Arc<TaskPool> {
        &self.task_pool
    }

    /// Sink for background and marshalled failures.
    #[must_use]
    pub fn faults(&self) -> &FaultChannel {
        &self.faults
    }

    /// The running dispatcher, started on first request.
    ///
    /// # Errors
    ///
    /// `BusError::ThreadSpawn` if the dispatcher thread cannot be started.
    pub fn dispatcher(&self) -> BusResult<Arc<Dispatcher>> {
        let mut slot = self.dispatcher.lock();
        if let Some(dispatcher) = slot.as_ref().filter(|d| d.is_running()) {
            return Ok(dispatcher.clone());
        }

        let dispatcher = Arc::new(Dispatcher::start(
            &self.config,
            self.task_pool.clone(),
            self.faults.clone(),
        )?);
        info!(
            workers = self.config.worker_count,
            prefix = %self.config.thread_name_prefix,
            "Background dispatcher started"
        );
        *slot = Some(dispatcher.clone());
        Ok(dispatcher)
    }

    /// Whether a dispatcher is currently running.
    #[must_use]
    pub fn has_dispatcher(&self) -> bool {
        self.dispatcher
            .lock()
            .as_ref()
            .is_some_and(|d| d.is_running())
    }

    /// Stop the dispatcher and its workers. Undispatched background tasks are
    /// dropped; a later request starts a fresh dispatcher.
    pub fn shutdown(&self) {
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.shutdown();
            info!("Background dispatcher stopped");
        }
    }
}

impl fmt::Debug for Depot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Depot")
            .field("config", &self.config)
            .field("registry", &self.registry.len())
            .field("task_pool", &self.task_pool.idle())
            .field("dispatcher", &self.has_dispatcher())
            .finish()
    }
}
