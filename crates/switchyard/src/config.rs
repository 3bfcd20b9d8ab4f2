//! Bus configuration from environment variables.

use crate::{DEFAULT_TASK_POOL_CAPACITY, DEFAULT_WORKER_COUNT};
use std::env;

/// Sizing of the process-wide bus machinery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Background worker threads (at least 1)
    pub worker_count: usize,

    /// Idle tasks kept for reuse
    pub task_pool_capacity: usize,

    /// Prefix of dispatcher and worker thread names
    pub thread_name_prefix: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            task_pool_capacity: DEFAULT_TASK_POOL_CAPACITY,
            thread_name_prefix: "switchyard".to_string(),
        }
    }
}

impl BusConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SWITCHYARD_WORKERS`: Background worker threads (default: 3)
    /// - `SWITCHYARD_TASK_POOL`: Idle tasks kept for reuse (default: 32)
    /// - `SWITCHYARD_THREAD_PREFIX`: Thread name prefix (default: switchyard)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            worker_count: env::var("SWITCHYARD_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.worker_count),

            task_pool_capacity: env::var("SWITCHYARD_TASK_POOL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.task_pool_capacity),

            thread_name_prefix: env::var("SWITCHYARD_THREAD_PREFIX")
                .unwrap_or(defaults.thread_name_prefix),
        }
        .normalized()
    }

    /// Set the number of background workers.
    #[must_use]
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self.normalized()
    }

    /// Set the thread name prefix.
    #[must_use]
    pub fn with_thread_prefix(mut self, prefix: &str) -> Self {
        self.thread_name_prefix = prefix.to_string();
        self
    }

    /// Name of the dispatcher thread.
    pub fn dispatcher_thread_name(&self) -> String {
        format!("{}-dispatcher", self.thread_name_prefix)
    }

    /// Name of the worker thread at `index`.
    pub fn worker_thread_name(&self, index: usize) -> String {
        format!("{}-worker-{}", self.thread_name_prefix, index)
    }

    /// Clamp values a struct literal may have left out of range.
    pub(crate) fn normalized(mut self) -> Self {
        self.worker_count = self.worker_count.max(1);
        self
    }
}
