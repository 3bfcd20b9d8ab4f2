//! # Run Loop
//!
//! The cooperative task pump of a bus owner thread. A bus created on a thread
//! that drives a tokio current-thread runtime captures that runtime's handle;
//! jobs posted through it run on the owner thread the next time the runtime
//! is polled. A multi-threaded runtime does not qualify: its tasks may run on
//! any of its workers.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::AbortHandle;

/// Handle to the owner thread's run loop.
#[derive(Clone)]
pub struct RunLoop {
    handle: Handle,
}

impl RunLoop {
    /// Run loop of the calling thread, if it drives a current-thread runtime.
    #[must_use]
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().and_then(Self::from_handle)
    }

    /// Wrap a runtime handle. Returns `None` for multi-threaded runtimes.
    #[must_use]
    pub fn from_handle(handle: Handle) -> Option<Self> {
        match handle.runtime_flavor() {
            RuntimeFlavor::CurrentThread => Some(Self { handle }),
            _ => None,
        }
    }

    /// Run `job` on the owner thread.
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move { job() });
    }

    /// Run `job` on the owner thread once `delay` has elapsed.
    ///
    /// Aborting the returned handle before the delay elapses cancels the job.
    pub fn post_delayed<F>(&self, delay: Duration, job: F) -> AbortHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            job();
        })
    }

    fn spawn<F>(&self, future: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future).abort_handle()
    }
}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop")
            .field("flavor", &self.handle.runtime_flavor())
            .finish()
    }
}
