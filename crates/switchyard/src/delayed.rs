//! # Delayed Scheduler
//!
//! Holds at most one pending event per event type. Posting a type that is
//! already pending replaces its value and restarts the timer, so the delay is
//! always measured from the latest call. Each entry carries a generation
//! number; a timer only delivers if its generation is still the current one.

use crate::event::AnyEvent;
use crate::runloop::RunLoop;
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::AbortHandle;

struct DelayedEntry {
    event: AnyEvent,
    timer: AbortHandle,
    generation: u64,
}

#[derive(Default)]
struct Entries {
    pending: HashMap<TypeId, DelayedEntry>,
    next_generation: u64,
}

/// Pending delayed events of one bus.
#[derive(Default)]
pub(crate) struct DelayedScheduler {
    entries: Mutex<Entries>,
}

impl DelayedScheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedule `event` after `delay`, replacing any pending event of its type.
    ///
    /// `on_fire` runs on the run loop with the entry's type and generation;
    /// it should claim the event through [`take`](Self::take). Returns `true`
    /// if a pending entry was replaced.
    pub(crate) fn schedule<F>(
        &self,
        event: AnyEvent,
        delay: Duration,
        run_loop: &RunLoop,
        on_fire: F,
    ) -> bool
    where
        F: FnOnce(TypeId, u64) + Send + 'static,
    {
        let type_id = event.key().id();
        let mut entries = self.entries.lock();
        entries.next_generation += 1;
        let generation = entries.next_generation;

        let timer = run_loop.post_delayed(delay, move || on_fire(type_id, generation));
        let previous = entries.pending.insert(
            type_id,
            DelayedEntry {
                event,
                timer,
                generation,
            },
        );

        match previous {
            Some(previous) => {
                previous.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `type_id` if `generation` is still current.
    pub(crate) fn take(&self, type_id: TypeId, generation: u64) -> Option<AnyEvent> {
        let mut entries = self.entries.lock();
        if entries.pending.get(&type_id)?.generation != generation {
            return None;
        }
        entries.pending.remove(&type_id).map(|entry| entry.event)
    }

    /// Drop the pending entry for `type_id`. Returns whether one existed.
    pub(crate) fn cancel(&self, type_id: TypeId) -> bool {
        let removed = self.entries.lock().pending.remove(&type_id);
        match removed {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Drop every pending entry. Returns how many were cancelled.
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<DelayedEntry> = self
            .entries
            .lock()
            .pending
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &drained {
            entry.timer.abort();
        }
        drained.len()
    }

    pub(crate) fn contains(&self, type_id: TypeId) -> bool {
        self.entries.lock().pending.contains_key(&type_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().pending.len()
    }
}
