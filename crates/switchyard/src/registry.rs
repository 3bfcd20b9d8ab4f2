//! # Binding Registry
//!
//! Process-wide cache of [`BindingTable`]s keyed by concrete type. Discovery
//! runs once per type, not per instance; tables are shared read-only by every
//! bus and every instance afterwards.

use crate::binding::{BindingTable, BusObject};
use crate::error::BusResult;
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Memoized `type → bindings` lookup.
#[derive(Debug, Default)]
pub struct BindingRegistry {
    tables: RwLock<HashMap<TypeId, Arc<BindingTable>>>,
}

impl BindingRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bindings of `T`, discovering them on first use.
    ///
    /// Two threads racing on the first lookup may both run discovery; the
    /// first table stored wins and both results are identical. A type whose
    /// discovery fails is not cached and fails again on every lookup.
    ///
    /// # Errors
    ///
    /// `BusError::BindingConflict` if `T` declares conflicting bindings.
    pub fn bindings_for<T: BusObject>(&self) -> BusResult<Arc<BindingTable>> {
        let type_id = TypeId::of::<T>();
        if let Some(table) = self.tables.read().get(&type_id) {
            return Ok(table.clone());
        }

        let table = Arc::new(BindingTable::discover::<T>()?);
        debug!(
            object_type = table.object_type(),
            subscribers = table.subscribed_events().count(),
            producers = table.produced_events().count(),
            "Bindings discovered"
        );

        Ok(self.tables.write().entry(type_id).or_insert(table).clone())
    }

    /// Number of cached tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    /// Whether nothing has been discovered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }

    /// Forget every cached table.
    pub fn clear(&self) {
        self.tables.write().clear();
    }
}
