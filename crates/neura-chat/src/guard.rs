//! Context guard: refuses a decode that would fill the engine's cache.

use neura_engine::InferenceEngine;

/// Capacity precondition checked before every decode step.
///
/// A batch is admitted only while `used + pending` stays strictly below the
/// capacity; reaching the capacity exactly is already refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextGuard;

impl ContextGuard {
    /// Pure admission rule.
    pub fn admits(used: usize, pending: usize, capacity: usize) -> bool {
        used.saturating_add(pending) < capacity
    }

    /// Check `pending` new cells against the engine's current occupancy.
    pub fn admit<E: InferenceEngine + ?Sized>(&self, engine: &E, pending: usize) -> bool {
        let used = engine.cache_used();
        let capacity = engine.capacity();
        let admitted = Self::admits(used, pending, capacity);
        if !admitted {
            tracing::warn!(used, pending, capacity, "Context full, refusing decode");
        }
        admitted
    }
}
