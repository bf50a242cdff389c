//! Assignment persistence.
//!
//! The store only needs one write primitive: insert-if-absent. Two requests
//! racing to place the same new visitor both call it; the first write wins
//! and both get the stored record back, so they converge on one variant.

use std::future::Future;

use dashmap::DashMap;

use crate::experiment::AssignmentRecord;
use crate::Result;

/// Storage backend for sticky assignments.
///
/// Async-first so network-backed stores fit behind the same interface as
/// the in-memory default.
pub trait AssignmentStore: Send + Sync {
    /// Get the stored assignment for a visitor, if any.
    fn get(
        &self,
        experiment_id: &str,
        visitor_id: &str,
    ) -> impl Future<Output = Result<Option<AssignmentRecord>>> + Send;

    /// Store `record` unless the visitor already has one; return the stored record.
    fn insert_if_absent(
        &self,
        record: AssignmentRecord,
    ) -> impl Future<Output = Result<AssignmentRecord>> + Send;

    /// Drop every assignment of an experiment, returning how many were removed.
    fn remove_experiment(&self, experiment_id: &str) -> impl Future<Output = Result<usize>> + Send;

    /// Number of assignments stored for an experiment.
    fn count(&self, experiment_id: &str) -> impl Future<Output = Result<usize>> + Send;
}

/// In-memory assignment store using `DashMap`.
///
/// Data is lost on process restart; assignments are then recomputed from
/// the same stable hash, so visitors keep their variant as long as the
/// experiment's variants and epoch are unchanged.
///
/// # Example
///
/// ```rust
/// use trueno_ab::assignment::{AssignmentStore, MemoryAssignmentStore};
/// use trueno_ab::experiment::AssignmentRecord;
///
/// # async fn example() -> trueno_ab::Result<()> {
/// let store = MemoryAssignmentStore::new();
/// let first = store.insert_if_absent(AssignmentRecord::new("exp", "v-1", "a", 0)).await?;
/// let second = store.insert_if_absent(AssignmentRecord::new("exp", "v-1", "b", 0)).await?;
/// assert_eq!(second.variant_id(), first.variant_id());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryAssignmentStore {
    experiments: DashMap<String, DashMap<String, AssignmentRecord>>,
}

impl MemoryAssignmentStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total assignments across all experiments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.experiments.iter().map(|e| e.value().len()).sum()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.experiments.clear();
    }
}

impl AssignmentStore for MemoryAssignmentStore {
    async fn get(&self, experiment_id: &str, visitor_id: &str) -> Result<Option<AssignmentRecord>> {
        Ok(self
            .experiments
            .get(experiment_id)
            .and_then(|visitors| visitors.get(visitor_id).map(|r| r.value().clone())))
    }

    async fn insert_if_absent(&self, record: AssignmentRecord) -> Result<AssignmentRecord> {
        let visitors = self
            .experiments
            .entry(record.experiment_id().to_string())
            .or_default()
            .downgrade();
        let stored = visitors
            .entry(record.visitor_id().to_string())
            .or_insert(record)
            .value()
            .clone();
        Ok(stored)
    }

    async fn remove_experiment(&self, experiment_id: &str) -> Result<usize> {
        Ok(self
            .experiments
            .remove(experiment_id)
            .map_or(0, |(_, visitors)| visitors.len()))
    }

    async fn count(&self, experiment_id: &str) -> Result<usize> {
        Ok(self.experiments.get(experiment_id).map_or(0, |v| v.len()))
    }
}
