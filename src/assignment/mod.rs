//! Assignment Engine: deterministic visitor-to-variant placement
//!
//! A visitor's variant is a pure function of `(experiment_id, epoch,
//! visitor_id)` and the declared variant weights:
//!
//! 1. Hash the key with `FxHasher` (no per-process random state) and mix it
//!    with a `SplitMix64` finalizer so nearby IDs spread over the full range.
//! 2. Map the top 53 bits to a uniform point in `[0, 1)`.
//! 3. Walk the variants in declared order and return the first whose
//!    cumulative weight exceeds the point.
//!
//! The stored assignment, when present, always wins; the hash only decides
//! first placements. Storage failures degrade to the hash so serving never
//! fails because a store is down.
//!
//! # Example
//!
//! ```rust
//! use trueno_ab::assignment::bucket;
//!
//! let u = bucket("exp-001", 0, "visitor-42");
//! assert!((0.0..1.0).contains(&u));
//! assert_eq!(u, bucket("exp-001", 0, "visitor-42"));
//! ```

mod store;

pub use store::{AssignmentStore, MemoryAssignmentStore};

use std::hash::Hasher;
use std::sync::Arc;

use rustc_hash::FxHasher;
use tracing::{debug, warn};

use crate::experiment::{
    AssignmentRecord, ExperimentRecord, ExperimentRegistry, ExperimentStatus, VariantRecord,
};
use crate::{Error, Result};

/// Longest accepted visitor identifier in bytes.
pub const MAX_VISITOR_ID_LEN: usize = 256;

/// Stable point in `[0, 1)` for a visitor in an experiment epoch.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bucket(experiment_id: &str, epoch: u32, visitor_id: &str) -> f64 {
    let mut hasher = FxHasher::default();
    hasher.write(experiment_id.as_bytes());
    hasher.write_u8(0xff);
    hasher.write_u32(epoch);
    hasher.write(visitor_id.as_bytes());
    let mixed = splitmix64(hasher.finish());
    (mixed >> 11) as f64 / (1u64 << 53) as f64
}

const fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Pick the variant whose cumulative weight range contains `point`.
///
/// Returns `None` only when there are no variants.
#[must_use]
pub fn select_variant(variants: &[VariantRecord], point: f64) -> Option<&VariantRecord> {
    let mut cumulative = 0.0;
    for variant in variants {
        cumulative += variant.weight();
        if point < cumulative {
            return Some(variant);
        }
    }
    // Rounding left the point past the last boundary
    variants.iter().rev().find(|v| v.weight() > 0.0).or_else(|| variants.last())
}

/// Pure hash assignment, ignoring any stored record.
#[must_use]
pub fn hash_assign<'a>(experiment: &'a ExperimentRecord, visitor_id: &str) -> Option<&'a VariantRecord> {
    let point = bucket(experiment.experiment_id(), experiment.epoch(), visitor_id);
    select_variant(experiment.variants(), point)
}

/// Reject empty, blank and oversized visitor IDs.
///
/// # Errors
///
/// `InvalidInput` describing the problem.
pub fn validate_visitor_id(visitor_id: &str) -> Result<()> {
    if visitor_id.trim().is_empty() {
        return Err(Error::InvalidInput("visitor id must not be empty".to_string()));
    }
    if visitor_id.len() > MAX_VISITOR_ID_LEN {
        return Err(Error::InvalidInput(format!(
            "visitor id is {} bytes, limit is {MAX_VISITOR_ID_LEN}",
            visitor_id.len()
        )));
    }
    Ok(())
}

/// Places visitors into variants, consulting the registry and a sticky store.
pub struct AssignmentEngine<S: AssignmentStore = MemoryAssignmentStore> {
    registry: Arc<ExperimentRegistry>,
    store: Arc<S>,
}

impl<S: AssignmentStore> AssignmentEngine<S> {
    /// Create an engine over a registry and store.
    #[must_use]
    pub const fn new(registry: Arc<ExperimentRegistry>, store: Arc<S>) -> Self {
        Self { registry, store }
    }

    /// Get the backing store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Variant for a visitor.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for a malformed visitor ID
    /// - `NotFound` for an unknown experiment
    /// - `Configuration` if the experiment has no variants to serve
    pub async fn assign(&self, experiment_id: &str, visitor_id: &str) -> Result<String> {
        let experiment = self.registry.get(experiment_id)?;
        self.assign_in(&experiment, visitor_id).await
    }

    /// Variant for a visitor given an already loaded experiment.
    ///
    /// # Errors
    ///
    /// As [`assign`](Self::assign), minus the registry lookup.
    pub async fn assign_in(&self, experiment: &ExperimentRecord, visitor_id: &str) -> Result<String> {
        validate_visitor_id(visitor_id)?;
        let experiment_id = experiment.experiment_id();

        if experiment.status() != ExperimentStatus::Active {
            return experiment
                .serving_variant()
                .map(str::to_string)
                .ok_or_else(|| no_variants(experiment_id));
        }

        match self.store.get(experiment_id, visitor_id).await {
            Ok(Some(stored)) if stored.epoch() == experiment.epoch() => {
                return Ok(stored.variant_id().to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(experiment_id, error = %e, "assignment lookup failed; using hash");
            }
        }

        let hashed = hash_assign(experiment, visitor_id)
            .ok_or_else(|| no_variants(experiment_id))?
            .variant_id()
            .to_string();

        let record = AssignmentRecord::new(experiment_id, visitor_id, hashed.as_str(), experiment.epoch());
        match self.store.insert_if_absent(record).await {
            Ok(stored) => {
                if stored.variant_id() != hashed {
                    debug!(experiment_id, visitor_id, "concurrent first assignment resolved");
                }
                Ok(stored.variant_id().to_string())
            }
            Err(e) => {
                warn!(experiment_id, error = %e, "assignment write failed; serving hash");
                Ok(hashed)
            }
        }
    }

    /// Drop stored assignments of an experiment (used on reset).
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn reset_experiment(&self, experiment_id: &str) -> Result<usize> {
        let removed = self.store.remove_experiment(experiment_id).await?;
        debug!(experiment_id, removed, "assignments cleared");
        Ok(removed)
    }
}

fn no_variants(experiment_id: &str) -> Error {
    Error::Configuration(format!("experiment '{experiment_id}' has no variant to serve"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ExperimentRecord;

    struct FailingStore;

    impl AssignmentStore for FailingStore {
        async fn get(&self, _: &str, _: &str) -> Result<Option<AssignmentRecord>> {
            Err(Error::StorageError("offline".to_string()))
        }

        async fn insert_if_absent(&self, _: AssignmentRecord) -> Result<AssignmentRecord> {
            Err(Error::StorageError("offline".to_string()))
        }

        async fn remove_experiment(&self, _: &str) -> Result<usize> {
            Err(Error::StorageError("offline".to_string()))
        }

        async fn count(&self, _: &str) -> Result<usize> {
            Err(Error::StorageError("offline".to_string()))
        }
    }

    fn active_registry() -> Arc<ExperimentRegistry> {
        let registry = Arc::new(ExperimentRegistry::new());
        registry
            .create(
                ExperimentRecord::builder("exp-1", "Test")
                    .variant(VariantRecord::control("a", "A", 0.5))
                    .variant(VariantRecord::new("b", "B", 0.5))
                    .build(),
            )
            .unwrap();
        registry.transition("exp-1", ExperimentStatus::Active, None).unwrap();
        registry
    }

    #[test]
    fn test_bucket_is_stable_and_uniform_range() {
        let a = bucket("exp", 0, "visitor");
        assert_eq!(a, bucket("exp", 0, "visitor"));
        assert!((0.0..1.0).contains(&a));
        assert_ne!(a, bucket("exp", 1, "visitor"));
        assert_ne!(a, bucket("exp2", 0, "visitor"));
    }

    #[test]
    fn test_select_variant_boundaries() {
        let variants = vec![
            VariantRecord::control("a", "A", 0.25),
            VariantRecord::new("b", "B", 0.75),
        ];
        assert_eq!(select_variant(&variants, 0.0).unwrap().variant_id(), "a");
        assert_eq!(select_variant(&variants, 0.2499).unwrap().variant_id(), "a");
        assert_eq!(select_variant(&variants, 0.25).unwrap().variant_id(), "b");
        assert_eq!(select_variant(&variants, 0.999_999_9).unwrap().variant_id(), "b");
        assert!(select_variant(&[], 0.5).is_none());
    }

    #[test]
    fn test_zero_weight_variant_never_selected() {
        let variants = vec![
            VariantRecord::control("a", "A", 1.0),
            VariantRecord::new("b", "B", 0.0),
        ];
        for i in 0..1000 {
            let point = f64::from(i) / 1000.0;
            assert_eq!(select_variant(&variants, point).unwrap().variant_id(), "a");
        }
    }

    #[test]
    fn test_visitor_id_validation() {
        assert!(validate_visitor_id("v-1").is_ok());
        assert!(validate_visitor_id("").is_err());
        assert!(validate_visitor_id("   ").is_err());
        assert!(validate_visitor_id(&"x".repeat(MAX_VISITOR_ID_LEN)).is_ok());
        assert!(validate_visitor_id(&"x".repeat(MAX_VISITOR_ID_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn test_assign_is_sticky() {
        let engine = AssignmentEngine::new(active_registry(), Arc::new(MemoryAssignmentStore::new()));
        let first = engine.assign("exp-1", "visitor-1").await.unwrap();
        for _ in 0..10 {
            assert_eq!(engine.assign("exp-1", "visitor-1").await.unwrap(), first);
        }
        assert_eq!(engine.store().count("exp-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stored_assignment_wins_over_hash() {
        let registry = active_registry();
        let store = Arc::new(MemoryAssignmentStore::new());
        let experiment = registry.get("exp-1").unwrap();
        let hashed = hash_assign(&experiment, "visitor-1").unwrap().variant_id().to_string();
        let other = if hashed == "a" { "b" } else { "a" };
        store
            .insert_if_absent(AssignmentRecord::new("exp-1", "visitor-1", other, 0))
            .await
            .unwrap();

        let engine = AssignmentEngine::new(registry, store);
        assert_eq!(engine.assign("exp-1", "visitor-1").await.unwrap(), other);
    }

    #[tokio::test]
    async fn test_storage_failure_falls_back_to_hash() {
        let registry = active_registry();
        let experiment = registry.get("exp-1").unwrap();
        let engine = AssignmentEngine::new(registry, Arc::new(FailingStore));

        let expected = hash_assign(&experiment, "visitor-9").unwrap().variant_id().to_string();
        assert_eq!(engine.assign("exp-1", "visitor-9").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_inactive_experiment_serves_frozen_variant() {
        let registry = active_registry();
        registry
            .conclude("exp-1", Some("b"), None, chrono::Utc::now())
            .unwrap();
        let engine = AssignmentEngine::new(registry, Arc::new(MemoryAssignmentStore::new()));

        for i in 0..20 {
            let visitor = format!("visitor-{i}");
            assert_eq!(engine.assign("exp-1", &visitor).await.unwrap(), "b");
        }
        assert_eq!(engine.store().count("exp-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_experiment_and_bad_visitor() {
        let engine = AssignmentEngine::new(active_registry(), Arc::new(MemoryAssignmentStore::new()));
        assert!(matches!(engine.assign("nope", "v").await, Err(Error::NotFound(_))));
        assert!(matches!(engine.assign("exp-1", " ").await, Err(Error::InvalidInput(_))));
    }
}
