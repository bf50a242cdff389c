//! Experiment Registry - concurrent store of experiment definitions
//!
//! Every mutation goes through one path: take the per-id entry lock, check
//! the caller's expected version, apply the change to a copy, bump the
//! version and swap it in. A failed mutation leaves the stored record
//! untouched, and two racing mutations with the same expected version see
//! exactly one winner; the loser gets `Conflict`.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::{ExperimentRecord, ExperimentStatus, VariantRecord};
use crate::decision::Decision;
use crate::{Error, Result};

/// In-memory registry of experiments keyed by ID.
///
/// Records are never deleted. Readers receive clones, so a snapshot stays
/// consistent while the registry moves on.
#[derive(Debug, Default)]
pub struct ExperimentRegistry {
    experiments: DashMap<String, ExperimentRecord>,
}

impl ExperimentRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the registry holds no experiments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    /// Get the number of experiments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    /// Register a new draft experiment.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the record is not a draft
    /// - `Configuration` if the statistical settings are invalid
    /// - `Conflict` if the ID is taken
    pub fn create(&self, record: ExperimentRecord) -> Result<ExperimentRecord> {
        if record.status() != ExperimentStatus::Draft {
            return Err(Error::InvalidInput(format!(
                "new experiments must start as draft, got {}",
                record.status()
            )));
        }
        record.validate_config()?;

        match self.experiments.entry(record.experiment_id().to_string()) {
            Entry::Occupied(_) => Err(Error::Conflict(format!(
                "experiment '{}' already exists",
                record.experiment_id()
            ))),
            Entry::Vacant(slot) => {
                info!(
                    experiment_id = record.experiment_id(),
                    variants = record.variants().len(),
                    "experiment created"
                );
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    /// Re-register a record saved by an earlier process.
    ///
    /// Unlike [`create`](Self::create) the record keeps its status,
    /// version and epoch.
    ///
    /// # Errors
    ///
    /// - `Configuration` if the statistical settings are invalid
    /// - `Conflict` if the ID is taken
    pub fn restore(&self, record: ExperimentRecord) -> Result<()> {
        record.validate_config()?;
        match self.experiments.entry(record.experiment_id().to_string()) {
            Entry::Occupied(_) => Err(Error::Conflict(format!(
                "experiment '{}' already exists",
                record.experiment_id()
            ))),
            Entry::Vacant(slot) => {
                debug!(
                    experiment_id = record.experiment_id(),
                    status = %record.status(),
                    version = record.version(),
                    "experiment restored"
                );
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Get a copy of an experiment.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown ID.
    pub fn get(&self, experiment_id: &str) -> Result<ExperimentRecord> {
        self.experiments
            .get(experiment_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| not_found(experiment_id))
    }

    /// Check if an experiment exists.
    #[must_use]
    pub fn contains(&self, experiment_id: &str) -> bool {
        self.experiments.contains_key(experiment_id)
    }

    /// All experiments ordered by creation time, optionally including archived ones.
    #[must_use]
    pub fn list(&self, include_archived: bool) -> Vec<ExperimentRecord> {
        let mut records: Vec<ExperimentRecord> = self
            .experiments
            .iter()
            .filter(|r| include_archived || !r.is_archived())
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.experiment_id().cmp(b.experiment_id()))
        });
        records
    }

    /// IDs of experiments currently in `status`, sorted.
    #[must_use]
    pub fn ids_with_status(&self, status: ExperimentStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .experiments
            .iter()
            .filter(|r| r.status() == status)
            .map(|r| r.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Replace the variants of a draft experiment.
    ///
    /// Variant validity is checked on activation, not here.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Conflict` on a stale version, `InvalidInput` outside `draft`.
    pub fn update_variants(
        &self,
        experiment_id: &str,
        variants: Vec<VariantRecord>,
        expected_version: Option<u64>,
    ) -> Result<ExperimentRecord> {
        self.mutate(experiment_id, expected_version, "update_variants", |record| {
            if record.status() != ExperimentStatus::Draft {
                return Err(Error::InvalidInput(format!(
                    "variants of '{experiment_id}' can only change in draft, status is {}",
                    record.status()
                )));
            }
            record.replace_variants(variants);
            Ok(())
        })
    }

    /// Move an experiment to `to` at the current time.
    ///
    /// # Errors
    ///
    /// See [`transition_at`](Self::transition_at).
    pub fn transition(
        &self,
        experiment_id: &str,
        to: ExperimentStatus,
        expected_version: Option<u64>,
    ) -> Result<ExperimentRecord> {
        self.transition_at(experiment_id, to, expected_version, Utc::now())
    }

    /// Move an experiment to `to`, stamping lifecycle timestamps with `now`.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown ID
    /// - `Conflict` on a stale expected version
    /// - `InvalidInput` for a move the lifecycle does not allow
    /// - `Configuration` when activation requirements are not met
    pub fn transition_at(
        &self,
        experiment_id: &str,
        to: ExperimentStatus,
        expected_version: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<ExperimentRecord> {
        self.mutate(experiment_id, expected_version, to.as_str(), |record| {
            record.apply_transition(to, None, now)
        })
    }

    /// Conclude an experiment, optionally naming the winning variant.
    ///
    /// Without a winner the control keeps serving.
    ///
    /// # Errors
    ///
    /// As [`transition_at`](Self::transition_at), plus `NotFound` for an unknown winner.
    pub fn conclude(
        &self,
        experiment_id: &str,
        winner: Option<&str>,
        expected_version: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<ExperimentRecord> {
        self.mutate(experiment_id, expected_version, "conclude", |record| {
            record.apply_transition(ExperimentStatus::Concluded, winner, now)
        })
    }

    /// Conclude an experiment as a stopping decision says, keeping the decision on the record.
    ///
    /// Later evaluations of the concluded experiment return this decision,
    /// including after a checkpoint restore.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a non-stopping decision; otherwise as [`conclude`](Self::conclude).
    pub fn conclude_with(&self, decision: &Decision, expected_version: Option<u64>) -> Result<ExperimentRecord> {
        let experiment_id = decision.experiment_id.as_str();
        if !decision.action.is_stop() {
            return Err(Error::InvalidInput(format!(
                "decision for '{experiment_id}' does not stop the experiment"
            )));
        }
        self.mutate(experiment_id, expected_version, "conclude", |record| {
            record.apply_transition(
                ExperimentStatus::Concluded,
                decision.action.winner(),
                decision.decided_at,
            )?;
            record.set_conclusion(decision.clone());
            Ok(())
        })
    }

    /// Hide a draft or finished experiment from default listings.
    ///
    /// # Errors
    ///
    /// `InvalidInput` while the experiment is active or paused.
    pub fn archive(&self, experiment_id: &str, expected_version: Option<u64>) -> Result<ExperimentRecord> {
        self.mutate(experiment_id, expected_version, "archive", |record| {
            let status = record.status();
            if !(status.is_terminal() || status == ExperimentStatus::Draft) {
                return Err(Error::InvalidInput(format!(
                    "experiment '{experiment_id}' is {status}; stop it before archiving"
                )));
            }
            record.set_archived();
            Ok(())
        })
    }

    /// Start a new epoch for a draft or paused experiment.
    ///
    /// Callers must also drop the experiment's assignments and statistics.
    ///
    /// # Errors
    ///
    /// `InvalidInput` in any other status.
    pub fn reset(&self, experiment_id: &str, expected_version: Option<u64>) -> Result<ExperimentRecord> {
        self.mutate(experiment_id, expected_version, "reset", |record| {
            let status = record.status();
            if !matches!(status, ExperimentStatus::Draft | ExperimentStatus::Paused) {
                return Err(Error::InvalidInput(format!(
                    "experiment '{experiment_id}' can only be reset in draft or paused, status is {status}"
                )));
            }
            record.advance_epoch();
            Ok(())
        })
    }

    fn mutate<F>(
        &self,
        experiment_id: &str,
        expected_version: Option<u64>,
        action: &str,
        apply: F,
    ) -> Result<ExperimentRecord>
    where
        F: FnOnce(&mut ExperimentRecord) -> Result<()>,
    {
        // Holding the entry guard serializes mutations of this ID.
        let mut entry = self
            .experiments
            .get_mut(experiment_id)
            .ok_or_else(|| not_found(experiment_id))?;

        if let Some(expected) = expected_version {
            if entry.version() != expected {
                debug!(
                    experiment_id,
                    action,
                    expected,
                    actual = entry.version(),
                    "version conflict"
                );
                return Err(Error::Conflict(format!(
                    "experiment '{experiment_id}' is at version {}, expected {expected}",
                    entry.version()
                )));
            }
        }

        let before = entry.status();
        let mut next = entry.value().clone();
        apply(&mut next)?;
        next.bump_version();

        info!(
            experiment_id,
            action,
            from = %before,
            to = %next.status(),
            version = next.version(),
            epoch = next.epoch(),
            "experiment updated"
        );
        *entry = next.clone();
        Ok(next)
    }
}

fn not_found(experiment_id: &str) -> Error {
    Error::NotFound(format!("experiment '{experiment_id}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn draft(id: &str) -> ExperimentRecord {
        ExperimentRecord::builder(id, "Test")
            .variant(VariantRecord::control("a", "A", 0.5))
            .variant(VariantRecord::new("b", "B", 0.5))
            .build()
    }

    #[test]
    fn test_registry_default() {
        let registry = ExperimentRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(matches!(registry.get("missing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_create_rejects_duplicates() {
        let registry = ExperimentRegistry::new();
        registry.create(draft("exp-1")).unwrap();
        assert!(matches!(registry.create(draft("exp-1")), Err(Error::Conflict(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_transition_bumps_version() {
        let registry = ExperimentRegistry::new();
        registry.create(draft("exp-1")).unwrap();

        let active = registry
            .transition("exp-1", ExperimentStatus::Active, Some(0))
            .unwrap();
        assert_eq!(active.status(), ExperimentStatus::Active);
        assert_eq!(active.version(), 1);
        assert_eq!(registry.ids_with_status(ExperimentStatus::Active), vec!["exp-1"]);
    }

    #[test]
    fn test_stale_version_conflicts() {
        let registry = ExperimentRegistry::new();
        registry.create(draft("exp-1")).unwrap();
        registry.transition("exp-1", ExperimentStatus::Active, Some(0)).unwrap();

        let err = registry.transition("exp-1", ExperimentStatus::Paused, Some(0));
        assert!(matches!(err, Err(Error::Conflict(_))));
        assert_eq!(registry.get("exp-1").unwrap().status(), ExperimentStatus::Active);
    }

    #[test]
    fn test_failed_mutation_leaves_record_untouched() {
        let registry = ExperimentRegistry::new();
        let mut bad = draft("exp-1");
        bad.replace_variants(vec![VariantRecord::control("a", "A", 1.0)]);
        registry.create(bad).unwrap();

        assert!(registry.transition("exp-1", ExperimentStatus::Active, None).is_err());
        let record = registry.get("exp-1").unwrap();
        assert_eq!(record.status(), ExperimentStatus::Draft);
        assert_eq!(record.version(), 0);
    }

    #[test]
    fn test_variant_edits_only_in_draft() {
        let registry = ExperimentRegistry::new();
        registry.create(draft("exp-1")).unwrap();
        let variants = vec![
            VariantRecord::control("a", "A", 0.6),
            VariantRecord::new("b", "B", 0.4),
        ];
        registry.update_variants("exp-1", variants.clone(), None).unwrap();
        registry.transition("exp-1", ExperimentStatus::Active, None).unwrap();
        assert!(matches!(
            registry.update_variants("exp-1", variants, None),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_reset_and_archive_rules() {
        let registry = ExperimentRegistry::new();
        registry.create(draft("exp-1")).unwrap();
        registry.transition("exp-1", ExperimentStatus::Active, None).unwrap();

        assert!(registry.reset("exp-1", None).is_err());
        assert!(registry.archive("exp-1", None).is_err());

        registry.transition("exp-1", ExperimentStatus::Paused, None).unwrap();
        let reset = registry.reset("exp-1", None).unwrap();
        assert_eq!(reset.epoch(), 1);

        registry.conclude("exp-1", None, None, Utc::now()).unwrap();
        let archived = registry.archive("exp-1", None).unwrap();
        assert!(archived.is_archived());
        assert!(registry.list(false).is_empty());
        assert_eq!(registry.list(true).len(), 1);
    }

    #[test]
    fn test_restore_keeps_lifecycle_state() {
        let source = ExperimentRegistry::new();
        source.create(draft("exp-1")).unwrap();
        source.transition("exp-1", ExperimentStatus::Active, None).unwrap();
        let saved = source.get("exp-1").unwrap();

        let target = ExperimentRegistry::new();
        target.restore(saved.clone()).unwrap();
        assert_eq!(target.get("exp-1").unwrap(), saved);
        assert!(matches!(target.restore(saved), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_conclude_with_keeps_decision_on_record() {
        use crate::decision::Action;

        let registry = ExperimentRegistry::new();
        registry.create(draft("exp-1")).unwrap();
        registry.transition("exp-1", ExperimentStatus::Active, None).unwrap();

        let decision = Decision {
            experiment_id: "exp-1".to_string(),
            action: Action::StopFutility,
            analysis_sequence: Some(7),
            rule: "futility".to_string(),
            reason: "conditional power 0.02".to_string(),
            decided_at: Utc::now(),
        };
        let concluded = registry.conclude_with(&decision, Some(1)).unwrap();
        assert_eq!(concluded.status(), ExperimentStatus::Concluded);
        assert_eq!(concluded.conclusion(), Some(&decision));
        assert_eq!(concluded.ended_at(), Some(decision.decided_at));
        assert!(concluded.winning_variant().is_none());

        // The decision survives serialization with the record
        let json = serde_json::to_string(&concluded).unwrap();
        let back: ExperimentRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.conclusion(), Some(&decision));
    }

    #[test]
    fn test_conclude_with_rejects_continue() {
        use crate::decision::Action;

        let registry = ExperimentRegistry::new();
        registry.create(draft("exp-1")).unwrap();
        registry.transition("exp-1", ExperimentStatus::Active, None).unwrap();
        let decision = Decision {
            experiment_id: "exp-1".to_string(),
            action: Action::Continue,
            analysis_sequence: None,
            rule: "otherwise".to_string(),
            reason: String::new(),
            decided_at: Utc::now(),
        };
        assert!(matches!(
            registry.conclude_with(&decision, None),
            Err(Error::InvalidInput(_))
        ));
        assert!(registry.get("exp-1").unwrap().conclusion().is_none());
    }

    #[test]
    fn test_concurrent_transitions_single_winner() {
        let registry = Arc::new(ExperimentRegistry::new());
        registry.create(draft("exp-1")).unwrap();
        registry.transition("exp-1", ExperimentStatus::Active, None).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.transition("exp-1", ExperimentStatus::Paused, Some(1))
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Result::is_ok)
            .count();
        assert_eq!(winners, 1);
    }
}
