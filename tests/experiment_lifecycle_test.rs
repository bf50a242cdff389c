//! Experiment Registry lifecycle tests
//!
//! Covers the lifecycle graph, activation validation, optimistic
//! concurrency and the variant served outside `active`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use trueno_ab::experiment::{
    AnalysisMethod, ExperimentRecord, ExperimentRegistry, ExperimentStatus, MetricKind,
    VariantRecord,
};
use trueno_ab::Error;

fn two_arm(id: &str) -> ExperimentRecord {
    ExperimentRecord::builder(id, "Checkout button")
        .hypothesis("A green button converts better")
        .variant(VariantRecord::control("a", "Blue", 0.5))
        .variant(VariantRecord::new("b", "Green", 0.5))
        .build()
}

// =============================================================================
// ExperimentRecord
// =============================================================================

#[test]
fn test_builder_defaults() {
    let record = ExperimentRecord::new("exp-001", "Defaults");

    assert_eq!(record.experiment_id(), "exp-001");
    assert_eq!(record.status(), ExperimentStatus::Draft);
    assert_eq!(record.metric(), MetricKind::Binary);
    assert_eq!(record.method(), AnalysisMethod::Frequentist);
    assert!((record.confidence_level() - 0.95).abs() < 1e-12);
    assert!((record.alpha() - 0.05).abs() < 1e-12);
    assert!((record.power() - 0.8).abs() < 1e-12);
    assert!((record.minimum_detectable_effect() - 0.10).abs() < 1e-12);
    assert_eq!(record.min_sample_size(), 100);
    assert_eq!(record.max_runtime(), Duration::from_secs(30 * 24 * 3600));
    assert_eq!(record.version(), 0);
    assert_eq!(record.epoch(), 0);
    assert!(record.started_at().is_none());
}

#[test]
fn test_record_json_shape() {
    let json = serde_json::to_value(two_arm("exp-1")).unwrap();
    assert_eq!(json["status"], "draft");
    assert_eq!(json["metric"], "binary");
    assert_eq!(json["variants"].as_array().unwrap().len(), 2);
}

#[test]
fn test_activation_requires_valid_variants() {
    let cases = vec![
        vec![VariantRecord::control("a", "A", 1.0)],
        vec![
            VariantRecord::control("a", "A", 0.5),
            VariantRecord::control("b", "B", 0.5),
        ],
        vec![
            VariantRecord::new("a", "A", 0.5),
            VariantRecord::new("b", "B", 0.5),
        ],
        vec![
            VariantRecord::control("a", "A", 0.5),
            VariantRecord::new("a", "A again", 0.5),
        ],
        vec![
            VariantRecord::control("a", "A", 0.5),
            VariantRecord::new("b", "B", 0.4),
        ],
    ];

    for (i, variants) in cases.into_iter().enumerate() {
        let registry = ExperimentRegistry::new();
        let id = format!("exp-{i}");
        registry
            .create(ExperimentRecord::builder(id.as_str(), "Bad").variants(variants).build())
            .unwrap();
        let err = registry.transition(&id, ExperimentStatus::Active, None);
        assert!(matches!(err, Err(Error::Configuration(_))), "case {i}: {err:?}");
        assert_eq!(registry.get(&id).unwrap().status(), ExperimentStatus::Draft);
    }
}

#[test]
fn test_weights_within_tolerance_activate() {
    let registry = ExperimentRegistry::new();
    registry
        .create(
            ExperimentRecord::builder("exp-1", "Thirds")
                .variant(VariantRecord::control("a", "A", 0.333_333_4))
                .variant(VariantRecord::new("b", "B", 0.333_333_3))
                .variant(VariantRecord::new("c", "C", 0.333_333_3))
                .build(),
        )
        .unwrap();
    assert!(registry.transition("exp-1", ExperimentStatus::Active, None).is_ok());
}

#[test]
fn test_invalid_statistical_config_rejected_at_create() {
    let registry = ExperimentRegistry::new();
    let bad = ExperimentRecord::builder("exp-1", "Bad")
        .confidence_level(1.5)
        .variant(VariantRecord::control("a", "A", 0.5))
        .variant(VariantRecord::new("b", "B", 0.5))
        .build();
    assert!(matches!(registry.create(bad), Err(Error::Configuration(_))));
    assert!(registry.is_empty());
}

// =============================================================================
// Lifecycle graph
// =============================================================================

#[test]
fn test_lifecycle_graph() {
    use ExperimentStatus::{Active, Concluded, Draft, Paused, RolledBack};

    let allowed = [
        (Draft, Active),
        (Paused, Active),
        (Active, Paused),
        (Active, Concluded),
        (Active, RolledBack),
        (Paused, Concluded),
        (Paused, RolledBack),
    ];
    let all = [Draft, Active, Paused, Concluded, RolledBack];
    for from in all {
        for to in all {
            assert_eq!(
                from.can_transition_to(to),
                allowed.contains(&(from, to)),
                "{from} -> {to}"
            );
        }
    }
}

#[test]
fn test_terminal_states_reject_mutation() {
    let registry = ExperimentRegistry::new();
    registry.create(two_arm("exp-1")).unwrap();
    registry.transition("exp-1", ExperimentStatus::Active, None).unwrap();
    registry.transition("exp-1", ExperimentStatus::RolledBack, None).unwrap();

    for to in [ExperimentStatus::Active, ExperimentStatus::Paused, ExperimentStatus::Concluded] {
        assert!(matches!(
            registry.transition("exp-1", to, None),
            Err(Error::InvalidInput(_))
        ));
    }
    assert!(registry.archive("exp-1", None).unwrap().is_archived());
}

#[test]
fn test_served_variant_follows_lifecycle() {
    let registry = ExperimentRegistry::new();
    registry.create(two_arm("exp-1")).unwrap();

    let active = registry.transition("exp-1", ExperimentStatus::Active, None).unwrap();
    assert!(active.started_at().is_some());
    assert!(active.frozen_variant().is_none());

    let paused = registry.transition("exp-1", ExperimentStatus::Paused, None).unwrap();
    assert_eq!(paused.serving_variant(), Some("a"));

    let resumed = registry.transition("exp-1", ExperimentStatus::Active, None).unwrap();
    assert_eq!(resumed.started_at(), active.started_at());

    let concluded = registry.conclude("exp-1", Some("b"), None, Utc::now()).unwrap();
    assert_eq!(concluded.winning_variant(), Some("b"));
    assert_eq!(concluded.serving_variant(), Some("b"));
    assert!(concluded.ended_at().is_some());
}

#[test]
fn test_conclude_with_unknown_winner() {
    let registry = ExperimentRegistry::new();
    registry.create(two_arm("exp-1")).unwrap();
    registry.transition("exp-1", ExperimentStatus::Active, None).unwrap();
    assert!(matches!(
        registry.conclude("exp-1", Some("z"), None, Utc::now()),
        Err(Error::NotFound(_))
    ));
    assert_eq!(registry.get("exp-1").unwrap().status(), ExperimentStatus::Active);
}

// =============================================================================
// Optimistic concurrency
// =============================================================================

#[test]
fn test_version_guard() {
    let registry = ExperimentRegistry::new();
    registry.create(two_arm("exp-1")).unwrap();

    let v1 = registry.transition("exp-1", ExperimentStatus::Active, Some(0)).unwrap();
    assert_eq!(v1.version(), 1);
    assert!(matches!(
        registry.transition("exp-1", ExperimentStatus::Paused, Some(0)),
        Err(Error::Conflict(_))
    ));
    assert_eq!(
        registry
            .transition("exp-1", ExperimentStatus::Paused, Some(1))
            .unwrap()
            .version(),
        2
    );
}

#[test]
fn test_racing_conclusions_have_one_winner() {
    let registry = Arc::new(ExperimentRegistry::new());
    registry.create(two_arm("exp-1")).unwrap();
    let active = registry.transition("exp-1", ExperimentStatus::Active, None).unwrap();

    let handles: Vec<_> = ["a", "b", "a", "b"]
        .into_iter()
        .map(|winner| {
            let registry = Arc::clone(&registry);
            let version = active.version();
            std::thread::spawn(move || registry.conclude("exp-1", Some(winner), Some(version), Utc::now()))
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .filter_map(|o| o.as_ref().err())
        .all(|e| matches!(e, Error::Conflict(_))));
}

#[test]
fn test_list_orders_by_creation() {
    let registry = ExperimentRegistry::new();
    let base = Utc::now();
    for (i, id) in ["c", "a", "b"].into_iter().enumerate() {
        registry
            .create(
                ExperimentRecord::builder(id, "Ordered")
                    .created_at(base + chrono::Duration::seconds(i64::try_from(i).unwrap()))
                    .build(),
            )
            .unwrap();
    }
    let ids: Vec<String> = registry
        .list(false)
        .iter()
        .map(|r| r.experiment_id().to_string())
        .collect();
    assert_eq!(ids, vec!["c", "a", "b"]);
}
