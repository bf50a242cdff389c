//! Statistics Aggregator: incremental per-variant running statistics
//!
//! Counters live in an arena addressed by `(experiment_id, variant_id)`.
//! Recording an event is O(1):
//!
//! - the dedupe key is claimed in a concurrent set (a retry is a no-op)
//! - the visitor's state entry is locked (participant/converted flags and
//!   running metric total)
//! - the variant's atomic counters are bumped
//!
//! No lock spans more than one visitor, and variants never block each other.
//! The continuous metric is the per-visitor total, so a second metric event
//! from the same visitor moves `sum_sq` by `(a + v)² − a²` rather than
//! adding `v²`.
//!
//! Counters are a cache of the event log: [`StatisticsAggregator::reconcile`]
//! rebuilds them from events and reports drift, and
//! [`StatisticsAggregator::replay`] restores them after a restart.

mod counters;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::experiment::{EventRecord, EventType, ExperimentRecord};
use crate::stats::{MeanSample, ProportionSample};
use counters::VariantCounters;

/// Outcome of recording one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ack {
    /// Counted.
    Accepted,
    /// Dedupe key already seen; nothing changed.
    Duplicate,
    /// Event belongs to an earlier epoch; ignored.
    Stale,
}

/// Point-in-time statistics for one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningStatistics {
    /// Variant ID
    pub variant_id: String,
    /// Distinct visitors with any event
    pub participants: u64,
    /// Distinct converting visitors
    pub conversions: u64,
    /// Sum of per-visitor metric totals
    pub sum: f64,
    /// Sum of squared per-visitor metric totals
    pub sum_sq: f64,
    /// Timestamp of the newest counted event
    pub last_updated: Option<DateTime<Utc>>,
}

impl RunningStatistics {
    fn empty(variant_id: &str) -> Self {
        Self {
            variant_id: variant_id.to_string(),
            participants: 0,
            conversions: 0,
            sum: 0.0,
            sum_sq: 0.0,
            last_updated: None,
        }
    }

    /// Conversion rate, `0.0` without participants.
    #[must_use]
    pub fn conversion_rate(&self) -> f64 {
        self.proportion().rate()
    }

    /// Counts as a binary sample.
    #[must_use]
    pub const fn proportion(&self) -> ProportionSample {
        ProportionSample::new(self.conversions, self.participants)
    }

    /// Moments of the per-visitor metric, `None` below two participants.
    #[must_use]
    pub fn mean_sample(&self) -> Option<MeanSample> {
        MeanSample::from_sums(self.participants, self.sum, self.sum_sq)
    }

    fn agrees_with(&self, other: &Self) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0);
        self.variant_id == other.variant_id
            && self.participants == other.participants
            && self.conversions == other.conversions
            && close(self.sum, other.sum)
            && close(self.sum_sq, other.sum_sq)
    }
}

/// Published after every accepted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotUpdated {
    /// Experiment whose statistics changed
    pub experiment_id: String,
    /// Epoch of the counters
    pub epoch: u32,
    /// Gateway timestamp of the triggering event
    pub at: DateTime<Utc>,
}

/// Result of rebuilding an experiment's counters from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Whether live counters disagreed with the log
    pub drifted: bool,
    /// Live counters before the rebuild
    pub before: Vec<RunningStatistics>,
    /// Counters recomputed from the log (now live)
    pub after: Vec<RunningStatistics>,
}

/// Tally of a log replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    /// Events counted
    pub accepted: usize,
    /// Events already counted
    pub duplicates: usize,
    /// Events from superseded epochs
    pub stale: usize,
}

#[derive(Debug)]
struct VisitorState {
    variant_id: String,
    participant: bool,
    converted: bool,
    total: f64,
}

#[derive(Debug)]
struct ExperimentCounters {
    epoch: u32,
    variants: DashMap<String, Arc<VariantCounters>>,
    visitors: DashMap<String, VisitorState>,
    seen: DashSet<String>,
}

impl ExperimentCounters {
    fn new(epoch: u32) -> Self {
        Self {
            epoch,
            variants: DashMap::new(),
            visitors: DashMap::new(),
            seen: DashSet::new(),
        }
    }

    fn variant(&self, variant_id: &str) -> Arc<VariantCounters> {
        if let Some(existing) = self.variants.get(variant_id) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.variants.entry(variant_id.to_string()).or_default().value())
    }

    fn apply(&self, event: &EventRecord) -> Ack {
        if !self.seen.insert(event.dedupe_key().to_string()) {
            return Ack::Duplicate;
        }

        let mut visitor = self
            .visitors
            .entry(event.visitor_id().to_string())
            .or_insert_with(|| VisitorState {
                variant_id: event.variant_id().to_string(),
                participant: false,
                converted: false,
                total: 0.0,
            });
        // Attribute to the variant the visitor was first seen in
        let counters = self.variant(&visitor.variant_id);

        // Any event implies participation
        if !visitor.participant {
            visitor.participant = true;
            counters.add_participant();
        }

        if event.event_type() == EventType::Conversion && !visitor.converted {
            visitor.converted = true;
            counters.add_conversion();
        }
        // Conversion values (e.g. order amount) feed the continuous metric too
        if let Some(value) = event.value().filter(|v| v.is_finite()) {
            if event.event_type() != EventType::Exposure {
                let before = visitor.total;
                visitor.total += value;
                counters.shift_total(before, visitor.total);
            }
        }
        counters.touch(event.timestamp());
        Ack::Accepted
    }

    fn snapshot(&self, experiment: &ExperimentRecord) -> Vec<RunningStatistics> {
        ordered_variant_ids(experiment)
            .into_iter()
            .map(|id| {
                self.variants.get(id).map_or_else(
                    || RunningStatistics::empty(id),
                    |c| RunningStatistics {
                        variant_id: id.to_string(),
                        participants: c.participants(),
                        conversions: c.conversions(),
                        sum: c.sum(),
                        sum_sq: c.sum_sq(),
                        last_updated: c.last_updated(),
                    },
                )
            })
            .collect()
    }
}

/// Control first, then the remaining variants in declared order.
fn ordered_variant_ids(experiment: &ExperimentRecord) -> Vec<&str> {
    let variants = experiment.variants();
    variants
        .iter()
        .filter(|v| v.is_control())
        .chain(variants.iter().filter(|v| !v.is_control()))
        .map(|v| v.variant_id())
        .collect()
}

/// Concurrent arena of per-experiment, per-variant counters.
#[derive(Debug, Default)]
pub struct StatisticsAggregator {
    experiments: DashMap<String, Arc<ExperimentCounters>>,
    notifier: Option<mpsc::Sender<SnapshotUpdated>>,
}

impl StatisticsAggregator {
    /// Create an aggregator without notifications.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an aggregator that publishes a [`SnapshotUpdated`] per accepted event.
    ///
    /// A full channel drops the notification; consumers coalesce anyway.
    #[must_use]
    pub fn with_notifier(sender: mpsc::Sender<SnapshotUpdated>) -> Self {
        Self {
            experiments: DashMap::new(),
            notifier: Some(sender),
        }
    }

    /// Number of experiments with live counters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    /// Check if no counters exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    /// Counters for `experiment_id` at `epoch`, or `None` if the event is stale.
    fn counters_for(&self, experiment_id: &str, epoch: u32) -> Option<Arc<ExperimentCounters>> {
        if let Some(existing) = self.experiments.get(experiment_id) {
            match existing.epoch.cmp(&epoch) {
                std::cmp::Ordering::Equal => return Some(Arc::clone(existing.value())),
                std::cmp::Ordering::Greater => return None,
                std::cmp::Ordering::Less => {}
            }
        }
        let mut entry = self
            .experiments
            .entry(experiment_id.to_string())
            .or_insert_with(|| Arc::new(ExperimentCounters::new(epoch)));
        if entry.epoch < epoch {
            *entry = Arc::new(ExperimentCounters::new(epoch));
        }
        (entry.epoch == epoch).then(|| Arc::clone(entry.value()))
    }

    /// Count one event.
    ///
    /// Idempotent on the event's dedupe key within an epoch.
    pub fn record(&self, event: &EventRecord) -> Ack {
        let Some(counters) = self.counters_for(event.experiment_id(), event.epoch()) else {
            debug!(
                experiment_id = event.experiment_id(),
                epoch = event.epoch(),
                "stale event ignored"
            );
            return Ack::Stale;
        };

        let ack = counters.apply(event);
        if ack == Ack::Accepted {
            self.notify(event);
        }
        ack
    }

    fn notify(&self, event: &EventRecord) {
        let Some(sender) = &self.notifier else {
            return;
        };
        let update = SnapshotUpdated {
            experiment_id: event.experiment_id().to_string(),
            epoch: event.epoch(),
            at: event.timestamp(),
        };
        if let Err(e) = sender.try_send(update) {
            debug!(experiment_id = event.experiment_id(), error = %e, "snapshot notification dropped");
        }
    }

    /// Statistics for every variant of `experiment`, control first.
    ///
    /// Variants without events (or counters from another epoch) read as zero.
    #[must_use]
    pub fn snapshot(&self, experiment: &ExperimentRecord) -> Vec<RunningStatistics> {
        match self.experiments.get(experiment.experiment_id()) {
            Some(counters) if counters.epoch == experiment.epoch() => counters.snapshot(experiment),
            _ => ordered_variant_ids(experiment)
                .into_iter()
                .map(RunningStatistics::empty)
                .collect(),
        }
    }

    /// Rebuild an experiment's counters from its event log and swap them in.
    ///
    /// Events from other experiments or epochs are skipped. Events recorded
    /// while the rebuild runs are not in `events` and are lost from the
    /// counters (they remain in the log), so reconcile a quiet experiment.
    pub fn reconcile(&self, experiment: &ExperimentRecord, events: &[EventRecord]) -> ReconcileReport {
        let before = self.snapshot(experiment);

        let rebuilt = ExperimentCounters::new(experiment.epoch());
        for event in events.iter().filter(|e| {
            e.experiment_id() == experiment.experiment_id() && e.epoch() == experiment.epoch()
        }) {
            rebuilt.apply(event);
        }
        let after = rebuilt.snapshot(experiment);
        let drifted = before.len() != after.len()
            || before.iter().zip(&after).any(|(b, a)| !b.agrees_with(a));

        self.experiments
            .insert(experiment.experiment_id().to_string(), Arc::new(rebuilt));

        if drifted {
            warn!(experiment_id = experiment.experiment_id(), "counter drift corrected");
        } else {
            debug!(experiment_id = experiment.experiment_id(), "counters consistent with log");
        }
        ReconcileReport { drifted, before, after }
    }

    /// Re-apply a log (e.g. after restart). Safe to repeat.
    pub fn replay(&self, events: &[EventRecord]) -> ReplayReport {
        let mut report = ReplayReport::default();
        for event in events {
            match self.record(event) {
                Ack::Accepted => report.accepted += 1,
                Ack::Duplicate => report.duplicates += 1,
                Ack::Stale => report.stale += 1,
            }
        }
        info!(
            accepted = report.accepted,
            duplicates = report.duplicates,
            stale = report.stale,
            "event log replayed"
        );
        report
    }

    /// Start fresh counters for a new epoch.
    pub fn reset(&self, experiment_id: &str, epoch: u32) {
        self.experiments
            .insert(experiment_id.to_string(), Arc::new(ExperimentCounters::new(epoch)));
    }
}
