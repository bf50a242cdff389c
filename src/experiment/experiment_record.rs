//! Experiment Record - root entity of the experiment registry

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::VariantRecord;
use crate::decision::Decision;
use crate::{Error, Result};

/// Tolerance for the traffic weights summing to 1.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Longest accepted experiment identifier.
pub const MAX_EXPERIMENT_ID_LEN: usize = 128;

const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Being configured; variants may still change.
    Draft,
    /// Serving traffic and collecting events.
    Active,
    /// Temporarily serving the control to everyone.
    Paused,
    /// Finished; the frozen variant serves all traffic.
    Concluded,
    /// Abandoned; the control serves all traffic.
    RolledBack,
}

impl ExperimentStatus {
    /// Terminal states reject every mutation except archival.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Concluded | Self::RolledBack)
    }

    /// Whether the lifecycle allows moving from `self` to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Draft | Self::Paused, Self::Active)
                | (Self::Active, Self::Paused)
                | (Self::Active | Self::Paused, Self::Concluded | Self::RolledBack)
        )
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Concluded => "concluded",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target metric of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Did the visitor convert (yes/no).
    #[default]
    Binary,
    /// Per-visitor numeric total (e.g. revenue).
    Continuous,
}

/// Statistical framework used for the efficacy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    /// z/t statistic against an alpha-spending boundary.
    #[default]
    Frequentist,
    /// Posterior `P(variant > control)` against the same boundary on the probability scale.
    Bayesian,
}

/// Experiment Record represents a controlled experiment.
///
/// This is the root entity of the registry. It owns its variants, carries
/// the statistical configuration used by analysis, and tracks the lifecycle
/// state. Records are never deleted; `archived` hides concluded ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentRecord {
    experiment_id: String,
    name: String,
    hypothesis: String,
    status: ExperimentStatus,
    metric: MetricKind,
    method: AnalysisMethod,
    minimum_detectable_effect: f64,
    confidence_level: f64,
    power: f64,
    baseline_rate: Option<f64>,
    planned_sample_size: Option<u64>,
    min_sample_size: u64,
    min_runtime: Duration,
    max_runtime: Duration,
    futility_threshold: f64,
    variants: Vec<VariantRecord>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    frozen_variant: Option<String>,
    winning_variant: Option<String>,
    archived: bool,
    version: u64,
    epoch: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conclusion: Option<Decision>,
}

impl ExperimentRecord {
    /// Create a draft experiment with default statistical settings.
    #[must_use]
    pub fn new(experiment_id: impl Into<String>, name: impl Into<String>) -> Self {
        ExperimentRecordBuilder::new(experiment_id, name).build()
    }

    /// Create a builder for constructing an experiment with optional fields.
    #[must_use]
    pub fn builder(
        experiment_id: impl Into<String>,
        name: impl Into<String>,
    ) -> ExperimentRecordBuilder {
        ExperimentRecordBuilder::new(experiment_id, name)
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Get the experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the hypothesis text.
    #[must_use]
    pub fn hypothesis(&self) -> &str {
        &self.hypothesis
    }

    /// Get the lifecycle status.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Get the target metric kind.
    #[must_use]
    pub const fn metric(&self) -> MetricKind {
        self.metric
    }

    /// Get the analysis method.
    #[must_use]
    pub const fn method(&self) -> AnalysisMethod {
        self.method
    }

    /// Minimum detectable effect as a relative lift (`0.10` = 10%).
    #[must_use]
    pub const fn minimum_detectable_effect(&self) -> f64 {
        self.minimum_detectable_effect
    }

    /// Confidence level, e.g. `0.95`.
    #[must_use]
    pub const fn confidence_level(&self) -> f64 {
        self.confidence_level
    }

    /// Overall two-sided alpha (`1 - confidence`).
    #[must_use]
    pub fn alpha(&self) -> f64 {
        1.0 - self.confidence_level
    }

    /// Desired power.
    #[must_use]
    pub const fn power(&self) -> f64 {
        self.power
    }

    /// Planning baseline conversion rate, if configured.
    #[must_use]
    pub const fn baseline_rate(&self) -> Option<f64> {
        self.baseline_rate
    }

    /// Explicit per-arm sample size, if configured.
    #[must_use]
    pub const fn planned_sample_size(&self) -> Option<u64> {
        self.planned_sample_size
    }

    /// Per-arm participants required before any stopping decision.
    #[must_use]
    pub const fn min_sample_size(&self) -> u64 {
        self.min_sample_size
    }

    /// Runtime required before any stopping decision.
    #[must_use]
    pub const fn min_runtime(&self) -> Duration {
        self.min_runtime
    }

    /// Runtime after which an undecided experiment stops as inconclusive.
    #[must_use]
    pub const fn max_runtime(&self) -> Duration {
        self.max_runtime
    }

    /// Conditional power below which a variant is futile (`0` disables).
    #[must_use]
    pub const fn futility_threshold(&self) -> f64 {
        self.futility_threshold
    }

    /// Variants in declared order.
    #[must_use]
    pub fn variants(&self) -> &[VariantRecord] {
        &self.variants
    }

    /// Look up a variant by ID.
    #[must_use]
    pub fn variant(&self, variant_id: &str) -> Option<&VariantRecord> {
        self.variants.iter().find(|v| v.variant_id() == variant_id)
    }

    /// The control variant, if one is declared.
    #[must_use]
    pub fn control(&self) -> Option<&VariantRecord> {
        self.variants.iter().find(|v| v.is_control())
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the experiment first became active.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When the experiment reached a terminal state.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Variant served to everyone while not active.
    #[must_use]
    pub fn frozen_variant(&self) -> Option<&str> {
        self.frozen_variant.as_deref()
    }

    /// Variant that won on efficacy, if any.
    #[must_use]
    pub fn winning_variant(&self) -> Option<&str> {
        self.winning_variant.as_deref()
    }

    /// Decision that concluded the experiment, when the engine stopped it.
    #[must_use]
    pub const fn conclusion(&self) -> Option<&Decision> {
        self.conclusion.as_ref()
    }

    /// Whether the record is hidden from default listings.
    #[must_use]
    pub const fn is_archived(&self) -> bool {
        self.archived
    }

    /// Optimistic concurrency version, bumped by every mutation.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Assignment epoch, bumped by reset.
    #[must_use]
    pub const fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Variant every visitor receives while the experiment is not active.
    ///
    /// Frozen variant, then winner, then control.
    #[must_use]
    pub fn serving_variant(&self) -> Option<&str> {
        self.frozen_variant
            .as_deref()
            .or(self.winning_variant.as_deref())
            .or_else(|| self.control().map(VariantRecord::variant_id))
    }

    /// Time elapsed since start, zero if never started or `now` precedes it.
    #[must_use]
    pub fn runtime(&self, now: DateTime<Utc>) -> Duration {
        self.started_at
            .and_then(|start| (now - start).to_std().ok())
            .unwrap_or_default()
    }

    /// Check the statistical configuration.
    ///
    /// # Errors
    ///
    /// `Configuration` naming the first offending field.
    pub fn validate_config(&self) -> Result<()> {
        let id = self.experiment_id.trim();
        if id.is_empty() || self.experiment_id.len() > MAX_EXPERIMENT_ID_LEN {
            return Err(Error::Configuration(format!(
                "experiment id must be 1..={MAX_EXPERIMENT_ID_LEN} bytes and not blank"
            )));
        }
        if self.name.trim().is_empty() {
            return Err(Error::Configuration(format!("experiment '{id}' has no name")));
        }
        let in_unit = |x: f64| x > 0.0 && x < 1.0;
        if !in_unit(self.confidence_level) {
            return Err(Error::Configuration(format!(
                "confidence level must be in (0, 1), got {}",
                self.confidence_level
            )));
        }
        if !in_unit(self.power) {
            return Err(Error::Configuration(format!(
                "power must be in (0, 1), got {}",
                self.power
            )));
        }
        if !(self.minimum_detectable_effect > 0.0 && self.minimum_detectable_effect.is_finite()) {
            return Err(Error::Configuration(format!(
                "minimum detectable effect must be positive, got {}",
                self.minimum_detectable_effect
            )));
        }
        if let Some(baseline) = self.baseline_rate {
            if !in_unit(baseline) {
                return Err(Error::Configuration(format!(
                    "baseline rate must be in (0, 1), got {baseline}"
                )));
            }
        }
        if self.planned_sample_size == Some(0) {
            return Err(Error::Configuration("planned sample size must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.futility_threshold) {
            return Err(Error::Configuration(format!(
                "futility threshold must be in [0, 1), got {}",
                self.futility_threshold
            )));
        }
        if self.max_runtime.is_zero() || self.min_runtime > self.max_runtime {
            return Err(Error::Configuration(format!(
                "runtime window invalid: min {:?}, max {:?}",
                self.min_runtime, self.max_runtime
            )));
        }
        Ok(())
    }

    /// Check everything activation requires: configuration plus variants.
    ///
    /// # Errors
    ///
    /// `Configuration` describing the first violated rule.
    pub fn validate_for_activation(&self) -> Result<()> {
        self.validate_config()?;
        validate_variants(&self.experiment_id, &self.variants)
    }

    pub(crate) fn replace_variants(&mut self, variants: Vec<VariantRecord>) {
        self.variants = variants;
    }

    /// Apply a lifecycle move, updating timestamps and the served variant.
    pub(crate) fn apply_transition(
        &mut self,
        to: ExperimentStatus,
        winner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidInput(format!(
                "experiment '{}' cannot move from {} to {}",
                self.experiment_id, self.status, to
            )));
        }
        if let Some(w) = winner {
            if to != ExperimentStatus::Concluded {
                return Err(Error::InvalidInput(format!(
                    "a winning variant can only be set when concluding, not on {to}"
                )));
            }
            if self.variant(w).is_none() {
                return Err(Error::NotFound(format!(
                    "variant '{w}' in experiment '{}'",
                    self.experiment_id
                )));
            }
        }
        if to == ExperimentStatus::Active {
            self.validate_for_activation()?;
        }

        let control = self.control().map(|c| c.variant_id().to_string());
        match to {
            ExperimentStatus::Active => {
                self.started_at.get_or_insert(now);
                self.frozen_variant = None;
            }
            ExperimentStatus::Paused => self.frozen_variant = control,
            ExperimentStatus::Concluded => {
                self.winning_variant = winner.map(str::to_string);
                self.frozen_variant = winner.map(str::to_string).or(control);
                self.ended_at = Some(now);
            }
            ExperimentStatus::RolledBack => {
                self.frozen_variant = control;
                self.ended_at = Some(now);
            }
            ExperimentStatus::Draft => {}
        }
        self.status = to;
        Ok(())
    }

    pub(crate) fn set_conclusion(&mut self, decision: Decision) {
        self.conclusion = Some(decision);
    }

    pub(crate) fn set_archived(&mut self) {
        self.archived = true;
    }

    /// Start a new assignment epoch; previous assignments and statistics no longer apply.
    pub(crate) fn advance_epoch(&mut self) {
        self.epoch += 1;
        self.started_at = None;
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }
}

fn validate_variants(experiment_id: &str, variants: &[VariantRecord]) -> Result<()> {
    if variants.len() < 2 {
        return Err(Error::Configuration(format!(
            "experiment '{experiment_id}' needs at least 2 variants, has {}",
            variants.len()
        )));
    }
    let controls = variants.iter().filter(|v| v.is_control()).count();
    if controls != 1 {
        return Err(Error::Configuration(format!(
            "experiment '{experiment_id}' needs exactly one control, has {controls}"
        )));
    }
    let mut seen = HashSet::with_capacity(variants.len());
    for v in variants {
        if v.variant_id().trim().is_empty() {
            return Err(Error::Configuration("variant id must not be blank".to_string()));
        }
        if !seen.insert(v.variant_id()) {
            return Err(Error::Configuration(format!(
                "duplicate variant id '{}'",
                v.variant_id()
            )));
        }
        if !(0.0..=1.0).contains(&v.weight()) {
            return Err(Error::Configuration(format!(
                "variant '{}' weight {} outside [0, 1]",
                v.variant_id(),
                v.weight()
            )));
        }
    }
    let total: f64 = variants.iter().map(VariantRecord::weight).sum();
    if (total - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(Error::Configuration(format!(
            "variant weights of '{experiment_id}' sum to {total}, expected 1"
        )));
    }
    Ok(())
}

/// Builder for `ExperimentRecord`.
#[derive(Debug)]
pub struct ExperimentRecordBuilder {
    record: ExperimentRecord,
}

impl ExperimentRecordBuilder {
    /// Create a new builder with required fields and defaults for the rest.
    #[must_use]
    pub fn new(experiment_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            record: ExperimentRecord {
                experiment_id: experiment_id.into(),
                name: name.into(),
                hypothesis: String::new(),
                status: ExperimentStatus::Draft,
                metric: MetricKind::default(),
                method: AnalysisMethod::default(),
                minimum_detectable_effect: 0.10,
                confidence_level: 0.95,
                power: 0.8,
                baseline_rate: None,
                planned_sample_size: None,
                min_sample_size: 100,
                min_runtime: Duration::ZERO,
                max_runtime: DEFAULT_MAX_RUNTIME,
                futility_threshold: 0.10,
                variants: Vec::new(),
                created_at: Utc::now(),
                started_at: None,
                ended_at: None,
                frozen_variant: None,
                winning_variant: None,
                archived: false,
                version: 0,
                epoch: 0,
                conclusion: None,
            },
        }
    }

    /// Set the hypothesis text.
    #[must_use]
    pub fn hypothesis(mut self, hypothesis: impl Into<String>) -> Self {
        self.record.hypothesis = hypothesis.into();
        self
    }

    /// Set the target metric.
    #[must_use]
    pub const fn metric(mut self, metric: MetricKind) -> Self {
        self.record.metric = metric;
        self
    }

    /// Set the analysis method.
    #[must_use]
    pub const fn method(mut self, method: AnalysisMethod) -> Self {
        self.record.method = method;
        self
    }

    /// Set the minimum detectable effect (relative lift).
    #[must_use]
    pub const fn minimum_detectable_effect(mut self, mde: f64) -> Self {
        self.record.minimum_detectable_effect = mde;
        self
    }

    /// Set the confidence level.
    #[must_use]
    pub const fn confidence_level(mut self, confidence: f64) -> Self {
        self.record.confidence_level = confidence;
        self
    }

    /// Set the desired power.
    #[must_use]
    pub const fn power(mut self, power: f64) -> Self {
        self.record.power = power;
        self
    }

    /// Set the planning baseline rate.
    #[must_use]
    pub const fn baseline_rate(mut self, rate: f64) -> Self {
        self.record.baseline_rate = Some(rate);
        self
    }

    /// Fix the per-arm sample size instead of deriving it.
    #[must_use]
    pub const fn planned_sample_size(mut self, n: u64) -> Self {
        self.record.planned_sample_size = Some(n);
        self
    }

    /// Set the per-arm minimum before any stop.
    #[must_use]
    pub const fn min_sample_size(mut self, n: u64) -> Self {
        self.record.min_sample_size = n;
        self
    }

    /// Set the minimum runtime.
    #[must_use]
    pub const fn min_runtime(mut self, runtime: Duration) -> Self {
        self.record.min_runtime = runtime;
        self
    }

    /// Set the maximum runtime.
    #[must_use]
    pub const fn max_runtime(mut self, runtime: Duration) -> Self {
        self.record.max_runtime = runtime;
        self
    }

    /// Set the futility conditional-power threshold.
    #[must_use]
    pub const fn futility_threshold(mut self, threshold: f64) -> Self {
        self.record.futility_threshold = threshold;
        self
    }

    /// Append a variant.
    #[must_use]
    pub fn variant(mut self, variant: VariantRecord) -> Self {
        self.record.variants.push(variant);
        self
    }

    /// Replace all variants.
    #[must_use]
    pub fn variants(mut self, variants: Vec<VariantRecord>) -> Self {
        self.record.variants = variants;
        self
    }

    /// Set a custom creation timestamp (useful for deserialization/testing).
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.record.created_at = created_at;
        self
    }

    /// Build the `ExperimentRecord` in `draft` status.
    #[must_use]
    pub fn build(self) -> ExperimentRecord {
        self.record
    }
}
