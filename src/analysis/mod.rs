//! Statistical Analysis Engine
//!
//! Turns a statistics snapshot into an immutable [`AnalysisResult`]:
//!
//! 1. Every non-control variant is tested against control (z-test for
//!    binary metrics, Welch's t-test for continuous ones), with a Bayesian
//!    posterior on top when the experiment asks for it.
//! 2. The information fraction `t = min_arm_n / planned_n` places this look
//!    on the experiment's sequential design. The planned per-arm size is
//!    fixed at the first look of an epoch and never moves afterwards.
//! 3. Alpha is split evenly across comparisons and spent along the look
//!    history, giving the efficacy boundary for this look.
//! 4. Conditional power under the planning effect decides futility.
//!
//! Results are appended to a bounded per-experiment history and never
//! mutated. An analysis is computed by [`AnalysisEngine::prepare`] and only
//! becomes part of the design once committed, so an abandoned run leaves
//! the look sequence untouched.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregate::RunningStatistics;
use crate::experiment::{AnalysisMethod, ExperimentRecord, MetricKind};
use crate::stats::{
    compare_means, compare_proportions, conditional_power, normal_cdf, planning_drift,
    required_sample_size, required_sample_size_means, two_proportion_z_test, welch_t_test,
    BayesianOutcome, BetaPrior, BoundaryPath, SequentialDesign, SpendingFunction, TestOutcome,
};
use crate::{Error, Result};

/// Information must grow by more than this for a new look to count.
pub const MIN_INFORMATION_STEP: f64 = 1e-3;

/// Tunables shared by every experiment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Alpha-spending family
    pub spending: SpendingFunction,
    /// Integration grid size for boundary computation
    pub grid_points: usize,
    /// Prior for the Bayesian path
    pub prior: BetaPrior,
    /// Analysis results kept per experiment; older ones are dropped
    pub history_limit: usize,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            spending: SpendingFunction::OBrienFleming,
            grid_points: 257,
            prior: BetaPrior::default(),
            history_limit: 1000,
        }
    }
}

/// Outcome of a single analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Keep collecting data.
    Continue,
    /// A variant crossed the efficacy boundary.
    StopEfficacy {
        /// The winning variant
        variant_id: String,
    },
    /// Every variant is futile.
    StopFutility,
}

/// One variant compared against control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantComparison {
    /// Variant under test
    pub variant_id: String,
    /// Frequentist test result
    pub outcome: TestOutcome,
    /// Posterior summary (Bayesian experiments only)
    pub posterior: Option<BayesianOutcome>,
    /// Probability of crossing at the final look given the current data
    pub conditional_power: f64,
    /// Efficacy boundary crossed at this look
    pub crossed_efficacy: bool,
    /// Futility rule triggered at this look
    pub crossed_futility: bool,
}

/// Immutable snapshot of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Experiment analyzed
    pub experiment_id: String,
    /// Epoch of the statistics
    pub epoch: u32,
    /// Engine-wide sequence number
    pub sequence: u64,
    /// Index of this look within the epoch (1-based)
    pub look: usize,
    /// Fraction of the planned per-arm sample observed
    pub information_fraction: f64,
    /// Critical z for this look
    pub efficacy_boundary: f64,
    /// Critical z at the final look given the looks so far
    pub final_boundary: f64,
    /// Two-sided alpha per comparison
    pub alpha_per_comparison: f64,
    /// Per-arm sample size fixed at the first look
    pub planned_sample_size: u64,
    /// Per-arm size re-estimated from current data
    pub required_sample_size: Option<u64>,
    /// Statistics the analysis ran on, control first
    pub statistics: Vec<RunningStatistics>,
    /// One entry per non-control variant
    pub comparisons: Vec<VariantComparison>,
    /// Verdict of this look
    pub verdict: Verdict,
    /// When the analysis ran
    pub computed_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Comparison for a variant.
    #[must_use]
    pub fn comparison(&self, variant_id: &str) -> Option<&VariantComparison> {
        self.comparisons.iter().find(|c| c.variant_id == variant_id)
    }
}

/// One recorded look, as persisted in checkpoints.
///
/// A row with `look == 0` only carries the planned sample size of an epoch
/// that has not reached its first look yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookRecord {
    /// Experiment the look belongs to
    pub experiment_id: String,
    /// Epoch of the look
    pub epoch: u32,
    /// Look index within the epoch (1-based, 0 for a plan-only row)
    pub look: usize,
    /// Information fraction at the look
    pub information_fraction: f64,
    /// Critical z at the look
    pub efficacy_boundary: f64,
    /// Per-arm sample size fixed for the epoch
    pub planned_sample_size: u64,
    /// Two-sided alpha per comparison
    pub alpha_per_comparison: f64,
    /// Sequence of the analysis that opened the look
    pub sequence: u64,
}

#[derive(Debug, Clone)]
struct LookState {
    epoch: u32,
    planned: Option<u64>,
    path: Option<BoundaryPath>,
    fractions: Vec<f64>,
    sequences: Vec<u64>,
    final_boundary: f64,
}

impl LookState {
    const fn new(epoch: u32) -> Self {
        Self {
            epoch,
            planned: None,
            path: None,
            fractions: Vec::new(),
            sequences: Vec::new(),
            final_boundary: f64::INFINITY,
        }
    }
}

/// An analysis that has been computed but not recorded.
///
/// Produced by [`AnalysisEngine::prepare`]. The experiment's looks and
/// history only change once it is handed to [`AnalysisEngine::commit`];
/// dropping it leaves the engine as it was.
#[derive(Debug, Clone)]
pub struct PendingAnalysis {
    result: Arc<AnalysisResult>,
    state: LookState,
    base_looks: usize,
}

impl PendingAnalysis {
    /// The computed result.
    #[must_use]
    pub const fn result(&self) -> &Arc<AnalysisResult> {
        &self.result
    }
}

/// Runs analyses and keeps their history.
#[derive(Debug, Default)]
pub struct AnalysisEngine {
    settings: AnalysisSettings,
    looks: DashMap<String, LookState>,
    history: DashMap<String, Vec<Arc<AnalysisResult>>>,
    sequence: AtomicU64,
}

impl AnalysisEngine {
    /// Create an engine with the given settings.
    #[must_use]
    pub fn new(settings: AnalysisSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Get the settings.
    #[must_use]
    pub const fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    /// Analyze `experiment` on `statistics` (one entry per variant) and record the result.
    ///
    /// # Errors
    ///
    /// See [`prepare`](Self::prepare).
    pub fn analyze(
        &self,
        experiment: &ExperimentRecord,
        statistics: &[RunningStatistics],
        now: DateTime<Utc>,
    ) -> Result<Arc<AnalysisResult>> {
        let pending = self.prepare(experiment, statistics, now)?;
        Ok(self.commit(pending))
    }

    /// Compute an analysis without recording the look or the result.
    ///
    /// Adding a look costs one step of the boundary recursion: the
    /// propagated density from the previous look is cached per experiment.
    ///
    /// # Errors
    ///
    /// - `Configuration` when the control or all treatments are missing
    /// - `Computation` when the data cannot support a test yet (empty arm,
    ///   sample size not plannable) or a numerical routine fails
    pub fn prepare(
        &self,
        experiment: &ExperimentRecord,
        statistics: &[RunningStatistics],
        now: DateTime<Utc>,
    ) -> Result<PendingAnalysis> {
        let experiment_id = experiment.experiment_id();
        let control_id = experiment
            .control()
            .ok_or_else(|| Error::Configuration(format!("experiment '{experiment_id}' has no control")))?
            .variant_id();
        let control = statistics
            .iter()
            .find(|s| s.variant_id == control_id)
            .ok_or_else(|| {
                Error::Configuration(format!("no statistics for control '{control_id}'"))
            })?;
        let treatments: Vec<&RunningStatistics> =
            statistics.iter().filter(|s| s.variant_id != control_id).collect();
        if treatments.is_empty() {
            return Err(Error::Configuration(format!(
                "experiment '{experiment_id}' has no variant to compare"
            )));
        }

        #[allow(clippy::cast_precision_loss)]
        let alpha = experiment.alpha() / treatments.len() as f64;
        let design = SequentialDesign::new(alpha, self.settings.spending)?
            .with_grid_points(self.settings.grid_points);

        let mut state = self
            .looks
            .get(experiment_id)
            .map(|s| s.value().clone())
            .filter(|s| s.epoch == experiment.epoch())
            .unwrap_or_else(|| LookState::new(experiment.epoch()));
        let base_looks = state.fractions.len();

        let planned = match state.planned {
            Some(n) => n,
            None => {
                let n = plan_sample_size(experiment, control, alpha)?;
                state.planned = Some(n);
                n
            }
        }
        .max(1);

        let mut path = match state.path.take() {
            Some(path) if *path.design() == design => path,
            _ => replay_path(design, &state.fractions)?,
        };

        let smallest = statistics.iter().map(|s| s.participants).min().unwrap_or(0);
        #[allow(clippy::cast_precision_loss)]
        let observed = (smallest as f64 / planned as f64).min(1.0);

        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        if observed - path.last_fraction() > MIN_INFORMATION_STEP {
            path.push(observed)?;
            state.fractions.push(observed);
            state.sequences.push(sequence);
            state.final_boundary = path.projected_final();
        } else if state.fractions.is_empty() {
            state.final_boundary = path.projected_final();
        }

        let look = state.fractions.len();
        let fraction = path.last_fraction();
        let boundary = path.bounds().last().copied().unwrap_or(f64::INFINITY);
        let final_boundary = state.final_boundary;
        state.path = Some(path);

        let drift = planning_drift(alpha, experiment.power());
        let comparisons = treatments
            .iter()
            .map(|variant| {
                self.compare(experiment, control, variant, fraction, boundary, final_boundary, drift)
            })
            .collect::<Result<Vec<_>>>()?;

        let verdict = verdict(&comparisons);
        let result = Arc::new(AnalysisResult {
            experiment_id: experiment_id.to_string(),
            epoch: experiment.epoch(),
            sequence,
            look,
            information_fraction: fraction,
            efficacy_boundary: boundary,
            final_boundary,
            alpha_per_comparison: alpha,
            planned_sample_size: planned,
            required_sample_size: reestimate(experiment, control, alpha),
            statistics: statistics.to_vec(),
            comparisons,
            verdict,
            computed_at: now,
        });
        Ok(PendingAnalysis {
            result,
            state,
            base_looks,
        })
    }

    /// Record a prepared analysis: its look (if it opened one) and its result.
    ///
    /// When another analysis of the same epoch was committed in between, the
    /// stored looks are kept and only the result is appended.
    pub fn commit(&self, pending: PendingAnalysis) -> Arc<AnalysisResult> {
        let PendingAnalysis {
            result,
            state,
            base_looks,
        } = pending;
        let experiment_id = result.experiment_id.as_str();
        {
            let mut entry = self
                .looks
                .entry(experiment_id.to_string())
                .or_insert_with(|| LookState::new(state.epoch));
            let replace = match state.epoch.cmp(&entry.epoch) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => entry.fractions.len() == base_looks,
                std::cmp::Ordering::Less => false,
            };
            if replace {
                *entry = state;
            } else {
                debug!(experiment_id, sequence = result.sequence, "looks moved on; keeping stored state");
            }
        }

        debug!(
            experiment_id,
            sequence = result.sequence,
            look = result.look,
            information_fraction = result.information_fraction,
            boundary = result.efficacy_boundary,
            verdict = ?result.verdict,
            "analysis complete"
        );
        let mut history = self.history.entry(experiment_id.to_string()).or_default();
        history.push(Arc::clone(&result));
        let excess = history.len().saturating_sub(self.settings.history_limit.max(1));
        if excess > 0 {
            history.drain(..excess);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn compare(
        &self,
        experiment: &ExperimentRecord,
        control: &RunningStatistics,
        variant: &RunningStatistics,
        fraction: f64,
        boundary: f64,
        final_boundary: f64,
        drift: f64,
    ) -> Result<VariantComparison> {
        let confidence = experiment.confidence_level();
        let outcome = match experiment.metric() {
            MetricKind::Binary => {
                two_proportion_z_test(control.proportion(), variant.proportion(), confidence)?
            }
            MetricKind::Continuous => {
                welch_t_test(mean_sample(control)?, mean_sample(variant)?, confidence)?
            }
        };

        let posterior = match (experiment.method(), experiment.metric()) {
            (AnalysisMethod::Frequentist, _) => None,
            (AnalysisMethod::Bayesian, MetricKind::Binary) => Some(compare_proportions(
                self.settings.prior,
                control.proportion(),
                variant.proportion(),
                confidence,
            )?),
            (AnalysisMethod::Bayesian, MetricKind::Continuous) => Some(compare_means(
                mean_sample(control)?,
                mean_sample(variant)?,
                confidence,
            )?),
        };

        let crossed_efficacy = boundary.is_finite()
            && posterior.as_ref().map_or(outcome.statistic >= boundary, |p| {
                p.probability_variant_better >= normal_cdf(boundary)
            });

        let cp = conditional_power(outcome.statistic, fraction, drift, final_boundary);
        let threshold = experiment.futility_threshold();
        let crossed_futility = !crossed_efficacy
            && (fraction >= 1.0 || (threshold > 0.0 && cp < threshold));

        Ok(VariantComparison {
            variant_id: variant.variant_id.clone(),
            outcome,
            posterior,
            conditional_power: cp,
            crossed_efficacy,
            crossed_futility,
        })
    }

    /// Recent analyses of an experiment, oldest first.
    ///
    /// At most [`AnalysisSettings::history_limit`] results are kept.
    #[must_use]
    pub fn history(&self, experiment_id: &str) -> Vec<Arc<AnalysisResult>> {
        self.history
            .get(experiment_id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Most recent analysis of an experiment.
    #[must_use]
    pub fn latest(&self, experiment_id: &str) -> Option<Arc<AnalysisResult>> {
        self.history
            .get(experiment_id)
            .and_then(|h| h.value().last().cloned())
    }

    /// Number of looks recorded in the experiment's current design.
    #[must_use]
    pub fn look_count(&self, experiment_id: &str) -> usize {
        self.looks.get(experiment_id).map_or(0, |s| s.fractions.len())
    }

    /// Drop the look history so the next analysis starts a fresh design.
    ///
    /// Past results stay in the history.
    pub fn forget_looks(&self, experiment_id: &str) {
        self.looks.remove(experiment_id);
    }

    /// Drop everything held for an experiment: looks and results.
    pub fn forget(&self, experiment_id: &str) {
        self.looks.remove(experiment_id);
        self.history.remove(experiment_id);
    }

    /// Every recorded look, ordered by experiment and look.
    #[must_use]
    pub fn look_records(&self) -> Vec<LookRecord> {
        let mut records = Vec::new();
        for entry in &self.looks {
            let state = entry.value();
            let (Some(planned), Some(path)) = (state.planned, state.path.as_ref()) else {
                continue;
            };
            let row = |look: usize, information_fraction: f64, efficacy_boundary: f64, sequence: u64| {
                LookRecord {
                    experiment_id: entry.key().clone(),
                    epoch: state.epoch,
                    look,
                    information_fraction,
                    efficacy_boundary,
                    planned_sample_size: planned,
                    alpha_per_comparison: path.design().alpha(),
                    sequence,
                }
            };
            if state.fractions.is_empty() {
                records.push(row(0, 0.0, f64::INFINITY, 0));
                continue;
            }
            let looks = state.fractions.iter().zip(path.bounds()).zip(&state.sequences);
            for (k, ((&t, &c), &sequence)) in looks.enumerate() {
                records.push(row(k + 1, t, c, sequence));
            }
        }
        records.sort_by(|a, b| {
            a.experiment_id
                .cmp(&b.experiment_id)
                .then(a.look.cmp(&b.look))
        });
        records
    }

    /// Rebuild look state from checkpointed records.
    ///
    /// Only the latest epoch per experiment is used, and experiments that
    /// already have look state here are left alone. Returns the number of
    /// experiments restored.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when the records do not form an increasing look sequence.
    pub fn restore_looks(&self, records: &[LookRecord]) -> Result<usize> {
        let mut grouped: BTreeMap<&str, Vec<&LookRecord>> = BTreeMap::new();
        for record in records {
            grouped.entry(record.experiment_id.as_str()).or_default().push(record);
        }

        let mut restored = 0;
        for (experiment_id, mut rows) in grouped {
            if self.looks.contains_key(experiment_id) {
                continue;
            }
            let epoch = rows.iter().map(|r| r.epoch).max().unwrap_or(0);
            rows.retain(|r| r.epoch == epoch);
            rows.sort_by_key(|r| r.look);
            let Some(first) = rows.first() else {
                continue;
            };

            let design = SequentialDesign::new(first.alpha_per_comparison, self.settings.spending)?
                .with_grid_points(self.settings.grid_points);
            let mut state = LookState::new(epoch);
            state.planned = Some(first.planned_sample_size);
            let mut path = design.path();
            for row in rows.iter().filter(|r| r.look > 0) {
                let c = path.push(row.information_fraction)?;
                if (c - row.efficacy_boundary).abs() > 1e-6 {
                    warn!(
                        experiment_id,
                        look = row.look,
                        stored = row.efficacy_boundary,
                        recomputed = c,
                        "restored boundary differs from checkpoint"
                    );
                }
                state.fractions.push(row.information_fraction);
                state.sequences.push(row.sequence);
            }
            state.final_boundary = path.projected_final();
            state.path = Some(path);

            let last = rows.iter().map(|r| r.sequence).max().unwrap_or(0);
            self.sequence.fetch_max(last, Ordering::AcqRel);
            self.looks.insert(experiment_id.to_string(), state);
            restored += 1;
        }
        Ok(restored)
    }
}

fn replay_path(design: SequentialDesign, fractions: &[f64]) -> Result<BoundaryPath> {
    let mut path = design.path();
    for &t in fractions {
        path.push(t)?;
    }
    Ok(path)
}

fn mean_sample(stats: &RunningStatistics) -> Result<crate::stats::MeanSample> {
    stats.mean_sample().ok_or_else(|| {
        Error::Computation(format!(
            "variant '{}' needs at least 2 participants for a t-test",
            stats.variant_id
        ))
    })
}

/// Largest efficacy statistic wins; otherwise futility needs every variant.
fn verdict(comparisons: &[VariantComparison]) -> Verdict {
    let winner = comparisons
        .iter()
        .filter(|c| c.crossed_efficacy)
        .max_by(|a, b| a.outcome.statistic.total_cmp(&b.outcome.statistic));
    if let Some(winner) = winner {
        return Verdict::StopEfficacy {
            variant_id: winner.variant_id.clone(),
        };
    }
    if !comparisons.is_empty() && comparisons.iter().all(|c| c.crossed_futility) {
        return Verdict::StopFutility;
    }
    Verdict::Continue
}

/// Per-arm sample size for the sequential design.
///
/// Explicit configuration wins, then the planning baseline, then the
/// smoothed observed control rate once the control has its minimum sample.
#[allow(clippy::cast_precision_loss)]
fn plan_sample_size(experiment: &ExperimentRecord, control: &RunningStatistics, alpha: f64) -> Result<u64> {
    if let Some(n) = experiment.planned_sample_size() {
        return Ok(n);
    }
    let mde = experiment.minimum_detectable_effect();
    let power = experiment.power();
    let not_yet = || {
        Error::Computation(format!(
            "planned sample size needs {} control participants, have {}",
            experiment.min_sample_size().max(2),
            control.participants
        ))
    };

    let planned = match experiment.metric() {
        MetricKind::Binary => {
            let baseline = match experiment.baseline_rate() {
                Some(rate) => rate,
                None if control.participants >= experiment.min_sample_size().max(1) => {
                    (control.conversions as f64 + 1.0) / (control.participants as f64 + 2.0)
                }
                None => return Err(not_yet()),
            };
            required_sample_size(baseline, mde, alpha, power)
        }
        MetricKind::Continuous => {
            if control.participants < experiment.min_sample_size().max(2) {
                return Err(not_yet());
            }
            let sample = mean_sample(control)?;
            required_sample_size_means(sample.variance.sqrt(), mde * sample.mean.abs(), alpha, power)
        }
    };
    planned.map_err(|e| Error::Computation(format!("cannot plan sample size: {e}")))
}

/// Sample size implied by the data observed so far (informational).
#[allow(clippy::cast_precision_loss)]
fn reestimate(experiment: &ExperimentRecord, control: &RunningStatistics, alpha: f64) -> Option<u64> {
    let mde = experiment.minimum_detectable_effect();
    match experiment.metric() {
        MetricKind::Binary => {
            let rate = (control.conversions as f64 + 1.0) / (control.participants as f64 + 2.0);
            required_sample_size(rate, mde, alpha, experiment.power()).ok()
        }
        MetricKind::Continuous => control.mean_sample().and_then(|s| {
            required_sample_size_means(s.variance.sqrt(), mde * s.mean.abs(), alpha, experiment.power())
                .ok()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::VariantRecord;

    fn binary_experiment(planned: Option<u64>) -> ExperimentRecord {
        let mut builder = ExperimentRecord::builder("exp-1", "Test")
            .variant(VariantRecord::control("a", "A", 0.5))
            .variant(VariantRecord::new("b", "B", 0.5));
        if let Some(n) = planned {
            builder = builder.planned_sample_size(n);
        }
        builder.build()
    }

    fn stats(variant: &str, participants: u64, conversions: u64) -> RunningStatistics {
        RunningStatistics {
            variant_id: variant.to_string(),
            participants,
            conversions,
            sum: 0.0,
            sum_sq: 0.0,
            last_updated: None,
        }
    }

    #[test]
    fn test_five_vs_seven_percent_stops_for_efficacy() {
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(Some(2000));
        let result = engine
            .analyze(&experiment, &[stats("a", 2000, 100), stats("b", 2000, 140)], Utc::now())
            .unwrap();

        let comparison = result.comparison("b").unwrap();
        assert!(comparison.outcome.p_value < 0.05);
        assert!((result.efficacy_boundary - 1.959_963_984_540_054).abs() < 1e-6);
        assert_eq!(
            result.verdict,
            Verdict::StopEfficacy {
                variant_id: "b".to_string()
            }
        );
    }

    #[test]
    fn test_identical_rates_continue() {
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(None);
        let result = engine
            .analyze(&experiment, &[stats("a", 500, 25), stats("b", 500, 25)], Utc::now())
            .unwrap();

        assert_eq!(result.verdict, Verdict::Continue);
        assert!(result.information_fraction < 0.1);
        assert!(!result.comparisons[0].crossed_efficacy);
    }

    #[test]
    fn test_final_look_without_efficacy_is_futile() {
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(Some(500));
        let result = engine
            .analyze(&experiment, &[stats("a", 500, 25), stats("b", 500, 26)], Utc::now())
            .unwrap();
        assert_eq!(result.verdict, Verdict::StopFutility);
    }

    #[test]
    fn test_missing_control_is_configuration_error() {
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(Some(100));
        let err = engine.analyze(&experiment, &[stats("b", 10, 1)], Utc::now());
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_planning_waits_for_minimum_sample() {
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(None);
        let err = engine.analyze(&experiment, &[stats("a", 10, 1), stats("b", 10, 1)], Utc::now());
        assert!(matches!(err, Err(Error::Computation(_))));
    }

    #[test]
    fn test_planned_size_fixed_at_first_look() {
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(None);
        let first = engine
            .analyze(&experiment, &[stats("a", 1000, 50), stats("b", 1000, 50)], Utc::now())
            .unwrap();
        let second = engine
            .analyze(&experiment, &[stats("a", 2000, 400), stats("b", 2000, 400)], Utc::now())
            .unwrap();
        assert_eq!(first.planned_sample_size, second.planned_sample_size);
        assert_ne!(first.required_sample_size, second.required_sample_size);
    }

    #[test]
    fn test_stalled_information_reuses_boundary() {
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(Some(10_000));
        let data = [stats("a", 5000, 250), stats("b", 5000, 260)];

        let first = engine.analyze(&experiment, &data, Utc::now()).unwrap();
        let second = engine.analyze(&experiment, &data, Utc::now()).unwrap();

        assert_eq!(first.look, 1);
        assert_eq!(second.look, 1);
        assert!((first.efficacy_boundary - second.efficacy_boundary).abs() < f64::EPSILON);
        assert!(second.sequence > first.sequence);
        assert_eq!(engine.history("exp-1").len(), 2);
        assert_eq!(engine.latest("exp-1").unwrap().sequence, second.sequence);
    }

    #[test]
    fn test_boundaries_fall_across_looks() {
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(Some(4000));
        let mut previous = f64::INFINITY;
        for n in [1000, 2000, 3000, 4000] {
            let result = engine
                .analyze(&experiment, &[stats("a", n, n / 20), stats("b", n, n / 20)], Utc::now())
                .unwrap();
            assert!(result.efficacy_boundary < previous);
            previous = result.efficacy_boundary;
        }
        assert_eq!(engine.latest("exp-1").unwrap().look, 4);
    }

    #[test]
    fn test_bonferroni_split_across_variants() {
        let engine = AnalysisEngine::default();
        let experiment = ExperimentRecord::builder("exp-3", "Three arms")
            .variant(VariantRecord::control("a", "A", 0.4))
            .variant(VariantRecord::new("b", "B", 0.3))
            .variant(VariantRecord::new("c", "C", 0.3))
            .planned_sample_size(1000)
            .build();
        let result = engine
            .analyze(
                &experiment,
                &[stats("a", 1000, 50), stats("b", 1000, 55), stats("c", 1000, 80)],
                Utc::now(),
            )
            .unwrap();
        assert!((result.alpha_per_comparison - 0.025).abs() < 1e-12);
        assert_eq!(result.comparisons.len(), 2);
        assert_eq!(
            result.verdict,
            Verdict::StopEfficacy {
                variant_id: "c".to_string()
            }
        );
    }

    #[test]
    fn test_bayesian_path_reports_posterior() {
        let engine = AnalysisEngine::default();
        let experiment = ExperimentRecord::builder("exp-b", "Bayes")
            .variant(VariantRecord::control("a", "A", 0.5))
            .variant(VariantRecord::new("b", "B", 0.5))
            .method(AnalysisMethod::Bayesian)
            .planned_sample_size(2000)
            .build();
        let result = engine
            .analyze(&experiment, &[stats("a", 2000, 100), stats("b", 2000, 140)], Utc::now())
            .unwrap();
        let posterior = result.comparisons[0].posterior.unwrap();
        assert!(posterior.probability_variant_better > 0.99);
        assert!(matches!(result.verdict, Verdict::StopEfficacy { .. }));
    }

    #[test]
    fn test_continuous_metric_uses_welch() {
        let engine = AnalysisEngine::default();
        let experiment = ExperimentRecord::builder("exp-c", "Revenue")
            .variant(VariantRecord::control("a", "A", 0.5))
            .variant(VariantRecord::new("b", "B", 0.5))
            .metric(MetricKind::Continuous)
            .planned_sample_size(400)
            .build();
        let arm = |id: &str, n: u64, mean: f64, var: f64| {
            let nf = n as f64;
            RunningStatistics {
                variant_id: id.to_string(),
                participants: n,
                conversions: 0,
                sum: mean * nf,
                sum_sq: var * (nf - 1.0) + nf * mean * mean,
                last_updated: None,
            }
        };
        let result = engine
            .analyze(&experiment, &[arm("a", 400, 10.0, 4.0), arm("b", 400, 11.0, 4.0)], Utc::now())
            .unwrap();
        let outcome = result.comparisons[0].outcome;
        assert!(outcome.degrees_of_freedom.is_some());
        assert!((outcome.difference - 1.0).abs() < 1e-9);
        assert!(matches!(result.verdict, Verdict::StopEfficacy { .. }));
    }

    #[test]
    fn test_new_epoch_restarts_looks() {
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(Some(4000));
        engine
            .analyze(&experiment, &[stats("a", 2000, 100), stats("b", 2000, 100)], Utc::now())
            .unwrap();

        let mut next = experiment.clone();
        next.advance_epoch();
        let result = engine
            .analyze(&next, &[stats("a", 1000, 50), stats("b", 1000, 50)], Utc::now())
            .unwrap();
        assert_eq!(result.look, 1);
        assert_eq!(result.epoch, 1);
    }

    // ========================================================================
    // Two-phase recording
    // ========================================================================

    #[test]
    fn test_uncommitted_analysis_leaves_looks_untouched() {
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(Some(4000));
        engine
            .analyze(&experiment, &[stats("a", 1000, 50), stats("b", 1000, 50)], Utc::now())
            .unwrap();

        let pending = engine
            .prepare(&experiment, &[stats("a", 2000, 100), stats("b", 2000, 100)], Utc::now())
            .unwrap();
        assert_eq!(pending.result().look, 2);
        drop(pending);

        assert_eq!(engine.look_count("exp-1"), 1);
        assert_eq!(engine.history("exp-1").len(), 1);
        let next = engine
            .analyze(&experiment, &[stats("a", 2000, 100), stats("b", 2000, 100)], Utc::now())
            .unwrap();
        assert_eq!(next.look, 2);
    }

    #[test]
    fn test_stale_commit_keeps_newer_looks() {
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(Some(4000));
        let early = engine
            .prepare(&experiment, &[stats("a", 1000, 50), stats("b", 1000, 50)], Utc::now())
            .unwrap();
        engine
            .analyze(&experiment, &[stats("a", 1000, 50), stats("b", 1000, 50)], Utc::now())
            .unwrap();
        engine
            .analyze(&experiment, &[stats("a", 2000, 100), stats("b", 2000, 100)], Utc::now())
            .unwrap();

        engine.commit(early);
        assert_eq!(engine.look_count("exp-1"), 2);
        assert_eq!(engine.history("exp-1").len(), 3);
    }

    #[test]
    fn test_many_looks_match_full_recursion() {
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(Some(4000));
        let mut fractions = Vec::new();
        let mut last = None;
        for k in 1..=40u64 {
            let n = k * 100;
            last = Some(
                engine
                    .analyze(&experiment, &[stats("a", n, n / 20), stats("b", n, n / 20)], Utc::now())
                    .unwrap(),
            );
            fractions.push(n as f64 / 4000.0);
        }
        let last = last.unwrap();
        assert_eq!(last.look, 40);

        let design = SequentialDesign::new(0.05, SpendingFunction::OBrienFleming).unwrap();
        let expected = design.current_boundary(&fractions).unwrap();
        assert!((last.efficacy_boundary - expected).abs() < 1e-9);
    }

    // ========================================================================
    // Checkpointed looks
    // ========================================================================

    #[test]
    fn test_restored_looks_continue_the_design() {
        let experiment = binary_experiment(Some(5000));
        let first = [stats("a", 1000, 50), stats("b", 1000, 55)];
        let second = [stats("a", 3000, 150), stats("b", 3000, 165)];
        let third = [stats("a", 4000, 200), stats("b", 4000, 220)];

        let live = AnalysisEngine::default();
        live.analyze(&experiment, &first, Utc::now()).unwrap();
        let at_second = live.analyze(&experiment, &second, Utc::now()).unwrap();
        assert_eq!(at_second.look, 2);
        assert!((at_second.information_fraction - 0.6).abs() < 1e-12);

        let records = live.look_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].look, 2);

        let restored = AnalysisEngine::default();
        assert_eq!(restored.restore_looks(&records).unwrap(), 1);
        assert_eq!(restored.look_count("exp-1"), 2);

        // Same data as the last look: no new look, same boundary
        let again = restored.analyze(&experiment, &second, Utc::now()).unwrap();
        assert_eq!(again.look, 2);
        assert!((again.efficacy_boundary - at_second.efficacy_boundary).abs() < 1e-12);
        assert!((again.final_boundary - at_second.final_boundary).abs() < 1e-12);
        assert!(again.sequence > at_second.sequence);

        let live_third = live.analyze(&experiment, &third, Utc::now()).unwrap();
        let restored_third = restored.analyze(&experiment, &third, Utc::now()).unwrap();
        assert_eq!(restored_third.look, 3);
        assert_eq!(live_third.look, 3);
        assert!((restored_third.efficacy_boundary - live_third.efficacy_boundary).abs() < 1e-12);
    }

    #[test]
    fn test_plan_only_record_fixes_planned_size() {
        // Planned from a near-zero smoothed control rate: far below the first look
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(None);
        let result = engine
            .analyze(&experiment, &[stats("a", 100, 0), stats("b", 100, 0)], Utc::now())
            .unwrap();
        assert_eq!(result.look, 0);
        let records = engine.look_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].look, 0);
        assert_eq!(records[0].planned_sample_size, result.planned_sample_size);

        let restored = AnalysisEngine::default();
        restored.restore_looks(&records).unwrap();
        let later = restored
            .analyze(&experiment, &[stats("a", 5000, 400), stats("b", 5000, 400)], Utc::now())
            .unwrap();
        assert_eq!(later.planned_sample_size, result.planned_sample_size);
        assert_eq!(later.look, 1);
    }

    #[test]
    fn test_restore_skips_experiments_with_live_looks() {
        let experiment = binary_experiment(Some(4000));
        let source = AnalysisEngine::default();
        source
            .analyze(&experiment, &[stats("a", 2000, 100), stats("b", 2000, 100)], Utc::now())
            .unwrap();

        let target = AnalysisEngine::default();
        target
            .analyze(&experiment, &[stats("a", 1000, 50), stats("b", 1000, 50)], Utc::now())
            .unwrap();
        assert_eq!(target.restore_looks(&source.look_records()).unwrap(), 0);
        assert!((target.look_records()[0].information_fraction - 0.25).abs() < 1e-12);
    }

    // ========================================================================
    // Bounded history
    // ========================================================================

    #[test]
    fn test_history_keeps_most_recent_results() {
        let engine = AnalysisEngine::new(AnalysisSettings {
            history_limit: 3,
            ..AnalysisSettings::default()
        });
        let experiment = binary_experiment(Some(4000));
        for k in 1..=5u64 {
            let n = k * 500;
            engine
                .analyze(&experiment, &[stats("a", n, n / 20), stats("b", n, n / 20)], Utc::now())
                .unwrap();
        }
        let history = engine.history("exp-1");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].look, 3);
        assert_eq!(engine.latest("exp-1").unwrap().look, 5);
        // Trimming results never touches the design
        assert_eq!(engine.look_count("exp-1"), 5);
    }

    #[test]
    fn test_forget_drops_looks_and_results() {
        let engine = AnalysisEngine::default();
        let experiment = binary_experiment(Some(4000));
        engine
            .analyze(&experiment, &[stats("a", 1000, 50), stats("b", 1000, 50)], Utc::now())
            .unwrap();
        engine.forget("exp-1");
        assert!(engine.history("exp-1").is_empty());
        assert!(engine.latest("exp-1").is_none());
        assert_eq!(engine.look_count("exp-1"), 0);
        assert!(engine.look_records().is_empty());
    }
}
