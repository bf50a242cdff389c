//! Decision Engine: autonomous stopping and winner rollout
//!
//! An evaluation has two halves:
//!
//! - [`DecisionEngine::plan`] snapshots the statistics, prepares the
//!   analysis and evaluates the policy table. It changes nothing.
//! - [`DecisionEngine::apply`] commits the plan: a stopping action concludes
//!   the experiment in the registry (guarded by the version seen at plan
//!   time) with the decision stored on the record; then the analysis look
//!   is recorded and, for efficacy, one implementation request is sent.
//!
//! Both halves run under a per-experiment lock. Once an experiment is
//! concluded, further evaluations return the decision stored on the record
//! without touching the registry or the sink.

mod policy;
mod sink;

pub use policy::{evaluate_policy, Action, PolicyInput};
pub use sink::{ChannelSink, ImplementationRequest, ImplementationSink, LogSink};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::aggregate::StatisticsAggregator;
use crate::analysis::{AnalysisEngine, AnalysisResult, PendingAnalysis};
use crate::experiment::{ExperimentRecord, ExperimentRegistry, ExperimentStatus};
use crate::{Error, Result};

/// A decision taken for an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Experiment decided on
    pub experiment_id: String,
    /// Chosen action
    #[serde(flatten)]
    pub action: Action,
    /// Analysis the decision was based on
    pub analysis_sequence: Option<u64>,
    /// Policy rule that fired
    pub rule: String,
    /// Human-readable explanation
    pub reason: String,
    /// When the decision was taken
    pub decided_at: DateTime<Utc>,
}

/// Outcome of [`DecisionEngine::plan`], consumed by [`DecisionEngine::apply`].
#[derive(Debug, Clone)]
pub struct DecisionPlan {
    experiment: ExperimentRecord,
    analysis: Option<PendingAnalysis>,
    decision: Decision,
    settled: bool,
}

impl DecisionPlan {
    /// The planned decision.
    #[must_use]
    pub const fn decision(&self) -> &Decision {
        &self.decision
    }

    /// The analysis behind it, if one ran.
    #[must_use]
    pub fn analysis(&self) -> Option<&AnalysisResult> {
        self.analysis.as_ref().map(|p| p.result().as_ref())
    }
}

/// Result of sweeping every active experiment.
#[derive(Debug, Default)]
pub struct Sweep {
    /// Decisions taken, ordered by experiment ID
    pub decisions: Vec<Decision>,
    /// Experiments whose evaluation failed, with the error
    pub failures: Vec<(String, Error)>,
}

/// Decisions kept per experiment; older ones are dropped.
pub const DECISION_LOG_LIMIT: usize = 1000;

/// Evaluates experiments and applies stopping decisions.
pub struct DecisionEngine {
    registry: Arc<ExperimentRegistry>,
    aggregator: Arc<StatisticsAggregator>,
    analysis: Arc<AnalysisEngine>,
    sink: Arc<dyn ImplementationSink>,
    decisions: DashMap<String, Vec<Decision>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DecisionEngine {
    /// Wire the engine to its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<ExperimentRegistry>,
        aggregator: Arc<StatisticsAggregator>,
        analysis: Arc<AnalysisEngine>,
        sink: Arc<dyn ImplementationSink>,
    ) -> Self {
        Self {
            registry,
            aggregator,
            analysis,
            sink,
            decisions: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, experiment_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(experiment_id.to_string())
                .or_default()
                .value(),
        )
    }

    /// Evaluate an experiment now.
    ///
    /// # Errors
    ///
    /// See [`evaluate_at`](Self::evaluate_at).
    pub fn evaluate(&self, experiment_id: &str) -> Result<Decision> {
        self.evaluate_at(experiment_id, Utc::now())
    }

    /// Evaluate an experiment as of `now`.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown experiment
    /// - `InvalidInput` for a draft or paused experiment
    /// - `Configuration` when the experiment cannot be analyzed
    /// - `Conflict` when the experiment changed between plan and apply
    pub fn evaluate_at(&self, experiment_id: &str, now: DateTime<Utc>) -> Result<Decision> {
        let never = AtomicBool::new(false);
        self.evaluate_unless_cancelled(experiment_id, now, &never)
    }

    /// Evaluate, skipping the apply step if `cancelled` is set once planning ends.
    ///
    /// Used by the scheduler to abandon runs that exceed their time budget.
    /// A cancelled run records nothing: no look, no analysis, no decision.
    ///
    /// # Errors
    ///
    /// As [`evaluate_at`](Self::evaluate_at), plus `Timeout` when cancelled.
    pub fn evaluate_unless_cancelled(
        &self,
        experiment_id: &str,
        now: DateTime<Utc>,
        cancelled: &AtomicBool,
    ) -> Result<Decision> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let plan = self.plan(experiment_id, now)?;
        if cancelled.load(Ordering::Acquire) {
            warn!(experiment_id, "evaluation cancelled after planning; nothing recorded");
            return Err(Error::Timeout(0));
        }
        self.apply(plan)
    }

    /// Analyze and evaluate the policy without changing lifecycle state.
    ///
    /// # Errors
    ///
    /// As [`evaluate_at`](Self::evaluate_at) minus `Conflict`.
    pub fn plan(&self, experiment_id: &str, now: DateTime<Utc>) -> Result<DecisionPlan> {
        let experiment = self.registry.get(experiment_id)?;

        match experiment.status() {
            ExperimentStatus::Active => {}
            status if status.is_terminal() => {
                let decision = experiment
                    .conclusion()
                    .cloned()
                    .unwrap_or_else(|| settled_elsewhere(&experiment, now));
                return Ok(DecisionPlan {
                    experiment,
                    analysis: None,
                    decision,
                    settled: true,
                });
            }
            status => {
                return Err(Error::InvalidInput(format!(
                    "experiment '{experiment_id}' is {status}; only active experiments are evaluated"
                )));
            }
        }

        let statistics = self.aggregator.snapshot(&experiment);
        let (analysis, analysis_error) = match self.analysis.prepare(&experiment, &statistics, now) {
            Ok(result) => (Some(result), None),
            Err(Error::Computation(reason)) => {
                warn!(experiment_id, %reason, "analysis skipped");
                (None, Some(reason))
            }
            Err(e) => return Err(e),
        };

        let input = PolicyInput {
            min_participants: statistics.iter().map(|s| s.participants).min().unwrap_or(0),
            min_sample_size: experiment.min_sample_size(),
            runtime: experiment.runtime(now),
            min_runtime: experiment.min_runtime(),
            max_runtime: experiment.max_runtime(),
            verdict: analysis.as_ref().map(|a| &a.result().verdict),
            analysis_error: analysis_error.as_deref(),
        };
        let (action, rule, reason) = evaluate_policy(&input);

        let decision = Decision {
            experiment_id: experiment_id.to_string(),
            action,
            analysis_sequence: analysis.as_ref().map(|a| a.result().sequence),
            rule: rule.to_string(),
            reason,
            decided_at: now,
        };
        debug!(experiment_id, rule, action = ?decision.action, "decision planned");
        Ok(DecisionPlan {
            experiment,
            analysis,
            decision,
            settled: false,
        })
    }

    /// Commit a plan.
    ///
    /// Nothing is recorded when concluding fails.
    ///
    /// # Errors
    ///
    /// `Conflict` if the experiment changed since the plan was made.
    pub fn apply(&self, plan: DecisionPlan) -> Result<Decision> {
        let DecisionPlan {
            experiment,
            analysis,
            decision,
            settled,
        } = plan;
        if settled {
            return Ok(decision);
        }
        let experiment_id = experiment.experiment_id();

        if decision.action.is_stop() {
            self.registry
                .conclude_with(&decision, Some(experiment.version()))?;
            info!(
                experiment_id,
                action = ?decision.action,
                reason = %decision.reason,
                "experiment concluded"
            );
        }
        if let Some(pending) = analysis {
            self.analysis.commit(pending);
        }

        if let Some(variant_id) = decision.action.winner() {
            let request = ImplementationRequest {
                experiment_id: experiment_id.to_string(),
                winning_variant_id: variant_id.to_string(),
                analysis_sequence: decision.analysis_sequence,
                decided_at: decision.decided_at,
            };
            if let Err(e) = self.sink.deliver(request) {
                error!(experiment_id, error = %e, "implementation request not delivered");
            }
        }

        let mut log = self.decisions.entry(experiment_id.to_string()).or_default();
        log.push(decision.clone());
        let excess = log.len().saturating_sub(DECISION_LOG_LIMIT);
        if excess > 0 {
            log.drain(..excess);
        }
        Ok(decision)
    }

    /// Evaluate every active experiment in parallel as of `now`.
    ///
    /// A failing experiment is reported in [`Sweep::failures`] and never
    /// stops the others.
    #[must_use]
    pub fn evaluate_all(&self, now: DateTime<Utc>) -> Sweep {
        let ids = self.registry.ids_with_status(ExperimentStatus::Active);
        let outcomes: Vec<(String, Result<Decision>)> = ids
            .into_par_iter()
            .map(|id| {
                let outcome = self.evaluate_at(&id, now);
                (id, outcome)
            })
            .collect();

        let mut sweep = Sweep::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(decision) => sweep.decisions.push(decision),
                Err(e) => {
                    error!(experiment_id = %id, error = %e, "evaluation failed");
                    sweep.failures.push((id, e));
                }
            }
        }
        sweep
    }

    /// Most recent decision for an experiment.
    #[must_use]
    pub fn latest_decision(&self, experiment_id: &str) -> Option<Decision> {
        self.decisions
            .get(experiment_id)
            .and_then(|d| d.value().last().cloned())
    }

    /// Recent decisions for an experiment, oldest first.
    ///
    /// At most [`DECISION_LOG_LIMIT`] are kept.
    #[must_use]
    pub fn decisions(&self, experiment_id: &str) -> Vec<Decision> {
        self.decisions
            .get(experiment_id)
            .map(|d| d.value().clone())
            .unwrap_or_default()
    }

    /// Drop the decision log of an experiment.
    ///
    /// The concluding decision stays on the experiment record.
    pub fn forget(&self, experiment_id: &str) {
        self.decisions.remove(experiment_id);
        self.locks.remove(experiment_id);
    }
}

/// Decision describing an experiment stopped outside the engine.
fn settled_elsewhere(experiment: &ExperimentRecord, now: DateTime<Utc>) -> Decision {
    let action = experiment.winning_variant().map_or(Action::StopInconclusive, |w| {
        Action::StopEfficacy {
            variant_id: w.to_string(),
        }
    });
    Decision {
        experiment_id: experiment.experiment_id().to_string(),
        action,
        analysis_sequence: None,
        rule: "settled".to_string(),
        reason: format!("experiment is {}", experiment.status()),
        decided_at: experiment.ended_at().unwrap_or(now),
    }
}
