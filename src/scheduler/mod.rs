//! Analysis scheduler
//!
//! Drives the [`DecisionEngine`] from two sources:
//!
//! - `SnapshotUpdated` notifications from the aggregator (event driven)
//! - a periodic tick over every active experiment (time driven, so runtime
//!   limits fire even without traffic)
//!
//! Runs are single-flight per experiment. A trigger that arrives while a run
//! is in flight is coalesced into exactly one follow-up run. Every run is
//! bounded by `analysis_timeout`; an expired run is abandoned before it can
//! commit anything and reported as `Timeout`.
//!
//! The evaluation itself is CPU-bound and runs on the blocking pool.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::aggregate::SnapshotUpdated;
use crate::decision::{Decision, DecisionEngine};
use crate::experiment::{ExperimentRegistry, ExperimentStatus};
use crate::{Error, Result};

/// Scheduler timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Budget for one evaluation
    pub analysis_timeout: Duration,
    /// Period of the sweep over active experiments
    pub evaluation_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            analysis_timeout: Duration::from_secs(30),
            evaluation_interval: Duration::from_secs(60),
        }
    }
}

/// Counters describing scheduler activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Evaluations that returned a decision
    pub evaluations: u64,
    /// Evaluations that exceeded the timeout
    pub timeouts: u64,
    /// Evaluations that failed for another reason
    pub failures: u64,
    /// Triggers folded into an in-flight run
    pub coalesced: u64,
}

#[derive(Debug, Default)]
struct Counters {
    evaluations: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
    coalesced: AtomicU64,
}

/// Single-flight, time-bounded evaluation runner.
pub struct Scheduler {
    registry: Arc<ExperimentRegistry>,
    decisions: Arc<DecisionEngine>,
    config: SchedulerConfig,
    in_flight: DashSet<String>,
    pending: DashSet<String>,
    counters: Counters,
}

impl Scheduler {
    /// Create a scheduler over an engine.
    #[must_use]
    pub fn new(
        registry: Arc<ExperimentRegistry>,
        decisions: Arc<DecisionEngine>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            decisions,
            config,
            in_flight: DashSet::new(),
            pending: DashSet::new(),
            counters: Counters::default(),
        }
    }

    /// Scheduler timing.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Activity counters so far.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            evaluations: self.counters.evaluations.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Evaluate one experiment on the blocking pool within the timeout.
    ///
    /// # Errors
    ///
    /// `Timeout` when the budget expires, otherwise whatever the
    /// evaluation returns.
    pub async fn evaluate(&self, experiment_id: &str) -> Result<Decision> {
        let engine = Arc::clone(&self.decisions);
        let id = experiment_id.to_string();
        let now = Utc::now();
        run_bounded(self.config.analysis_timeout, move |cancelled| {
            engine.evaluate_unless_cancelled(&id, now, cancelled)
        })
        .await
    }

    /// Request a run for an experiment.
    ///
    /// Returns `true` if a new worker was started, `false` if the request
    /// was folded into a run already in flight.
    pub fn trigger(self: &Arc<Self>, experiment_id: &str) -> bool {
        if self.claim(experiment_id) {
            return true;
        }
        self.pending.insert(experiment_id.to_string());
        // The worker may have finished between the two checks.
        if self.claim(experiment_id) {
            return true;
        }
        self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
        false
    }

    fn claim(self: &Arc<Self>, experiment_id: &str) -> bool {
        if !self.in_flight.insert(experiment_id.to_string()) {
            return false;
        }
        let this = Arc::clone(self);
        let id = experiment_id.to_string();
        tokio::spawn(async move { this.work(id).await });
        true
    }

    async fn work(self: Arc<Self>, experiment_id: String) {
        loop {
            self.pending.remove(&experiment_id);
            let outcome = self.evaluate(&experiment_id).await;
            self.record(&experiment_id, &outcome);

            if self.pending.remove(&experiment_id).is_some() {
                continue;
            }
            self.in_flight.remove(&experiment_id);
            if self.pending.contains(&experiment_id) && self.in_flight.insert(experiment_id.clone()) {
                continue;
            }
            break;
        }
    }

    fn record(&self, experiment_id: &str, outcome: &Result<Decision>) {
        match outcome {
            Ok(decision) => {
                self.counters.evaluations.fetch_add(1, Ordering::Relaxed);
                debug!(experiment_id, action = ?decision.action, "scheduled evaluation done");
            }
            Err(Error::Timeout(ms)) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(experiment_id, timeout_ms = ms, "scheduled evaluation timed out");
            }
            // Paused between trigger and run.
            Err(Error::InvalidInput(reason)) => {
                debug!(experiment_id, %reason, "scheduled evaluation skipped");
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                error!(experiment_id, error = %e, "scheduled evaluation failed");
            }
        }
    }

    /// Trigger every active experiment.
    pub fn sweep(self: &Arc<Self>) -> usize {
        let ids = self.registry.ids_with_status(ExperimentStatus::Active);
        for id in &ids {
            self.trigger(id);
        }
        ids.len()
    }

    /// Run until shut down, consuming snapshot notifications and ticking.
    ///
    /// When the notification channel closes the scheduler keeps ticking.
    #[must_use]
    pub fn spawn(self: Arc<Self>, mut updates: mpsc::Receiver<SnapshotUpdated>) -> SchedulerHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let scheduler = Arc::clone(&self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.evaluation_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut updates_open = true;
            info!(
                interval_ms = duration_ms(scheduler.config.evaluation_interval),
                timeout_ms = duration_ms(scheduler.config.analysis_timeout),
                "scheduler started"
            );

            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    update = updates.recv(), if updates_open => match update {
                        Some(update) => {
                            scheduler.trigger(&update.experiment_id);
                        }
                        None => {
                            debug!("snapshot notifications closed; ticking only");
                            updates_open = false;
                        }
                    },
                    _ = ticker.tick() => {
                        let triggered = scheduler.sweep();
                        debug!(triggered, "scheduler tick");
                    }
                }
            }
            info!("scheduler stopped");
        });
        SchedulerHandle {
            scheduler: self,
            shutdown,
            task,
        }
    }
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    scheduler: Arc<Scheduler>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// The scheduler behind this handle.
    #[must_use]
    pub const fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Stop the loop and wait for it; runs already started finish on their own.
    ///
    /// # Errors
    ///
    /// `Computation` if the loop task panicked.
    pub async fn shutdown(self) -> Result<SchedulerStats> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| Error::Computation(format!("scheduler task failed: {e}")))?;
        Ok(self.scheduler.stats())
    }
}

/// Run `work` on the blocking pool, cancelling it if `timeout` expires.
///
/// The closure receives the cancel flag and must check it before committing
/// side effects. Work still running at expiry is not interrupted; it sees
/// the flag and records nothing.
async fn run_bounded<T, F>(timeout: Duration, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&AtomicBool) -> Result<T> + Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    let task = tokio::task::spawn_blocking(move || work(&flag));
    bounded(timeout, task, &cancelled).await
}

async fn bounded<T>(
    timeout: Duration,
    task: impl Future<Output = std::result::Result<Result<T>, tokio::task::JoinError>>,
    cancelled: &AtomicBool,
) -> Result<T> {
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join)) => Err(Error::Computation(format!("evaluation task failed: {join}"))),
        Err(_) => {
            cancelled.store(true, Ordering::Release);
            Err(Error::Timeout(duration_ms(timeout)))
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::StatisticsAggregator;
    use crate::analysis::AnalysisEngine;
    use crate::decision::{Action, ChannelSink};
    use crate::experiment::{EventRecord, EventType, ExperimentRecord, VariantRecord};

    fn setup() -> (
        Arc<ExperimentRegistry>,
        Arc<StatisticsAggregator>,
        Arc<DecisionEngine>,
        tokio::sync::mpsc::UnboundedReceiver<crate::decision::ImplementationRequest>,
        mpsc::Receiver<SnapshotUpdated>,
    ) {
        let registry = Arc::new(ExperimentRegistry::new());
        registry
            .create(
                ExperimentRecord::builder("exp-1", "Scheduled")
                    .variant(VariantRecord::control("a", "A", 0.5))
                    .variant(VariantRecord::new("b", "B", 0.5))
                    .planned_sample_size(2000)
                    .build(),
            )
            .unwrap();
        registry.transition("exp-1", ExperimentStatus::Active, None).unwrap();

        let (tx, rx) = mpsc::channel(64);
        let aggregator = Arc::new(StatisticsAggregator::with_notifier(tx));
        let (sink, webhooks) = ChannelSink::new();
        let decisions = Arc::new(DecisionEngine::new(
            Arc::clone(&registry),
            Arc::clone(&aggregator),
            Arc::new(AnalysisEngine::default()),
            Arc::new(sink),
        ));
        (registry, aggregator, decisions, webhooks, rx)
    }

    fn load(aggregator: &StatisticsAggregator, variant: &str, visitors: u64, converters: u64) {
        for i in 0..visitors {
            let visitor = format!("{variant}-{i}");
            aggregator.record(
                &EventRecord::builder("exp-1", visitor.as_str(), variant, EventType::Exposure).build(),
            );
            if i < converters {
                aggregator.record(
                    &EventRecord::builder("exp-1", visitor.as_str(), variant, EventType::Conversion)
                        .build(),
                );
            }
        }
    }

    #[tokio::test]
    async fn test_bounded_run_times_out_and_cancels() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let task = tokio::task::spawn_blocking(|| {
            std::thread::sleep(Duration::from_millis(300));
            Ok::<_, Error>(1)
        });
        let outcome = bounded(Duration::from_millis(10), task, &flag).await;
        assert!(matches!(outcome, Err(Error::Timeout(10))));
        assert!(cancelled.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_bounded_run_passes_result_through() {
        let outcome = run_bounded(Duration::from_secs(5), |_| Ok::<_, Error>(7)).await;
        assert_eq!(outcome.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_timed_out_run_records_no_look() {
        let (registry, aggregator, _decisions, _webhooks, _rx) = setup();
        let analysis = Arc::new(AnalysisEngine::default());
        let (sink, _requests) = ChannelSink::new();
        let engine = Arc::new(DecisionEngine::new(
            Arc::clone(&registry),
            Arc::clone(&aggregator),
            Arc::clone(&analysis),
            Arc::new(sink),
        ));

        load(&aggregator, "a", 1000, 50);
        load(&aggregator, "b", 1000, 70);
        engine.evaluate("exp-1").unwrap();
        assert_eq!(analysis.look_count("exp-1"), 1);

        // The run only gets going once its budget has expired
        load(&aggregator, "a", 2000, 100);
        load(&aggregator, "b", 2000, 140);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let late = Arc::clone(&engine);
        let outcome = run_bounded(Duration::from_millis(20), move |cancelled| {
            while !cancelled.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            let result = late.evaluate_unless_cancelled("exp-1", Utc::now(), cancelled);
            let _ = done_tx.send(result.is_err());
            result
        })
        .await;
        assert!(matches!(outcome, Err(Error::Timeout(20))));
        assert!(done_rx.await.unwrap());

        assert_eq!(analysis.look_count("exp-1"), 1);
        assert_eq!(analysis.history("exp-1").len(), 1);
        assert_eq!(registry.get("exp-1").unwrap().status(), ExperimentStatus::Active);
        assert_eq!(engine.decisions("exp-1").len(), 1);
    }

    #[tokio::test]
    async fn test_evaluate_on_blocking_pool() {
        let (registry, aggregator, decisions, _webhooks, _rx) = setup();
        load(&aggregator, "a", 200, 10);
        load(&aggregator, "b", 200, 12);
        let scheduler = Scheduler::new(registry, decisions, SchedulerConfig::default());
        let decision = scheduler.evaluate("exp-1").await.unwrap();
        assert_eq!(decision.action, Action::Continue);
        assert!(matches!(scheduler.evaluate("missing").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_trigger_coalesces_while_in_flight() {
        let (registry, _aggregator, decisions, _webhooks, _rx) = setup();
        let scheduler = Arc::new(Scheduler::new(registry, decisions, SchedulerConfig::default()));
        scheduler.in_flight.insert("exp-1".to_string());

        assert!(!scheduler.trigger("exp-1"));
        assert!(!scheduler.trigger("exp-1"));
        assert!(scheduler.pending.contains("exp-1"));
        assert_eq!(scheduler.pending.len(), 1);
        assert_eq!(scheduler.stats().coalesced, 2);
    }

    #[tokio::test]
    async fn test_notifications_drive_conclusion() {
        let (registry, aggregator, decisions, mut webhooks, rx) = setup();
        let config = SchedulerConfig {
            analysis_timeout: Duration::from_secs(10),
            evaluation_interval: Duration::from_secs(3600),
        };
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&registry), decisions, config));
        let handle = Arc::clone(&scheduler).spawn(rx);

        load(&aggregator, "a", 2000, 100);
        load(&aggregator, "b", 2000, 140);

        let request = tokio::time::timeout(Duration::from_secs(10), webhooks.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.winning_variant_id, "b");
        assert_eq!(registry.get("exp-1").unwrap().status(), ExperimentStatus::Concluded);

        let stats = handle.shutdown().await.unwrap();
        assert!(stats.evaluations >= 1);
        assert_eq!(stats.timeouts, 0);
    }
}
