//! # Trueno-AB: Experimentation & Statistical Decision Engine
//!
//! **Version**: 0.1.0
//!
//! Trueno-AB assigns visitors to experiment variants, aggregates their
//! events in real time, tests significance with sequential
//! (alpha-spending) boundaries and concludes experiments on its own when a
//! variant wins, loses or runs out of time.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Jidoka**: Invalid configuration stops activation instead of being
//!   silently defaulted
//! - **Poka-Yoke**: Deterministic hashing plus insert-if-absent means a
//!   visitor can never see two variants in one epoch
//! - **Heijunka**: Single-flight analysis per experiment, coalescing bursts
//!   of events into one run
//! - **Genchi Genbutsu**: The event log is the source of truth; counters
//!   can always be reconciled against it
//!
//! ## Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`experiment`] | Experiment/variant definitions, lifecycle registry |
//! | [`assignment`] | Deterministic, sticky visitor → variant placement |
//! | [`events`] | Event ingestion gateway and append-only event log |
//! | [`aggregate`] | Lock-free running statistics per variant |
//! | [`stats`] | z/t tests, Beta posteriors, alpha-spending boundaries |
//! | [`analysis`] | Per-look analysis with an audit history |
//! | [`decision`] | Stopping policy, conclusion and winner rollout |
//! | [`scheduler`] | Background analysis on notification or interval |
//! | [`storage`] | Parquet event-log checkpoints |
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use trueno_ab::api::IngestRequest;
//! use trueno_ab::experiment::{EventType, ExperimentRecord, ExperimentStatus, VariantRecord};
//! use trueno_ab::Engine;
//!
//! # async fn demo() -> trueno_ab::Result<()> {
//! let engine = Engine::builder().build()?;
//! engine.create_experiment(
//!     ExperimentRecord::builder("headline", "Headline test")
//!         .variant(VariantRecord::control("a", "Current", 0.5))
//!         .variant(VariantRecord::new("b", "Shorter", 0.5))
//!         .build(),
//! )?;
//! engine.transition("headline", ExperimentStatus::Active, None)?;
//!
//! let variant = engine.assign("headline", "visitor-42").await?;
//! engine
//!     .ingest(IngestRequest::new("headline", "visitor-42", EventType::Exposure))
//!     .await?;
//!
//! let decision = engine.evaluate("headline")?;
//! println!("{variant}: {:?}", decision.action);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod aggregate;
pub mod analysis;
pub mod api;
pub mod assignment;
pub mod config;
pub mod decision;
pub mod error;
pub mod events;
pub mod experiment;
pub mod logging;
pub mod scheduler;
pub mod stats;
pub mod storage;

pub use error::{Error, Result};

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::info;

use aggregate::{Ack, ReconcileReport, ReplayReport, RunningStatistics, SnapshotUpdated, StatisticsAggregator};
use analysis::{AnalysisEngine, AnalysisResult};
use api::{AssignRequest, AssignResponse, IngestRequest, IngestResponse, ResultsResponse};
use assignment::{AssignmentEngine, AssignmentStore, MemoryAssignmentStore};
use config::EngineConfig;
use decision::{Decision, DecisionEngine, ImplementationSink, LogSink, Sweep};
use events::{EventGateway, EventLog};
use experiment::{EventRecord, ExperimentRecord, ExperimentRegistry, ExperimentStatus};
use scheduler::{Scheduler, SchedulerHandle};
use storage::{CheckpointSummary, RestoreReport};

/// Engine instance wiring every component together.
pub struct Engine<S: AssignmentStore = MemoryAssignmentStore> {
    config: EngineConfig,
    registry: Arc<ExperimentRegistry>,
    assignment: Arc<AssignmentEngine<S>>,
    aggregator: Arc<StatisticsAggregator>,
    analysis: Arc<AnalysisEngine>,
    decisions: Arc<DecisionEngine>,
    gateway: EventGateway<S>,
    log: Arc<EventLog>,
    updates: Mutex<Option<mpsc::Receiver<SnapshotUpdated>>>,
}

impl Engine {
    /// Create a new engine builder
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }
}

/// Engine builder
pub struct EngineBuilder<S: AssignmentStore = MemoryAssignmentStore> {
    config: EngineConfig,
    store: Arc<S>,
    sink: Arc<dyn ImplementationSink>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            store: Arc::new(MemoryAssignmentStore::new()),
            sink: Arc::new(LogSink),
        }
    }
}

impl<S: AssignmentStore> EngineBuilder<S> {
    /// Set the configuration
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the receiver of implementation requests
    #[must_use]
    pub fn sink(mut self, sink: impl ImplementationSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Use another assignment store
    #[must_use]
    pub fn store<T: AssignmentStore>(self, store: T) -> EngineBuilder<T> {
        EngineBuilder {
            config: self.config,
            store: Arc::new(store),
            sink: self.sink,
        }
    }

    /// Build the engine
    ///
    /// # Errors
    ///
    /// `Configuration` if the configuration is invalid
    pub fn build(self) -> Result<Engine<S>> {
        self.config.validate()?;

        let registry = Arc::new(ExperimentRegistry::new());
        let assignment = Arc::new(AssignmentEngine::new(Arc::clone(&registry), self.store));
        let (tx, rx) = mpsc::channel(self.config.notification_capacity);
        let aggregator = Arc::new(StatisticsAggregator::with_notifier(tx));
        let analysis = Arc::new(AnalysisEngine::new(self.config.analysis));
        let decisions = Arc::new(DecisionEngine::new(
            Arc::clone(&registry),
            Arc::clone(&aggregator),
            Arc::clone(&analysis),
            self.sink,
        ));
        let log = Arc::new(EventLog::new());
        let gateway = EventGateway::new(
            Arc::clone(&registry),
            Arc::clone(&assignment),
            Arc::clone(&aggregator),
            Arc::clone(&log),
        );

        Ok(Engine {
            config: self.config,
            registry,
            assignment,
            aggregator,
            analysis,
            decisions,
            gateway,
            log,
            updates: Mutex::new(Some(rx)),
        })
    }
}

impl<S: AssignmentStore> Engine<S> {
    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Experiment registry
    #[must_use]
    pub const fn registry(&self) -> &Arc<ExperimentRegistry> {
        &self.registry
    }

    /// Event log
    #[must_use]
    pub const fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Register a draft experiment.
    ///
    /// # Errors
    ///
    /// See [`ExperimentRegistry::create`].
    pub fn create_experiment(&self, record: ExperimentRecord) -> Result<ExperimentRecord> {
        self.registry.create(record)
    }

    /// Current state of an experiment.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown ID.
    pub fn experiment(&self, experiment_id: &str) -> Result<ExperimentRecord> {
        self.registry.get(experiment_id)
    }

    /// Move an experiment through its lifecycle.
    ///
    /// # Errors
    ///
    /// See [`ExperimentRegistry::transition`].
    pub fn transition(
        &self,
        experiment_id: &str,
        to: ExperimentStatus,
        expected_version: Option<u64>,
    ) -> Result<ExperimentRecord> {
        self.registry.transition(experiment_id, to, expected_version)
    }

    /// Start a new epoch: assignments, counters and looks are discarded.
    ///
    /// Allowed in `draft` and `paused` only. The event log keeps old events;
    /// they no longer count because their epoch is superseded.
    ///
    /// # Errors
    ///
    /// See [`ExperimentRegistry::reset`]; store failures propagate.
    pub async fn reset_experiment(
        &self,
        experiment_id: &str,
        expected_version: Option<u64>,
    ) -> Result<ExperimentRecord> {
        let record = self.registry.reset(experiment_id, expected_version)?;
        self.assignment.reset_experiment(experiment_id).await?;
        self.aggregator.reset(experiment_id, record.epoch());
        self.analysis.forget_looks(experiment_id);
        info!(experiment_id, epoch = record.epoch(), "experiment reset");
        Ok(record)
    }

    /// Archive a draft or finished experiment and drop its in-memory analyses and decisions.
    ///
    /// The concluding decision stays on the record.
    ///
    /// # Errors
    ///
    /// See [`ExperimentRegistry::archive`].
    pub fn archive_experiment(
        &self,
        experiment_id: &str,
        expected_version: Option<u64>,
    ) -> Result<ExperimentRecord> {
        let record = self.registry.archive(experiment_id, expected_version)?;
        self.analysis.forget(experiment_id);
        self.decisions.forget(experiment_id);
        info!(experiment_id, "experiment archived");
        Ok(record)
    }

    /// Variant a visitor should see.
    ///
    /// # Errors
    ///
    /// See [`AssignmentEngine::assign`].
    pub async fn assign(&self, experiment_id: &str, visitor_id: &str) -> Result<String> {
        self.assignment.assign(experiment_id, visitor_id).await
    }

    /// Assignment endpoint.
    ///
    /// # Errors
    ///
    /// As [`assign`](Self::assign).
    pub async fn handle_assign(&self, request: AssignRequest) -> Result<AssignResponse> {
        let variant_id = self.assign(&request.experiment_id, &request.visitor_id).await?;
        Ok(AssignResponse { variant_id })
    }

    /// Ingestion endpoint.
    ///
    /// # Errors
    ///
    /// See [`EventGateway::ingest_at`].
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestResponse> {
        self.ingest_at(request, Utc::now()).await
    }

    /// Ingest with an explicit gateway timestamp.
    ///
    /// # Errors
    ///
    /// See [`EventGateway::ingest_at`].
    pub async fn ingest_at(&self, request: IngestRequest, now: DateTime<Utc>) -> Result<IngestResponse> {
        self.gateway.ingest_at(request, now).await.map(IngestResponse::from)
    }

    /// Live statistics, control first.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown experiment.
    pub fn snapshot(&self, experiment_id: &str) -> Result<Vec<RunningStatistics>> {
        let experiment = self.registry.get(experiment_id)?;
        Ok(self.aggregator.snapshot(&experiment))
    }

    /// Run an analysis now without deciding anything.
    ///
    /// # Errors
    ///
    /// See [`AnalysisEngine::analyze`].
    pub fn analyze(&self, experiment_id: &str) -> Result<Arc<AnalysisResult>> {
        let experiment = self.registry.get(experiment_id)?;
        let statistics = self.aggregator.snapshot(&experiment);
        self.analysis.analyze(&experiment, &statistics, Utc::now())
    }

    /// Every analysis of an experiment, oldest first.
    #[must_use]
    pub fn analysis_history(&self, experiment_id: &str) -> Vec<Arc<AnalysisResult>> {
        self.analysis.history(experiment_id)
    }

    /// Evaluate the stopping policy now.
    ///
    /// # Errors
    ///
    /// See [`DecisionEngine::evaluate_at`].
    pub fn evaluate(&self, experiment_id: &str) -> Result<Decision> {
        self.decisions.evaluate(experiment_id)
    }

    /// Evaluate the stopping policy as of `now`.
    ///
    /// # Errors
    ///
    /// See [`DecisionEngine::evaluate_at`].
    pub fn evaluate_at(&self, experiment_id: &str, now: DateTime<Utc>) -> Result<Decision> {
        self.decisions.evaluate_at(experiment_id, now)
    }

    /// Evaluate every active experiment.
    #[must_use]
    pub fn evaluate_all(&self, now: DateTime<Utc>) -> Sweep {
        self.decisions.evaluate_all(now)
    }

    /// Results endpoint.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown experiment.
    pub fn results(&self, experiment_id: &str) -> Result<ResultsResponse> {
        let experiment = self.registry.get(experiment_id)?;
        let statistics = self.aggregator.snapshot(&experiment);
        Ok(ResultsResponse {
            analysis: self
                .analysis
                .latest(experiment_id)
                .map(|a| AnalysisResult::clone(&a)),
            decision: self
                .decisions
                .latest_decision(experiment_id)
                .or_else(|| experiment.conclusion().cloned()),
            experiment,
            statistics,
        })
    }

    /// Rebuild an experiment's counters from the event log.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown experiment.
    pub fn reconcile(&self, experiment_id: &str) -> Result<ReconcileReport> {
        let experiment = self.registry.get(experiment_id)?;
        let events = self.log.events_for(experiment_id);
        Ok(self.aggregator.reconcile(&experiment, &events))
    }

    /// Save experiments, the event log and the sequential looks into `dir`.
    ///
    /// # Errors
    ///
    /// `Io`, `Parquet`, `Arrow` or `Serialization` on write failure.
    pub fn checkpoint<P: AsRef<Path>>(&self, dir: P) -> Result<CheckpointSummary> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let experiments =
            storage::write_experiments(dir.join(storage::EXPERIMENTS_FILE), &self.registry.list(true))?;
        let events = storage::write_events(dir.join(storage::EVENTS_FILE), &self.log.all())?;
        let looks = storage::write_looks(dir.join(storage::LOOKS_FILE), &self.analysis.look_records())?;
        Ok(CheckpointSummary {
            experiments,
            events,
            looks,
        })
    }

    /// Load a checkpoint written by [`checkpoint`](Self::checkpoint).
    ///
    /// Experiments already registered are kept, and so is look state an
    /// experiment already has here; events are deduplicated. Restoring the
    /// same checkpoint twice is harmless. A checkpoint without a look file
    /// restores with no looks taken.
    ///
    /// # Errors
    ///
    /// `StorageError`, `Io` or `Serialization` on read failure.
    pub fn restore<P: AsRef<Path>>(&self, dir: P) -> Result<RestoreReport> {
        let dir = dir.as_ref();
        let mut report = RestoreReport::default();
        for record in storage::read_experiments(dir.join(storage::EXPERIMENTS_FILE))? {
            if !self.registry.contains(record.experiment_id()) {
                self.registry.restore(record)?;
                report.experiments += 1;
            }
        }
        let looks = dir.join(storage::LOOKS_FILE);
        if looks.exists() {
            report.looks = self.analysis.restore_looks(&storage::read_looks(looks)?)?;
        }
        report.replay = self.replay(storage::read_events(dir.join(storage::EVENTS_FILE))?);
        info!(
            experiments = report.experiments,
            looks = report.looks,
            accepted = report.replay.accepted,
            "checkpoint restored"
        );
        Ok(report)
    }

    /// Re-apply events to the counters and the log.
    ///
    /// Only newly accepted events are appended to the log.
    pub fn replay(&self, events: Vec<EventRecord>) -> ReplayReport {
        let mut report = ReplayReport::default();
        for event in events {
            match self.aggregator.record(&event) {
                Ack::Accepted => {
                    report.accepted += 1;
                    self.log.append(event);
                }
                Ack::Duplicate => report.duplicates += 1,
                Ack::Stale => report.stale += 1,
            }
        }
        report
    }

    /// Start the background scheduler; callable once per engine.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `Conflict` if the scheduler was already started.
    pub fn spawn_scheduler(&self) -> Result<SchedulerHandle> {
        let updates = self
            .updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Conflict("scheduler already started".to_string()))?;
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.decisions),
            self.config.scheduler(),
        ));
        Ok(scheduler.spawn(updates))
    }
}
