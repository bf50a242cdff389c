//! Event Ingestion Gateway and the append-only event log
//!
//! The gateway is the single entry point for behavioral events:
//!
//! 1. Validate the request shape (IDs, dedupe key, value rules per type)
//! 2. Resolve the experiment (must be `active`) and the visitor's variant
//!    through the assignment engine
//! 3. Stamp the gateway timestamp and the experiment epoch
//! 4. Count it in the aggregator; append to the log only if accepted
//!
//! The log never updates or deletes an event. Resetting an experiment
//! starts a new epoch instead, and older events simply stop counting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::aggregate::{Ack, StatisticsAggregator};
use crate::api::IngestRequest;
use crate::assignment::{validate_visitor_id, AssignmentEngine, AssignmentStore};
use crate::experiment::{EventRecord, EventType, ExperimentRegistry, ExperimentStatus};
use crate::{Error, Result};

/// Longest accepted dedupe key in bytes.
pub const MAX_DEDUPE_KEY_LEN: usize = 256;

/// Append-only per-experiment event log.
#[derive(Debug, Default)]
pub struct EventLog {
    events: DashMap<String, Vec<EventRecord>>,
}

impl EventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event.
    pub fn append(&self, event: EventRecord) {
        self.events
            .entry(event.experiment_id().to_string())
            .or_default()
            .push(event);
    }

    /// Append many events (restore from a checkpoint).
    pub fn extend(&self, events: impl IntoIterator<Item = EventRecord>) {
        for event in events {
            self.append(event);
        }
    }

    /// Events of one experiment in append order.
    #[must_use]
    pub fn events_for(&self, experiment_id: &str) -> Vec<EventRecord> {
        self.events
            .get(experiment_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Every event, ordered by timestamp then experiment.
    #[must_use]
    pub fn all(&self) -> Vec<EventRecord> {
        let mut all: Vec<EventRecord> = self
            .events
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        all.sort_by(|a, b| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| a.experiment_id().cmp(b.experiment_id()))
        });
        all
    }

    /// Total number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.iter().map(|e| e.value().len()).sum()
    }

    /// Check if the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validate a request before touching any state.
///
/// # Errors
///
/// `InvalidInput` naming the first problem.
pub fn validate_request(request: &IngestRequest) -> Result<()> {
    if request.experiment_id.trim().is_empty() {
        return Err(Error::InvalidInput("experiment id must not be empty".to_string()));
    }
    validate_visitor_id(&request.visitor_id)?;

    let key = request.dedupe_key.trim();
    if key.is_empty() || request.dedupe_key.len() > MAX_DEDUPE_KEY_LEN {
        return Err(Error::InvalidInput(format!(
            "dedupe key must be 1..={MAX_DEDUPE_KEY_LEN} bytes and not blank"
        )));
    }

    match (request.event_type, request.value) {
        (_, Some(v)) if !v.is_finite() => Err(Error::InvalidInput(format!(
            "event value must be finite, got {v}"
        ))),
        (EventType::Exposure, Some(_)) => Err(Error::InvalidInput(
            "exposure events carry no value".to_string(),
        )),
        (EventType::Metric, None) => Err(Error::InvalidInput(
            "metric events require a value".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Validates, stamps and records incoming events.
pub struct EventGateway<S: AssignmentStore> {
    registry: Arc<ExperimentRegistry>,
    assignment: Arc<AssignmentEngine<S>>,
    aggregator: Arc<StatisticsAggregator>,
    log: Arc<EventLog>,
}

impl<S: AssignmentStore> EventGateway<S> {
    /// Wire a gateway to its collaborators.
    #[must_use]
    pub const fn new(
        registry: Arc<ExperimentRegistry>,
        assignment: Arc<AssignmentEngine<S>>,
        aggregator: Arc<StatisticsAggregator>,
        log: Arc<EventLog>,
    ) -> Self {
        Self {
            registry,
            assignment,
            aggregator,
            log,
        }
    }

    /// Ingest an event stamped with the current time.
    ///
    /// # Errors
    ///
    /// See [`ingest_at`](Self::ingest_at).
    pub async fn ingest(&self, request: IngestRequest) -> Result<Ack> {
        self.ingest_at(request, Utc::now()).await
    }

    /// Ingest an event stamped with `now`.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for a malformed request or an experiment that is not active
    /// - `NotFound` for an unknown experiment
    pub async fn ingest_at(&self, request: IngestRequest, now: DateTime<Utc>) -> Result<Ack> {
        validate_request(&request)?;
        let experiment = self.registry.get(&request.experiment_id)?;
        if experiment.status() != ExperimentStatus::Active {
            return Err(Error::InvalidInput(format!(
                "experiment '{}' is {} and not accepting events",
                request.experiment_id,
                experiment.status()
            )));
        }

        let variant_id = self.assignment.assign_in(&experiment, &request.visitor_id).await?;
        let event = EventRecord::builder(
            request.experiment_id,
            request.visitor_id,
            variant_id,
            request.event_type,
        )
        .epoch(experiment.epoch())
        .maybe_value(request.value)
        .dedupe_key(request.dedupe_key)
        .timestamp(now)
        .build();

        let ack = self.aggregator.record(&event);
        match ack {
            Ack::Accepted => {
                trace!(
                    experiment_id = event.experiment_id(),
                    variant_id = event.variant_id(),
                    event_type = %event.event_type(),
                    "event accepted"
                );
                self.log.append(event);
            }
            Ack::Duplicate | Ack::Stale => {
                debug!(
                    experiment_id = event.experiment_id(),
                    dedupe_key = event.dedupe_key(),
                    ?ack,
                    "event not counted"
                );
            }
        }
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::MemoryAssignmentStore;
    use crate::experiment::{ExperimentRecord, VariantRecord};

    fn request(visitor: &str, event_type: EventType, key: &str) -> IngestRequest {
        IngestRequest {
            experiment_id: "exp-1".to_string(),
            visitor_id: visitor.to_string(),
            event_type,
            value: None,
            dedupe_key: key.to_string(),
        }
    }

    fn gateway() -> (EventGateway<MemoryAssignmentStore>, Arc<ExperimentRegistry>, Arc<EventLog>) {
        let registry = Arc::new(ExperimentRegistry::new());
        registry
            .create(
                ExperimentRecord::builder("exp-1", "Test")
                    .variant(VariantRecord::control("a", "A", 0.5))
                    .variant(VariantRecord::new("b", "B", 0.5))
                    .build(),
            )
            .unwrap();
        let assignment = Arc::new(AssignmentEngine::new(
            Arc::clone(&registry),
            Arc::new(MemoryAssignmentStore::new()),
        ));
        let log = Arc::new(EventLog::new());
        let gateway = EventGateway::new(
            Arc::clone(&registry),
            assignment,
            Arc::new(StatisticsAggregator::new()),
            Arc::clone(&log),
        );
        (gateway, registry, log)
    }

    #[test]
    fn test_validate_request_rules() {
        assert!(validate_request(&request("v1", EventType::Exposure, "k")).is_ok());
        assert!(validate_request(&request("", EventType::Exposure, "k")).is_err());
        assert!(validate_request(&request("v1", EventType::Exposure, " ")).is_err());
        assert!(validate_request(&request("v1", EventType::Metric, "k")).is_err());

        let mut exposure_with_value = request("v1", EventType::Exposure, "k");
        exposure_with_value.value = Some(1.0);
        assert!(validate_request(&exposure_with_value).is_err());

        let mut nan_metric = request("v1", EventType::Metric, "k");
        nan_metric.value = Some(f64::NAN);
        assert!(validate_request(&nan_metric).is_err());
    }

    #[tokio::test]
    async fn test_rejects_draft_and_unknown() {
        let (gateway, _, _) = gateway();
        assert!(matches!(
            gateway.ingest(request("v1", EventType::Exposure, "k1")).await,
            Err(Error::InvalidInput(_))
        ));

        let mut unknown = request("v1", EventType::Exposure, "k1");
        unknown.experiment_id = "nope".to_string();
        assert!(matches!(gateway.ingest(unknown).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_accepted_events_are_logged_once() {
        let (gateway, registry, log) = gateway();
        registry.transition("exp-1", ExperimentStatus::Active, None).unwrap();

        let now = Utc::now();
        let ack = gateway
            .ingest_at(request("v1", EventType::Exposure, "k1"), now)
            .await
            .unwrap();
        assert_eq!(ack, Ack::Accepted);
        let ack = gateway
            .ingest_at(request("v1", EventType::Exposure, "k1"), now)
            .await
            .unwrap();
        assert_eq!(ack, Ack::Duplicate);

        let events = log.events_for("exp-1");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp(), now);
        assert!(["a", "b"].contains(&events[0].variant_id()));
    }
}
