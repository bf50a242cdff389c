//! Request and response payloads for the external endpoints.
//!
//! The engine is transport-agnostic: an HTTP layer deserializes these
//! types, calls the matching [`Engine`](crate::Engine) method and maps
//! errors with [`Error::status_code`]. The outbound webhook is the
//! [`ImplementationSink`] trait.

use serde::{Deserialize, Serialize};

use crate::aggregate::{Ack, RunningStatistics};
use crate::analysis::AnalysisResult;
use crate::decision::Decision;
use crate::experiment::{EventType, ExperimentRecord};
use crate::Error;

pub use crate::decision::{ChannelSink, ImplementationRequest, ImplementationSink, LogSink};

/// Status returned for an accepted or duplicate event.
pub const STATUS_ACCEPTED: u16 = 202;

/// `POST /events` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Target experiment
    pub experiment_id: String,
    /// Visitor the event belongs to
    pub visitor_id: String,
    /// Event kind
    pub event_type: EventType,
    /// Metric value (required for `metric`, forbidden for `exposure`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Client-chosen idempotency key
    pub dedupe_key: String,
}

impl IngestRequest {
    /// Request with a dedupe key derived from visitor and type.
    #[must_use]
    pub fn new(
        experiment_id: impl Into<String>,
        visitor_id: impl Into<String>,
        event_type: EventType,
    ) -> Self {
        let visitor_id = visitor_id.into();
        let dedupe_key = format!("{visitor_id}:{event_type}");
        Self {
            experiment_id: experiment_id.into(),
            visitor_id,
            event_type,
            value: None,
            dedupe_key,
        }
    }

    /// Attach a metric value.
    #[must_use]
    pub const fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    /// Replace the dedupe key.
    #[must_use]
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = key.into();
        self
    }
}

/// `POST /events` response (status 202).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    /// The event was counted
    pub accepted: bool,
    /// The dedupe key was already seen
    pub duplicate: bool,
}

impl IngestResponse {
    /// HTTP-style status of the response.
    #[must_use]
    pub const fn status(&self) -> u16 {
        STATUS_ACCEPTED
    }
}

impl From<Ack> for IngestResponse {
    fn from(ack: Ack) -> Self {
        Self {
            accepted: matches!(ack, Ack::Accepted),
            duplicate: matches!(ack, Ack::Duplicate),
        }
    }
}

/// `POST /assign` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignRequest {
    /// Target experiment
    pub experiment_id: String,
    /// Visitor to place
    pub visitor_id: String,
}

/// `POST /assign` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignResponse {
    /// Variant the visitor sees
    pub variant_id: String,
}

/// `GET /experiments/{id}/results` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsResponse {
    /// Current experiment definition and state
    pub experiment: ExperimentRecord,
    /// Live per-variant statistics, control first
    pub statistics: Vec<RunningStatistics>,
    /// Latest analysis, if one has run
    pub analysis: Option<AnalysisResult>,
    /// Latest decision, if one was taken
    pub decision: Option<Decision>,
}

/// Error body for any endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// HTTP-style status
    pub status: u16,
    /// Human-readable message
    pub error: String,
}

impl From<&Error> for ErrorBody {
    fn from(error: &Error) -> Self {
        Self {
            status: error.status_code(),
            error: error.to_string(),
        }
    }
}
