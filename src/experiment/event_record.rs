//! Event Record - append-only behavioral events

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of behavioral event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Visitor saw their variant.
    Exposure,
    /// Visitor completed the goal.
    Conversion,
    /// Numeric observation added to the visitor's running total.
    Metric,
}

impl EventType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exposure => "exposure",
            Self::Conversion => "conversion",
            Self::Metric => "metric",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exposure" => Some(Self::Exposure),
            "conversion" => Some(Self::Conversion),
            "metric" => Some(Self::Metric),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event Record represents a single validated behavioral event.
///
/// Events are the durable source of truth: every running statistic can be
/// rebuilt from them.
///
/// ## Partitioning
///
/// - `experiment_id` + `epoch` select the statistics an event contributes to
/// - `dedupe_key` makes client retries idempotent
/// - `timestamp` is assigned by the gateway, never by the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    experiment_id: String,
    visitor_id: String,
    variant_id: String,
    epoch: u32,
    event_type: EventType,
    value: Option<f64>,
    dedupe_key: String,
    timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Create a builder; the timestamp defaults to now.
    #[must_use]
    pub fn builder(
        experiment_id: impl Into<String>,
        visitor_id: impl Into<String>,
        variant_id: impl Into<String>,
        event_type: EventType,
    ) -> EventRecordBuilder {
        EventRecordBuilder::new(experiment_id, visitor_id, variant_id, event_type)
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Get the visitor ID.
    #[must_use]
    pub fn visitor_id(&self) -> &str {
        &self.visitor_id
    }

    /// Get the variant the visitor was assigned.
    #[must_use]
    pub fn variant_id(&self) -> &str {
        &self.variant_id
    }

    /// Get the experiment epoch the event belongs to.
    #[must_use]
    pub const fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Get the event type.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Get the numeric value, if any.
    #[must_use]
    pub const fn value(&self) -> Option<f64> {
        self.value
    }

    /// Get the deduplication key.
    #[must_use]
    pub fn dedupe_key(&self) -> &str {
        &self.dedupe_key
    }

    /// Get the gateway timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Builder for `EventRecord`.
#[derive(Debug)]
pub struct EventRecordBuilder {
    record: EventRecord,
}

impl EventRecordBuilder {
    /// Create a new builder with required fields.
    ///
    /// The dedupe key defaults to a key unique to this visitor and type, so
    /// a builder without an explicit key records at most one such event.
    #[must_use]
    pub fn new(
        experiment_id: impl Into<String>,
        visitor_id: impl Into<String>,
        variant_id: impl Into<String>,
        event_type: EventType,
    ) -> Self {
        let visitor_id = visitor_id.into();
        let dedupe_key = format!("{visitor_id}:{event_type}");
        Self {
            record: EventRecord {
                experiment_id: experiment_id.into(),
                visitor_id,
                variant_id: variant_id.into(),
                epoch: 0,
                event_type,
                value: None,
                dedupe_key,
                timestamp: Utc::now(),
            },
        }
    }

    /// Set the epoch.
    #[must_use]
    pub const fn epoch(mut self, epoch: u32) -> Self {
        self.record.epoch = epoch;
        self
    }

    /// Set the numeric value.
    #[must_use]
    pub const fn value(mut self, value: f64) -> Self {
        self.record.value = Some(value);
        self
    }

    /// Set an optional numeric value.
    #[must_use]
    pub const fn maybe_value(mut self, value: Option<f64>) -> Self {
        self.record.value = value;
        self
    }

    /// Set the deduplication key.
    #[must_use]
    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.record.dedupe_key = key.into();
        self
    }

    /// Set a custom timestamp.
    #[must_use]
    pub const fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.record.timestamp = timestamp;
        self
    }

    /// Build the `EventRecord`.
    #[must_use]
    pub fn build(self) -> EventRecord {
        self.record
    }
}
