//! Assignment Record - the sticky visitor-to-variant mapping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Assignment Record binds a visitor to a variant for one experiment epoch.
///
/// Created on the first eligible request and never mutated afterwards. An
/// experiment reset starts a new epoch, which invalidates older records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignmentRecord {
    experiment_id: String,
    visitor_id: String,
    variant_id: String,
    epoch: u32,
    assigned_at: DateTime<Utc>,
}

impl AssignmentRecord {
    /// Create an assignment stamped with the current time.
    #[must_use]
    pub fn new(
        experiment_id: impl Into<String>,
        visitor_id: impl Into<String>,
        variant_id: impl Into<String>,
        epoch: u32,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            visitor_id: visitor_id.into(),
            variant_id: variant_id.into(),
            epoch,
            assigned_at: Utc::now(),
        }
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

    /// Get the assigned variant ID.
    #[must_use]
    pub fn variant_id(&self) -> &str {
        &self.variant_id
    }

    /// Get the epoch the assignment belongs to.
    #[must_use]
    pub const fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Get the assignment timestamp.
    #[must_use]
    pub const fn assigned_at(&self) -> DateTime<Utc> {
        self.assigned_at
    }
}
