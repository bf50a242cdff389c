//! Delivery of "implement the winner" requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::{Error, Result};

/// Request to roll the winning variant out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationRequest {
    /// Concluded experiment
    pub experiment_id: String,
    /// Variant to implement
    pub winning_variant_id: String,
    /// Analysis the decision was based on
    pub analysis_sequence: Option<u64>,
    /// When the decision was taken
    pub decided_at: DateTime<Utc>,
}

/// Receiver of implementation requests (the outbound webhook).
///
/// Called once per experiment, after the conclusion is committed. A failed
/// delivery is logged and does not undo the conclusion.
pub trait ImplementationSink: Send + Sync {
    /// Deliver one request.
    ///
    /// # Errors
    ///
    /// Implementation-defined; the caller only logs it.
    fn deliver(&self, request: ImplementationRequest) -> Result<()>;
}

/// Sink that forwards requests into an unbounded channel.
///
/// The receiving half is typically drained by a task that performs the
/// actual HTTP call.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<ImplementationRequest>,
}

impl ChannelSink {
    /// Create a sink and the receiver it feeds.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ImplementationRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ImplementationSink for ChannelSink {
    fn deliver(&self, request: ImplementationRequest) -> Result<()> {
        self.sender.send(request).map_err(|_| Error::QueueClosed)
    }
}

/// Sink that only logs; the default when nothing is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ImplementationSink for LogSink {
    fn deliver(&self, request: ImplementationRequest) -> Result<()> {
        info!(
            experiment_id = %request.experiment_id,
            winning_variant_id = %request.winning_variant_id,
            "implementation requested"
        );
        Ok(())
    }
}
