//! Variant Record - one arm of an experiment

use serde::{Deserialize, Serialize};

/// Variant Record represents one treatment arm.
///
/// Belongs to exactly one experiment. The traffic weight is a fraction of
/// eligible visitors in `[0, 1]`; weights of all variants of an experiment
/// sum to 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantRecord {
    variant_id: String,
    label: String,
    weight: f64,
    control: bool,
}

impl VariantRecord {
    /// Create a treatment variant.
    #[must_use]
    pub fn new(variant_id: impl Into<String>, label: impl Into<String>, weight: f64) -> Self {
        Self {
            variant_id: variant_id.into(),
            label: label.into(),
            weight,
            control: false,
        }
    }

    /// Create the control variant.
    #[must_use]
    pub fn control(variant_id: impl Into<String>, label: impl Into<String>, weight: f64) -> Self {
        Self {
            control: true,
            ..Self::new(variant_id, label, weight)
        }
    }

    /// Get the variant ID.
    #[must_use]
    pub fn variant_id(&self) -> &str {
        &self.variant_id
    }

    /// Get the human-readable label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Get the traffic weight.
    #[must_use]
    pub const fn weight(&self) -> f64 {
        self.weight
    }

    /// Whether this is the control arm.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        self.control
    }
}
