//! Experiment Registry Schema
//!
//! Data structures for controlled experiments and the registry that owns
//! their lifecycle.
//!
//! ## Schema Overview
//!
//! ```text
//! ExperimentRecord (1) ──< VariantRecord (N, exactly one control)
//!        │
//!        ├──< AssignmentRecord (N) [immutable, per epoch]
//!        └──< EventRecord (N)      [append-only]
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! draft ──> active <──> paused
//!             │           │
//!             └─────┬─────┘
//!                   v
//!          concluded | rolled_back   (terminal; archival only)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use trueno_ab::experiment::{ExperimentRecord, ExperimentRegistry, ExperimentStatus, VariantRecord};
//!
//! let registry = ExperimentRegistry::new();
//! let experiment = ExperimentRecord::builder("exp-001", "Headline test")
//!     .variant(VariantRecord::control("a", "Original", 0.5))
//!     .variant(VariantRecord::new("b", "Benefit-led", 0.5))
//!     .build();
//! registry.create(experiment)?;
//!
//! let active = registry.transition("exp-001", ExperimentStatus::Active, Some(0))?;
//! assert_eq!(active.version(), 1);
//! # Ok::<(), trueno_ab::Error>(())
//! ```

mod assignment_record;
mod event_record;
mod experiment_record;
mod registry;
mod variant_record;

pub use assignment_record::AssignmentRecord;
pub use event_record::{EventRecord, EventRecordBuilder, EventType};
pub use experiment_record::{
    AnalysisMethod, ExperimentRecord, ExperimentRecordBuilder, ExperimentStatus, MetricKind,
    MAX_EXPERIMENT_ID_LEN, WEIGHT_TOLERANCE,
};
pub use registry::ExperimentRegistry;
pub use variant_record::VariantRecord;
