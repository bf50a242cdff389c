//! Statistical primitives for experiment analysis
//!
//! Everything here is a pure function of its inputs: no clocks, no storage,
//! no logging. The analysis layer owns the mapping from experiment state to
//! these calls.
//!
//! - [`special`]: gamma/beta/normal/Student-t functions
//! - [`frequentist`]: two-proportion z-test, Welch's t-test, sample sizing
//! - [`bayesian`]: Beta-Binomial posteriors and `P(variant > control)`
//! - [`sequential`]: alpha-spending group-sequential boundaries
//!
//! References:
//! - Lan & `DeMets` (1983), "Discrete sequential boundaries for clinical trials"
//! - Armitage, `McPherson` & Rowe (1969), "Repeated significance tests on accumulating data"
//! - Agresti & Caffo (2000), "Simple and effective confidence intervals for proportions"

pub mod bayesian;
pub mod frequentist;
pub mod sequential;
pub mod special;

pub use bayesian::{compare_means, compare_proportions, BayesianOutcome, BetaPosterior, BetaPrior};
pub use frequentist::{
    required_sample_size, required_sample_size_means, two_proportion_z_test, welch_t_test,
    MeanSample, ProportionSample, TestOutcome,
};
pub use sequential::{conditional_power, planning_drift, BoundaryPath, SequentialDesign, SpendingFunction, Z_CAP};
pub use special::{normal_cdf, normal_quantile, normal_sf};
