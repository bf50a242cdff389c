//! Fixed-horizon frequentist tests and sample-size planning.
//!
//! - Two-proportion z-test for binary conversion metrics
//! - Welch's unequal-variance t-test for continuous metrics
//! - Normal-approximation sample size for proportions and means

use serde::{Deserialize, Serialize};

use super::special::{normal_quantile, normal_sf, student_t_critical, student_t_two_sided};
use crate::{Error, Result};

/// Binary outcome counts for one arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProportionSample {
    /// Converting participants
    pub successes: u64,
    /// Participants
    pub trials: u64,
}

impl ProportionSample {
    /// Create a new sample.
    #[must_use]
    pub const fn new(successes: u64, trials: u64) -> Self {
        Self { successes, trials }
    }

    /// Observed rate, `0.0` for an empty arm.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rate(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.successes as f64 / self.trials as f64
        }
    }

    fn validate(&self, label: &str) -> Result<()> {
        if self.successes > self.trials {
            return Err(Error::InvalidInput(format!(
                "{label}: successes ({}) exceed trials ({})",
                self.successes, self.trials
            )));
        }
        if self.trials == 0 {
            return Err(Error::Computation(format!("{label}: no participants")));
        }
        Ok(())
    }

    const fn is_degenerate(&self) -> bool {
        self.successes == 0 || self.successes == self.trials
    }
}

/// Continuous outcome moments for one arm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanSample {
    /// Participants
    pub n: u64,
    /// Sample mean
    pub mean: f64,
    /// Unbiased sample variance (n - 1 denominator)
    pub variance: f64,
}

impl MeanSample {
    /// Build moments from running sums.
    ///
    /// Returns `None` with fewer than two observations.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_sums(n: u64, sum: f64, sum_sq: f64) -> Option<Self> {
        if n < 2 {
            return None;
        }
        let nf = n as f64;
        let mean = sum / nf;
        // Clamp tiny negative values from cancellation
        let variance = ((sum_sq - nf * mean * mean) / (nf - 1.0)).max(0.0);
        Some(Self { n, mean, variance })
    }
}

/// Result of comparing one variant against control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Control rate or mean
    pub control_value: f64,
    /// Variant rate or mean
    pub variant_value: f64,
    /// `variant_value - control_value`
    pub difference: f64,
    /// `(variant - control) / control`, absent when control is zero
    pub relative_lift: Option<f64>,
    /// z (binary) or t (continuous) statistic
    pub statistic: f64,
    /// Two-sided p-value
    pub p_value: f64,
    /// Lower bound of the two-sided interval on `difference`
    pub ci_lower: f64,
    /// Upper bound of the two-sided interval on `difference`
    pub ci_upper: f64,
    /// Cohen's h (binary) or Cohen's d (continuous)
    pub effect_size: f64,
    /// Welch-Satterthwaite degrees of freedom (continuous only)
    pub degrees_of_freedom: Option<f64>,
}

fn check_level(confidence: f64) -> Result<f64> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(Error::InvalidInput(format!(
            "confidence level must be in (0, 1), got {confidence}"
        )));
    }
    Ok(1.0 - confidence)
}

fn relative_lift(control: f64, variant: f64) -> Option<f64> {
    (control != 0.0).then(|| (variant - control) / control)
}

/// Two-proportion z-test of `variant` against `control`.
///
/// The statistic uses the pooled standard error (null hypothesis of equal
/// rates). The interval uses the unpooled Wald error, or the Agresti-Caffo
/// adjustment when either arm sits at 0% or 100% so that an arm with zero
/// conversions still yields a defined (wide) interval.
///
/// # Errors
///
/// - `InvalidInput` if counts are inconsistent or the level is out of range
/// - `Computation` if either arm has no participants
///
/// # Example
///
/// ```
/// use trueno_ab::stats::{two_proportion_z_test, ProportionSample};
///
/// let control = ProportionSample::new(100, 2000);
/// let variant = ProportionSample::new(140, 2000);
/// let outcome = two_proportion_z_test(control, variant, 0.95).unwrap();
/// assert!(outcome.p_value < 0.05);
/// ```
#[allow(clippy::cast_precision_loss)]
pub fn two_proportion_z_test(
    control: ProportionSample,
    variant: ProportionSample,
    confidence: f64,
) -> Result<TestOutcome> {
    let alpha = check_level(confidence)?;
    control.validate("control")?;
    variant.validate("variant")?;

    let (n0, n1) = (control.trials as f64, variant.trials as f64);
    let (p0, p1) = (control.rate(), variant.rate());
    let difference = p1 - p0;

    let pooled = (control.successes + variant.successes) as f64 / (n0 + n1);
    let se_pooled = (pooled * (1.0 - pooled) * (1.0 / n0 + 1.0 / n1)).sqrt();
    let (statistic, p_value) = if se_pooled > 0.0 {
        let z = difference / se_pooled;
        (z, (2.0 * normal_sf(z.abs())).min(1.0))
    } else {
        // Both arms identical at 0% or 100%: no evidence either way
        (0.0, 1.0)
    };

    let z_crit = normal_quantile(1.0 - alpha / 2.0);
    let (center, se_ci) = if control.is_degenerate() || variant.is_degenerate() {
        let a0 = (control.successes as f64 + 1.0) / (n0 + 2.0);
        let a1 = (variant.successes as f64 + 1.0) / (n1 + 2.0);
        let se = (a0 * (1.0 - a0) / (n0 + 2.0) + a1 * (1.0 - a1) / (n1 + 2.0)).sqrt();
        (a1 - a0, se)
    } else {
        let se = (p0 * (1.0 - p0) / n0 + p1 * (1.0 - p1) / n1).sqrt();
        (difference, se)
    };

    let effect_size = 2.0 * p1.sqrt().asin() - 2.0 * p0.sqrt().asin();

    Ok(TestOutcome {
        control_value: p0,
        variant_value: p1,
        difference,
        relative_lift: relative_lift(p0, p1),
        statistic,
        p_value,
        ci_lower: center - z_crit * se_ci,
        ci_upper: center + z_crit * se_ci,
        effect_size,
        degrees_of_freedom: None,
    })
}

/// Welch's t-test of `variant` against `control`.
///
/// # Errors
///
/// - `InvalidInput` if the level is out of range
/// - `Computation` if an arm has fewer than two observations, or both arms
///   have zero variance with different means
#[allow(clippy::cast_precision_loss)]
pub fn welch_t_test(control: MeanSample, variant: MeanSample, confidence: f64) -> Result<TestOutcome> {
    let alpha = check_level(confidence)?;
    if control.n < 2 || variant.n < 2 {
        return Err(Error::Computation(format!(
            "Welch test needs at least 2 observations per arm (control={}, variant={})",
            control.n, variant.n
        )));
    }
    if !control.mean.is_finite() || !variant.mean.is_finite() {
        return Err(Error::Computation("non-finite sample mean".to_string()));
    }

    let (n0, n1) = (control.n as f64, variant.n as f64);
    let q0 = control.variance / n0;
    let q1 = variant.variance / n1;
    let se = (q0 + q1).sqrt();
    let difference = variant.mean - control.mean;
    let pooled_sd = (0.5 * (control.variance + variant.variance)).sqrt();
    let effect_size = if pooled_sd > 0.0 { difference / pooled_sd } else { 0.0 };

    if se == 0.0 {
        if difference != 0.0 {
            return Err(Error::Computation(
                "zero variance in both arms with different means".to_string(),
            ));
        }
        return Ok(TestOutcome {
            control_value: control.mean,
            variant_value: variant.mean,
            difference,
            relative_lift: relative_lift(control.mean, variant.mean),
            statistic: 0.0,
            p_value: 1.0,
            ci_lower: 0.0,
            ci_upper: 0.0,
            effect_size,
            degrees_of_freedom: Some(n0 + n1 - 2.0),
        });
    }

    let df = (q0 + q1).powi(2) / (q0 * q0 / (n0 - 1.0) + q1 * q1 / (n1 - 1.0));
    let t = difference / se;
    let p_value = student_t_two_sided(t, df);
    let t_crit = student_t_critical(alpha, df);
    if p_value.is_nan() || t_crit.is_nan() {
        return Err(Error::Computation(format!(
            "Student-t evaluation failed (t={t}, df={df})"
        )));
    }

    Ok(TestOutcome {
        control_value: control.mean,
        variant_value: variant.mean,
        difference,
        relative_lift: relative_lift(control.mean, variant.mean),
        statistic: t,
        p_value,
        ci_lower: difference - t_crit * se,
        ci_upper: difference + t_crit * se,
        effect_size,
        degrees_of_freedom: Some(df),
    })
}

fn check_planning(alpha: f64, power: f64) -> Result<(f64, f64)> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(Error::InvalidInput(format!("alpha must be in (0, 1), got {alpha}")));
    }
    if !(power > 0.0 && power < 1.0) {
        return Err(Error::InvalidInput(format!("power must be in (0, 1), got {power}")));
    }
    Ok((normal_quantile(1.0 - alpha / 2.0), normal_quantile(power)))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn ceil_count(n: f64) -> Result<u64> {
    if !n.is_finite() || n <= 0.0 {
        return Err(Error::Computation(format!("sample size evaluated to {n}")));
    }
    Ok(n.ceil() as u64)
}

/// Required participants per arm to detect a relative lift of `mde` over
/// `baseline` with a two-sided test at `alpha` and the given `power`.
///
/// `n = (z_{α/2}·√(2·p̄·q̄) + z_β·√(p1·q1 + p2·q2))² / (p2 − p1)²`
///
/// # Errors
///
/// `InvalidInput` if the baseline or the implied treatment rate leave (0, 1),
/// the effect is zero, or alpha/power are out of range.
pub fn required_sample_size(baseline: f64, mde: f64, alpha: f64, power: f64) -> Result<u64> {
    let (z_alpha, z_beta) = check_planning(alpha, power)?;
    if !(baseline > 0.0 && baseline < 1.0) {
        return Err(Error::InvalidInput(format!(
            "baseline rate must be in (0, 1), got {baseline}"
        )));
    }
    let p1 = baseline;
    let p2 = baseline * (1.0 + mde);
    if mde == 0.0 || !mde.is_finite() || !(p2 > 0.0 && p2 < 1.0) {
        return Err(Error::InvalidInput(format!(
            "minimum detectable effect {mde} implies treatment rate {p2} outside (0, 1)"
        )));
    }
    let p_bar = 0.5 * (p1 + p2);
    let numerator = z_alpha * (2.0 * p_bar * (1.0 - p_bar)).sqrt()
        + z_beta * (p1 * (1.0 - p1) + p2 * (1.0 - p2)).sqrt();
    ceil_count(numerator.powi(2) / (p2 - p1).powi(2))
}

/// Required participants per arm to detect an absolute mean difference
/// `delta` when the outcome has standard deviation `std_dev`.
///
/// `n = 2·(z_{α/2} + z_β)²·σ² / δ²`
///
/// # Errors
///
/// `InvalidInput` on non-positive `std_dev`, zero `delta`, or out-of-range
/// alpha/power.
pub fn required_sample_size_means(std_dev: f64, delta: f64, alpha: f64, power: f64) -> Result<u64> {
    let (z_alpha, z_beta) = check_planning(alpha, power)?;
    if !(std_dev > 0.0 && std_dev.is_finite()) {
        return Err(Error::InvalidInput(format!(
            "standard deviation must be positive, got {std_dev}"
        )));
    }
    if delta == 0.0 || !delta.is_finite() {
        return Err(Error::InvalidInput(format!(
            "effect size must be non-zero, got {delta}"
        )));
    }
    ceil_count(2.0 * (z_alpha + z_beta).powi(2) * std_dev.powi(2) / delta.powi(2))
}
