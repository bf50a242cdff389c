//! Bayesian comparison: Beta-Binomial conjugate model.
//!
//! Each arm's conversion rate gets a `Beta(α0 + successes, β0 + failures)`
//! posterior. `P(variant > control)` is `∫ f_v(x)·F_c(x) dx`, evaluated with
//! composite Simpson's rule over the region where the variant posterior has
//! mass.

use serde::{Deserialize, Serialize};

use super::frequentist::{MeanSample, ProportionSample};
use super::special::{beta_inc, log_beta, normal_cdf, normal_quantile};
use crate::{Error, Result};

const SIMPSON_INTERVALS: usize = 2_000;
const SUPPORT_SDS: f64 = 12.0;
/// Above this, Beta posteriors are indistinguishable from their normal approximation.
const NORMAL_APPROX_THRESHOLD: f64 = 1.0e7;

/// Beta prior hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaPrior {
    /// Prior pseudo-successes
    pub alpha: f64,
    /// Prior pseudo-failures
    pub beta: f64,
}

impl Default for BetaPrior {
    /// Flat `Beta(1, 1)`.
    fn default() -> Self {
        Self { alpha: 1.0, beta: 1.0 }
    }
}

impl BetaPrior {
    fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.beta > 0.0 && self.alpha.is_finite() && self.beta.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "Beta prior parameters must be positive, got ({}, {})",
                self.alpha, self.beta
            )));
        }
        Ok(())
    }
}

/// Posterior `Beta(alpha, beta)` for one arm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaPosterior {
    /// Shape α
    pub alpha: f64,
    /// Shape β
    pub beta: f64,
}

impl BetaPosterior {
    /// Conjugate update of `prior` with observed counts.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn update(prior: BetaPrior, sample: ProportionSample) -> Self {
        let failures = sample.trials.saturating_sub(sample.successes);
        Self {
            alpha: prior.alpha + sample.successes as f64,
            beta: prior.beta + failures as f64,
        }
    }

    /// Posterior mean.
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Posterior variance.
    #[must_use]
    pub fn variance(&self) -> f64 {
        let sum = self.alpha + self.beta;
        self.alpha * self.beta / (sum * sum * (sum + 1.0))
    }

    /// Density at `x`.
    #[must_use]
    pub fn pdf(&self, x: f64) -> f64 {
        if !(0.0..=1.0).contains(&x) {
            return 0.0;
        }
        // Keep the log terms finite at the support edges.
        let x = x.clamp(f64::EPSILON, 1.0 - f64::EPSILON);
        ((self.alpha - 1.0) * x.ln() + (self.beta - 1.0) * (-x).ln_1p() - log_beta(self.alpha, self.beta))
            .exp()
    }

    /// CDF at `x`.
    #[must_use]
    pub fn cdf(&self, x: f64) -> f64 {
        beta_inc(x, self.alpha, self.beta)
    }

    /// Equal-tailed credible interval for the rate itself.
    #[must_use]
    pub fn credible_interval(&self, level: f64) -> (f64, f64) {
        let tail = 0.5 * (1.0 - level);
        (self.quantile(tail), self.quantile(1.0 - tail))
    }

    /// Quantile by bisection on the CDF.
    #[must_use]
    pub fn quantile(&self, p: f64) -> f64 {
        if p <= 0.0 {
            return 0.0;
        }
        if p >= 1.0 {
            return 1.0;
        }
        let (mut low, mut high) = (0.0, 1.0);
        for _ in 0..100 {
            let mid = 0.5 * (low + high);
            if self.cdf(mid) < p {
                low = mid;
            } else {
                high = mid;
            }
        }
        0.5 * (low + high)
    }
}

/// Posterior summary of one variant against control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BayesianOutcome {
    /// `P(variant > control | data)`
    pub probability_variant_better: f64,
    /// Lower bound of the credible interval on `variant − control`
    pub credible_lower: f64,
    /// Upper bound of the credible interval on `variant − control`
    pub credible_upper: f64,
    /// Posterior mean of `variant − control`
    pub expected_difference: f64,
}

/// `P(B > A)` for independent Beta posteriors.
///
/// # Errors
///
/// `Computation` if the integral is not a probability (degenerate parameters).
#[allow(clippy::cast_precision_loss)]
pub fn probability_beats(control: BetaPosterior, variant: BetaPosterior) -> Result<f64> {
    let huge = [control.alpha, control.beta, variant.alpha, variant.beta]
        .iter()
        .any(|&p| p > NORMAL_APPROX_THRESHOLD);
    if huge {
        let diff = variant.mean() - control.mean();
        let sd = (variant.variance() + control.variance()).sqrt();
        return Ok(normal_cdf(diff / sd));
    }

    let sd = variant.variance().sqrt();
    let lo = (variant.mean() - SUPPORT_SDS * sd).max(0.0);
    let hi = (variant.mean() + SUPPORT_SDS * sd).min(1.0);
    let h = (hi - lo) / SIMPSON_INTERVALS as f64;

    let integrand = |x: f64| variant.pdf(x) * control.cdf(x);
    let mut acc = integrand(lo) + integrand(hi);
    for i in 1..SIMPSON_INTERVALS {
        let x = (i as f64).mul_add(h, lo);
        acc += if i % 2 == 1 { 4.0 } else { 2.0 } * integrand(x);
    }
    let probability = acc * h / 3.0;

    if !probability.is_finite() || !(-1e-6..=1.0 + 1e-6).contains(&probability) {
        return Err(Error::Computation(format!(
            "posterior comparison integral evaluated to {probability}"
        )));
    }
    Ok(probability.clamp(0.0, 1.0))
}

/// Beta-Binomial comparison of conversion rates.
///
/// The credible interval on the difference uses a normal approximation of
/// the posterior difference (mean and variance are exact).
///
/// # Errors
///
/// `InvalidInput` for a bad prior or level, `Computation` if integration fails.
pub fn compare_proportions(
    prior: BetaPrior,
    control: ProportionSample,
    variant: ProportionSample,
    level: f64,
) -> Result<BayesianOutcome> {
    prior.validate()?;
    if !(level > 0.0 && level < 1.0) {
        return Err(Error::InvalidInput(format!("credible level must be in (0, 1), got {level}")));
    }
    let post_c = BetaPosterior::update(prior, control);
    let post_v = BetaPosterior::update(prior, variant);

    let probability_variant_better = probability_beats(post_c, post_v)?;
    let expected_difference = post_v.mean() - post_c.mean();
    let sd = (post_v.variance() + post_c.variance()).sqrt();
    let z = normal_quantile(0.5 + 0.5 * level);

    Ok(BayesianOutcome {
        probability_variant_better,
        credible_lower: expected_difference - z * sd,
        credible_upper: expected_difference + z * sd,
        expected_difference,
    })
}

/// Normal-approximation posterior comparison of means under a flat prior.
///
/// # Errors
///
/// `InvalidInput` for a bad level, `Computation` on an empty posterior spread.
#[allow(clippy::cast_precision_loss)]
pub fn compare_means(control: MeanSample, variant: MeanSample, level: f64) -> Result<BayesianOutcome> {
    if !(level > 0.0 && level < 1.0) {
        return Err(Error::InvalidInput(format!("credible level must be in (0, 1), got {level}")));
    }
    let expected_difference = variant.mean - control.mean;
    let sd = (control.variance / control.n as f64 + variant.variance / variant.n as f64).sqrt();
    if !(sd > 0.0 && sd.is_finite()) {
        return Err(Error::Computation("posterior spread is zero".to_string()));
    }
    let z = normal_quantile(0.5 + 0.5 * level);
    Ok(BayesianOutcome {
        probability_variant_better: normal_cdf(expected_difference / sd),
        credible_lower: expected_difference - z * sd,
        credible_upper: expected_difference + z * sd,
        expected_difference,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_posteriors_are_a_coin_flip() {
        let post = BetaPosterior { alpha: 31.0, beta: 971.0 };
        let p = probability_beats(post, post).unwrap();
        assert!((p - 0.5).abs() < 1e-6, "p = {p}");
    }

    #[test]
    fn test_closed_form_uniform_case() {
        // Beta(1,1) vs Beta(2,1): P(B > A) = ∫ 2x · x dx = 2/3
        let a = BetaPosterior { alpha: 1.0, beta: 1.0 };
        let b = BetaPosterior { alpha: 2.0, beta: 1.0 };
        let p = probability_beats(a, b).unwrap();
        assert!((p - 2.0 / 3.0).abs() < 1e-6, "p = {p}");
    }

    #[test]
    fn test_clear_winner_has_high_probability() {
        let outcome = compare_proportions(
            BetaPrior::default(),
            ProportionSample::new(100, 2000),
            ProportionSample::new(140, 2000),
            0.95,
        )
        .unwrap();
        assert!(outcome.probability_variant_better > 0.99);
        assert!(outcome.credible_lower > 0.0);
        assert!(outcome.expected_difference > 0.0);
    }

    #[test]
    fn test_zero_conversions_stay_defined() {
        let outcome = compare_proportions(
            BetaPrior::default(),
            ProportionSample::new(0, 20),
            ProportionSample::new(0, 20),
            0.95,
        )
        .unwrap();
        assert!((outcome.probability_variant_better - 0.5).abs() < 1e-4);
        assert!(outcome.credible_lower < 0.0 && outcome.credible_upper > 0.0);
    }

    #[test]
    fn test_posterior_moments_and_interval() {
        let post = BetaPosterior::update(BetaPrior::default(), ProportionSample::new(3, 10));
        assert!((post.mean() - 4.0 / 12.0).abs() < 1e-12);
        let (lo, hi) = post.credible_interval(0.9);
        assert!(lo < post.mean() && post.mean() < hi);
        assert!((post.cdf(lo) - 0.05).abs() < 1e-8);
    }

    #[test]
    fn test_rejects_invalid_prior() {
        let bad = BetaPrior { alpha: 0.0, beta: 1.0 };
        assert!(compare_proportions(bad, ProportionSample::new(1, 2), ProportionSample::new(1, 2), 0.95).is_err());
    }

    #[test]
    fn test_means_comparison() {
        let control = MeanSample { n: 100, mean: 10.0, variance: 4.0 };
        let variant = MeanSample { n: 100, mean: 10.0, variance: 4.0 };
        let outcome = compare_means(control, variant, 0.95).unwrap();
        assert!((outcome.probability_variant_better - 0.5).abs() < 1e-12);
    }
}
