//! Group-sequential boundaries via alpha spending.
//!
//! Repeatedly peeking at a fixed-horizon test inflates the false-positive
//! rate. Instead, every interim look `k` at information fraction `t_k` is
//! compared against a boundary `c_k` chosen so that the probability, under
//! the null, of crossing for the first time at look `k` equals the alpha
//! "spent" between `t_{k-1}` and `t_k`:
//!
//! ```text
//! P(|Z_1| < c_1, ..., |Z_{k-1}| < c_{k-1}, |Z_k| >= c_k) = α(t_k) − α(t_{k-1})
//! ```
//!
//! Summed over looks, the crossing probability is `α(t_K) <= α`.
//!
//! The joint law of `(Z_1, ..., Z_K)` is that of a Brownian motion `S(t)`
//! observed at `t_k` (`Z_k = S(t_k) / √t_k`), so the sub-density of `S` on
//! the continuation region is carried forward on a grid (Armitage,
//! McPherson & Rowe 1969). The propagation step integrates the piecewise
//! linear interpolant of the sub-density against the Gaussian kernel in
//! closed form, which stays exact however close two looks are.
//!
//! References:
//! - Lan & DeMets (1983): Discrete sequential boundaries for clinical trials
//! - Jennison & Turnbull (2000): Group Sequential Methods, ch. 7 and 19

use serde::{Deserialize, Serialize};

use super::special::{normal_cdf, normal_pdf, normal_quantile};
use crate::{Error, Result};

/// Boundaries are capped here; beyond it the remaining null mass is below 1e-15.
pub const Z_CAP: f64 = 8.0;

/// Alpha increments below this are treated as "nothing to spend" (no stopping).
const MIN_SPEND: f64 = 1e-14;

const DEFAULT_GRID_POINTS: usize = 257;
const BISECTION_ITERS: usize = 80;

/// Alpha-spending function family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendingFunction {
    /// Lan-DeMets O'Brien-Fleming type: `α(t) = 2 − 2Φ(z_{α/2} / √t)`.
    ///
    /// Spends almost nothing early and nearly the full alpha at `t = 1`.
    #[default]
    OBrienFleming,
    /// Lan-DeMets Pocock type: `α(t) = α · ln(1 + (e − 1)·t)`.
    Pocock,
}

impl SpendingFunction {
    /// Cumulative two-sided alpha spent by information fraction `t`.
    #[must_use]
    pub fn spent(self, alpha: f64, t: f64) -> f64 {
        if t <= 0.0 {
            return 0.0;
        }
        let t = t.min(1.0);
        match self {
            Self::OBrienFleming => {
                let z = normal_quantile(1.0 - alpha / 2.0);
                (2.0 - 2.0 * normal_cdf(z / t.sqrt())).min(alpha)
            }
            Self::Pocock => alpha * (std::f64::consts::E - 1.0).mul_add(t, 1.0).ln(),
        }
    }
}

/// Two-sided group-sequential design at a given overall alpha.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequentialDesign {
    alpha: f64,
    spending: SpendingFunction,
    grid_points: usize,
}

impl SequentialDesign {
    /// Create a design spending `alpha` (two-sided) with `spending`.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if alpha is outside (0, 1).
    pub fn new(alpha: f64, spending: SpendingFunction) -> Result<Self> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(Error::InvalidInput(format!("alpha must be in (0, 1), got {alpha}")));
        }
        Ok(Self {
            alpha,
            spending,
            grid_points: DEFAULT_GRID_POINTS,
        })
    }

    /// Override the integration grid size (odd values above 32).
    #[must_use]
    pub fn with_grid_points(mut self, points: usize) -> Self {
        self.grid_points = points.max(33) | 1;
        self
    }

    /// Overall two-sided alpha.
    #[must_use]
    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Spending function.
    #[must_use]
    pub const fn spending(&self) -> SpendingFunction {
        self.spending
    }

    /// Critical |z| values for looks at the given information fractions.
    ///
    /// Fractions must be strictly increasing and lie in (0, 1]. A boundary of
    /// `f64::INFINITY` means no alpha is available at that look.
    ///
    /// # Errors
    ///
    /// `InvalidInput` on an empty, non-increasing or out-of-range sequence.
    pub fn boundaries(&self, fractions: &[f64]) -> Result<Vec<f64>> {
        validate_fractions(fractions)?;
        let mut path = self.path();
        for &t in fractions {
            path.push(t)?;
        }
        Ok(path.bounds)
    }

    /// Empty incremental boundary path for this design.
    #[must_use]
    pub const fn path(&self) -> BoundaryPath {
        BoundaryPath {
            design: *self,
            grid: None,
            prev_t: 0.0,
            prev_spent: 0.0,
            bounds: Vec::new(),
        }
    }

    /// Boundary for the last of `fractions`.
    ///
    /// # Errors
    ///
    /// Same as [`boundaries`](Self::boundaries).
    pub fn current_boundary(&self, fractions: &[f64]) -> Result<f64> {
        self.boundaries(fractions)?
            .last()
            .copied()
            .ok_or_else(|| Error::InvalidInput("no looks supplied".to_string()))
    }
}

/// Boundaries computed one look at a time.
///
/// Holds the propagated sub-density after the last look, so adding a look
/// costs one recursion step instead of replaying every earlier look.
#[derive(Debug, Clone)]
pub struct BoundaryPath {
    design: SequentialDesign,
    grid: Option<Grid>,
    prev_t: f64,
    prev_spent: f64,
    bounds: Vec<f64>,
}

impl BoundaryPath {
    /// Add a look at fraction `t` and return its boundary.
    ///
    /// # Errors
    ///
    /// `InvalidInput` unless `t` lies in (0, 1] and beyond the previous look.
    pub fn push(&mut self, t: f64) -> Result<f64> {
        if !(t > self.prev_t && t <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "information fractions must be strictly increasing in (0, 1], got {t} after {}",
                self.prev_t
            )));
        }
        let c = self.boundary_at(t);
        let half_width = c.min(Z_CAP) * t.sqrt();
        let points = self.design.grid_points;
        self.grid = Some(match self.grid.take() {
            None => Grid::initial(t, half_width, points),
            Some(g) => g.propagate((t - self.prev_t).sqrt(), half_width, points),
        });

        self.bounds.push(c);
        self.prev_t = t;
        self.prev_spent = self.prev_spent.max(self.design.spending.spent(self.design.alpha, t));
        Ok(c)
    }

    /// Boundary a look at `t = 1` would get, without recording it.
    #[must_use]
    pub fn projected_final(&self) -> f64 {
        if self.prev_t >= 1.0 {
            return self.bounds.last().copied().unwrap_or(f64::INFINITY);
        }
        self.boundary_at(1.0)
    }

    /// Design the path spends.
    #[must_use]
    pub const fn design(&self) -> &SequentialDesign {
        &self.design
    }

    /// Boundaries recorded so far, one per look.
    #[must_use]
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Fraction of the last recorded look (0 before any).
    #[must_use]
    pub const fn last_fraction(&self) -> f64 {
        self.prev_t
    }

    fn boundary_at(&self, t: f64) -> f64 {
        let spent = self.design.spending.spent(self.design.alpha, t);
        let increment = (spent - self.prev_spent).max(0.0);
        match &self.grid {
            None => {
                // Z_1 is exactly standard normal
                if increment < MIN_SPEND {
                    f64::INFINITY
                } else {
                    normal_quantile(1.0 - increment / 2.0).min(Z_CAP)
                }
            }
            Some(g) => solve_boundary(g, t, (t - self.prev_t).sqrt(), increment),
        }
    }
}

fn validate_fractions(fractions: &[f64]) -> Result<()> {
    if fractions.is_empty() {
        return Err(Error::InvalidInput("at least one look is required".to_string()));
    }
    let mut prev = 0.0;
    for &t in fractions {
        if !(t > prev && t <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "information fractions must be strictly increasing in (0, 1], got {fractions:?}"
            )));
        }
        prev = t;
    }
    Ok(())
}

/// Sub-density of `S(t)` on the continuation region, sampled on a uniform grid.
#[derive(Debug, Clone)]
struct Grid {
    points: Vec<f64>,
    density: Vec<f64>,
    step: f64,
}

impl Grid {
    #[allow(clippy::cast_precision_loss)]
    fn nodes(half_width: f64, n: usize) -> (Vec<f64>, f64) {
        let step = 2.0 * half_width / (n - 1) as f64;
        let points = (0..n).map(|i| (i as f64).mul_add(step, -half_width)).collect();
        (points, step)
    }

    fn initial(t: f64, half_width: f64, n: usize) -> Self {
        let (points, step) = Self::nodes(half_width, n);
        let sd = t.sqrt();
        let density = points.iter().map(|&s| normal_pdf(s / sd) / sd).collect();
        Self { points, density, step }
    }

    fn trapezoid_weight(&self, i: usize) -> f64 {
        if i == 0 || i + 1 == self.points.len() {
            0.5 * self.step
        } else {
            self.step
        }
    }

    /// `P(|S(t)| >= c·√t, continued so far)` for a step of standard deviation `sigma`.
    fn crossing(&self, t: f64, sigma: f64, c: f64) -> f64 {
        let b = c * t.sqrt();
        self.points
            .iter()
            .zip(&self.density)
            .enumerate()
            .map(|(i, (&s, &g))| {
                let tails = normal_cdf((-b - s) / sigma) + normal_cdf((s - b) / sigma);
                self.trapezoid_weight(i) * g * tails
            })
            .sum()
    }

    /// Carry the density forward by a Gaussian step and truncate to `[-half_width, half_width]`.
    fn propagate(&self, sigma: f64, half_width: f64, n: usize) -> Self {
        let (points, step) = Self::nodes(half_width, n);
        let mut cdf = vec![0.0; self.points.len()];
        let mut pdf = vec![0.0; self.points.len()];

        let density = points
            .iter()
            .map(|&x| {
                for (j, &s) in self.points.iter().enumerate() {
                    let u = (s - x) / sigma;
                    cdf[j] = normal_cdf(u);
                    pdf[j] = normal_pdf(u);
                }
                // Exact integral of the piecewise-linear interpolant against the kernel
                let mut acc = 0.0;
                for j in 0..self.points.len() - 1 {
                    let slope = (self.density[j + 1] - self.density[j]) / self.step;
                    let level = slope.mul_add(x - self.points[j], self.density[j]);
                    acc += level * (cdf[j + 1] - cdf[j]) + slope * sigma * (pdf[j] - pdf[j + 1]);
                }
                acc.max(0.0)
            })
            .collect();

        Self { points, density, step }
    }
}

fn solve_boundary(grid: &Grid, t: f64, sigma: f64, target: f64) -> f64 {
    if target < MIN_SPEND {
        return f64::INFINITY;
    }
    if grid.crossing(t, sigma, Z_CAP) >= target {
        return Z_CAP;
    }
    let (mut low, mut high) = (0.0, Z_CAP);
    for _ in 0..BISECTION_ITERS {
        let mid = 0.5 * (low + high);
        if grid.crossing(t, sigma, mid) > target {
            low = mid;
        } else {
            high = mid;
        }
    }
    0.5 * (low + high)
}

/// Conditional power of eventually crossing `final_boundary` at `t = 1`.
///
/// Uses the B-value decomposition: given `Z_t` at fraction `t` and a drift
/// `theta` (the expected final z under the alternative),
/// `CP = Φ((Z_t·√t + θ·(1 − t) − c) / √(1 − t))`.
#[must_use]
pub fn conditional_power(z: f64, t: f64, theta: f64, final_boundary: f64) -> f64 {
    if !z.is_finite() {
        return if z > 0.0 { 1.0 } else { 0.0 };
    }
    if t >= 1.0 {
        return if z >= final_boundary { 1.0 } else { 0.0 };
    }
    let t = t.max(0.0);
    let remaining = 1.0 - t;
    normal_cdf((z * t.sqrt() + theta * remaining - final_boundary) / remaining.sqrt())
}

/// Expected final z under the planning alternative: `z_{α/2} + z_β`.
#[must_use]
pub fn planning_drift(alpha: f64, power: f64) -> f64 {
    normal_quantile(1.0 - alpha / 2.0) + normal_quantile(power)
}
