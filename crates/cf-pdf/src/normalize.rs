//! Numerical integration for normalization constants and projections.
//!
//! All integrals use a composite Gauss-Legendre rule: the interval is split into
//! `panels` equal sub-intervals with `order` nodes each. Over the Dalitz plot the outer
//! integral runs over `mSq12` and the inner one over the kinematically allowed `mSq13`
//! range at that `mSq12`.

use crate::phase_space::PhaseSpace;
use cf_core::{Error, Result};
use rayon::prelude::*;
use std::ops::{Add, Mul};

/// Composite Gauss-Legendre settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrationConfig {
    /// Number of equal sub-intervals per dimension.
    pub panels: usize,
    /// Gauss-Legendre nodes per sub-interval.
    pub order: usize,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self { panels: 48, order: 8 }
    }
}

/// Gauss-Legendre nodes and weights on `[-1, 1]`.
///
/// Roots of `P_n` are found by Newton iteration from the Chebyshev initial guess.
pub fn gauss_legendre(n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut nodes = vec![0.0; n];
    let mut weights = vec![0.0; n];
    let m = n.div_ceil(2);
    for i in 0..m {
        let mut x = (std::f64::consts::PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let mut dp = 0.0;
        for _ in 0..100 {
            // Recurrence for P_n(x) and P_{n-1}(x).
            let mut p0 = 1.0;
            let mut p1 = 0.0;
            for j in 0..n {
                let p2 = p1;
                p1 = p0;
                p0 = ((2 * j + 1) as f64 * x * p1 - j as f64 * p2) / (j + 1) as f64;
            }
            dp = n as f64 * (x * p0 - p1) / (x * x - 1.0);
            let dx = p0 / dp;
            x -= dx;
            if dx.abs() < 1e-15 {
                break;
            }
        }
        let w = 2.0 / ((1.0 - x * x) * dp * dp);
        nodes[i] = -x;
        nodes[n - 1 - i] = x;
        weights[i] = w;
        weights[n - 1 - i] = w;
    }
    (nodes, weights)
}

/// A precomputed composite rule.
#[derive(Debug, Clone)]
pub struct Quadrature {
    panels: usize,
    nodes: Vec<f64>,
    weights: Vec<f64>,
}

impl Quadrature {
    /// Build the rule for `config`.
    pub fn new(config: IntegrationConfig) -> Result<Self> {
        if config.panels == 0 || config.order == 0 {
            return Err(Error::Validation(format!(
                "integration needs at least one panel and one node, got {config:?}"
            )));
        }
        let (nodes, weights) = gauss_legendre(config.order);
        Ok(Self { panels: config.panels, nodes, weights })
    }

    /// Abscissas and weights of the rule mapped onto `[a, b]`.
    ///
    /// An empty or inverted interval yields no points.
    pub fn points(&self, a: f64, b: f64) -> Vec<(f64, f64)> {
        if a.partial_cmp(&b) != Some(std::cmp::Ordering::Less) {
            return Vec::new();
        }
        let h = (b - a) / self.panels as f64;
        let half = 0.5 * h;
        let mut out = Vec::with_capacity(self.panels * self.nodes.len());
        for p in 0..self.panels {
            let mid = a + h * (p as f64 + 0.5);
            for (&t, &w) in self.nodes.iter().zip(&self.weights) {
                out.push((mid + half * t, half * w));
            }
        }
        out
    }

    /// Integrate `f` over `[a, b]`.
    pub fn integrate<F>(&self, a: f64, b: f64, mut f: F) -> Result<f64>
    where
        F: FnMut(f64) -> Result<f64>,
    {
        let mut sum = 0.0;
        for (x, w) in self.points(a, b) {
            sum += w * f(x)?;
        }
        Ok(sum)
    }

    /// Integrate `f(mSq12, mSq13)` over the Dalitz plot of `ps`.
    ///
    /// Rows of constant `mSq12` are integrated in parallel; row sums are combined in
    /// `mSq12` order, so the result does not depend on the thread count.
    pub fn integrate_dalitz<T, F>(&self, ps: &PhaseSpace, f: F) -> Result<T>
    where
        T: Copy + Default + Send + Add<Output = T> + Mul<f64, Output = T>,
        F: Fn(f64, f64) -> Result<T> + Sync,
    {
        let (lo, hi) = ps.msq12_range();
        let rows = self
            .points(lo, hi)
            .into_par_iter()
            .map(|(m12, w12)| {
                let (lo13, hi13) = ps.msq13_limits(m12);
                let mut row = T::default();
                for (m13, w13) in self.points(lo13, hi13) {
                    row = row + f(m12, m13)? * w13;
                }
                Ok(row * w12)
            })
            .collect::<Result<Vec<T>>>()?;
        Ok(rows.into_iter().fold(T::default(), |acc, r| acc + r))
    }
}
