//! Real multiplicative functions over the Dalitz plot, e.g. efficiency maps.

use crate::phase_space::DalitzPoint;
use cf_core::{ParExpr, ParMap, Result};
use std::collections::BTreeSet;
use std::fmt::Debug;

/// A real function of a Dalitz point that multiplies a decay density.
pub trait DalitzFunction: Send + Sync + Debug {
    /// Value at a point.
    fn evaluate(&self, p: &DalitzPoint, pars: &ParMap) -> Result<f64>;

    /// Register the function's parameters in `out`.
    fn collect_parameters(&self, out: &mut ParMap);

    /// Names of the function's parameters.
    fn collect_names(&self, out: &mut BTreeSet<String>) {
        let mut pars = ParMap::new();
        self.collect_parameters(&mut pars);
        out.extend(pars.into_keys());
    }
}

/// Polynomial `Σ c_ij · (mSq12 - x0)^i · (mSq13 - y0)^j`.
#[derive(Debug, Clone, Default)]
pub struct DalitzPolynomial {
    center: (f64, f64),
    terms: Vec<(u32, u32, ParExpr)>,
}

impl DalitzPolynomial {
    /// Polynomial without terms, expanded around `(x0, y0)`.
    pub fn new(x0: f64, y0: f64) -> Self {
        Self { center: (x0, y0), terms: Vec::new() }
    }

    /// Add the term `coef · x^i · y^j`.
    pub fn with_term(mut self, i: u32, j: u32, coef: impl Into<ParExpr>) -> Self {
        self.terms.push((i, j, coef.into()));
        self
    }
}

impl DalitzFunction for DalitzPolynomial {
    fn evaluate(&self, p: &DalitzPoint, pars: &ParMap) -> Result<f64> {
        let x = p.msq12 - self.center.0;
        let y = p.msq13 - self.center.1;
        let mut sum = 0.0;
        for (i, j, c) in &self.terms {
            sum += c.evaluate(pars)? * x.powi(*i as i32) * y.powi(*j as i32);
        }
        Ok(sum)
    }

    fn collect_parameters(&self, out: &mut ParMap) {
        self.terms.iter().for_each(|(_, _, c)| c.collect_parameters(out));
    }
}
