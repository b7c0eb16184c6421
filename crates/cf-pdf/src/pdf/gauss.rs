use crate::cache::{CacheAllocator, CacheMap, CacheRow};
use crate::dataset::Dataset;
use crate::pdf::{Binding, Pdf, cache_shape, cached_or, project_1d};
use crate::state::{Limits, ModelState};
use cf_core::{Error, ParExpr, ParMap, Result, Variable};
use rand_distr::{Distribution, Normal};
use statrs::function::erf::erf;
use std::collections::BTreeMap;
use std::f64::consts::{FRAC_PI_2, SQRT_2};

/// Gaussian density `exp(-(x - mu)² / 2sigma²) / norm`, optionally truncated.
///
/// `norm = sigma·sqrt(pi/2)·[erf(z(upper)) - erf(z(lower))]` with `z(x) = (x - mu)/(sigma·sqrt 2)`.
#[derive(Debug, Clone)]
pub struct Gauss {
    state: ModelState,
    mu: ParExpr,
    sigma: ParExpr,
    limits: Limits,
    norm: f64,
    binding: Option<Binding>,
}

impl Gauss {
    /// Gaussian in `x` with mean `mu` and width `sigma`.
    pub fn new(x: Variable, mu: impl Into<ParExpr>, sigma: impl Into<ParExpr>) -> Result<Self> {
        let (mu, sigma) = (mu.into(), sigma.into());
        let mut pars = ParMap::new();
        mu.collect_parameters(&mut pars);
        sigma.collect_parameters(&mut pars);
        let mut g = Self {
            state: ModelState::new(vec![x], pars)?,
            mu,
            sigma,
            limits: Limits::none(),
            norm: 1.0,
            binding: None,
        };
        g.cache()?;
        Ok(g)
    }

    /// Current mean.
    pub fn mu(&self) -> Result<f64> {
        self.mu.evaluate(self.state.pars())
    }

    /// Current width.
    pub fn sigma(&self) -> Result<f64> {
        self.sigma.evaluate(self.state.pars())
    }

    /// Normalization constant for the current parameters.
    pub fn norm(&self) -> f64 {
        self.norm
    }

    /// Current truncation.
    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Truncate the support and refresh the normalization.
    pub fn set_limits(&mut self, limits: Limits) -> Result<()> {
        self.limits = limits;
        self.cache()
    }

    fn inputs(&self) -> Result<Vec<f64>> {
        let (lo, hi) = self.limits.bounds();
        Ok(vec![self.mu()?, self.sigma()?, lo, hi])
    }

    fn erf_span(&self, lo: f64, hi: f64) -> Result<f64> {
        let (mu, sigma) = (self.mu()?, self.sigma()?);
        let arg = |x: f64| erf(((x - mu) / (sigma * SQRT_2)).clamp(-30.0, 30.0));
        Ok(sigma * FRAC_PI_2.sqrt() * (arg(hi) - arg(lo)))
    }
}

impl Pdf for Gauss {
    fn state(&self) -> &ModelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ModelState {
        &mut self.state
    }

    fn cache(&mut self) -> Result<()> {
        let sigma = self.sigma()?;
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(Error::Pdf(format!("Gauss: sigma must be positive, got {sigma}")));
        }
        let (lo, hi) = self.limits.bounds();
        let norm = self.erf_span(lo, hi)?;
        if !norm.is_finite() || norm <= 0.0 {
            return Err(Error::Degenerate(format!("Gauss: normalization is {norm}")));
        }
        self.norm = norm;
        let inputs = self.inputs()?;
        Binding::retain(&mut self.binding, self.state.is_fixed(), &inputs);
        Ok(())
    }

    fn cache_real(&mut self, data: &Dataset, alloc: &mut CacheAllocator) -> Result<CacheMap<f64>> {
        let inputs = self.inputs()?;
        let (binding, map) = cache_shape(&*self, &self.binding, inputs, data, alloc)?;
        self.binding = binding;
        Ok(map)
    }

    fn evaluate(&self, vars: &[f64]) -> Result<f64> {
        let [x] = vars else {
            return Err(Error::Pdf(format!("Gauss expects 1 variable, got {}", vars.len())));
        };
        if !self.limits.contains(*x) {
            return Ok(0.0);
        }
        let (mu, sigma) = (self.mu()?, self.sigma()?);
        Ok((-0.5 * ((x - mu) / sigma).powi(2)).exp() / self.norm)
    }

    fn evaluate_cached(&self, vars: &[f64], row: &CacheRow<'_>) -> Result<f64> {
        cached_or(self, &self.binding, vars, row)
    }

    fn area(&self, min: f64, max: f64) -> Result<f64> {
        let (lo, hi) = self.limits.clip(min, max);
        if hi <= lo {
            return Ok(0.0);
        }
        Ok(self.erf_span(lo, hi)? / self.norm)
    }

    fn generate(&self, rng: &mut dyn rand::RngCore) -> Result<BTreeMap<String, f64>> {
        let dist = Normal::new(self.mu()?, self.sigma()?)
            .map_err(|e| Error::Pdf(format!("Gauss: {e}")))?;
        // Rejection against the truncation.
        for _ in 0..1_000_000 {
            let x = dist.sample(rng);
            if self.limits.contains(x) {
                return Ok(BTreeMap::from([(self.state.vars()[0].name().to_string(), x)]));
            }
        }
        Err(Error::Computation("Gauss::generate: acceptance too low within limits".into()))
    }

    fn project(&self, var: &str, value: f64) -> Result<f64> {
        project_1d(self, var, value)
    }
}
