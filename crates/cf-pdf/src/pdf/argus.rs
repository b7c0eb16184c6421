use crate::cache::{CacheAllocator, CacheMap, CacheRow};
use crate::dataset::Dataset;
use crate::pdf::{Binding, Pdf, cache_shape, cached_or, invert_cdf, project_1d, u01};
use crate::state::{Limits, ModelState};
use cf_core::{Error, ParExpr, ParMap, Result, Variable};
use statrs::function::gamma::gamma_lr;
use std::collections::BTreeMap;

/// `Γ(3/2)`
const GAMMA_3_2: f64 = 0.886_226_925_452_758;

/// ARGUS background shape near a kinematic endpoint `c`.
///
/// Shape: `f(x; c, chi) = x · sqrt(u) · exp(-chi² · u)` with `u = 1 - x²/c²`, on `[0, c]`.
///
/// With `x dx = -c²/2 du` the integral over `[x_lo, x_hi]` is
/// `c²/(2|chi|³) · Γ(3/2) · [P(3/2, chi²·u(x_lo)) - P(3/2, chi²·u(x_hi))]`, where `P` is the
/// regularized lower incomplete gamma function, and `c²/3 · [u(x_lo)^{3/2} - u(x_hi)^{3/2}]`
/// for `chi = 0`.
#[derive(Debug, Clone)]
pub struct Argus {
    state: ModelState,
    c: ParExpr,
    chi: ParExpr,
    limits: Limits,
    norm: f64,
    binding: Option<Binding>,
}

impl Argus {
    /// ARGUS shape in `x` with endpoint `c` and curvature `chi`.
    pub fn new(x: Variable, c: impl Into<ParExpr>, chi: impl Into<ParExpr>) -> Result<Self> {
        let (c, chi) = (c.into(), chi.into());
        let mut pars = ParMap::new();
        c.collect_parameters(&mut pars);
        chi.collect_parameters(&mut pars);
        let mut a = Self {
            state: ModelState::new(vec![x], pars)?,
            c,
            chi,
            limits: Limits::none(),
            norm: 1.0,
            binding: None,
        };
        a.cache()?;
        Ok(a)
    }

    /// Current endpoint.
    pub fn c(&self) -> Result<f64> {
        self.c.evaluate(self.state.pars())
    }

    /// Current curvature.
    pub fn chi(&self) -> Result<f64> {
        self.chi.evaluate(self.state.pars())
    }

    /// Normalization constant for the current parameters.
    pub fn norm(&self) -> f64 {
        self.norm
    }

    /// Truncate the support. Negative limits are rejected.
    pub fn set_limits(&mut self, limits: Limits) -> Result<()> {
        for bound in [limits.lower, limits.upper].into_iter().flatten() {
            if bound < 0.0 {
                return Err(Error::Pdf(format!(
                    "Argus limits must not be negative, got {bound}"
                )));
            }
        }
        self.limits = limits;
        self.cache()
    }

    fn inputs(&self) -> Result<Vec<f64>> {
        let (lo, hi) = self.limits.bounds();
        Ok(vec![self.c()?, self.chi()?, lo, hi])
    }

    /// Support `[max(0, lower), min(c, upper)]` clipped to `[min, max]`.
    fn support(&self, min: f64, max: f64) -> Result<(f64, f64)> {
        let (lo, hi) = self.limits.clip(min.max(0.0), max.min(self.c()?));
        Ok((lo, hi))
    }

    /// Unnormalized integral over `[lo, hi]`, a sub-interval of `[0, c]`.
    fn integral(&self, lo: f64, hi: f64) -> Result<f64> {
        if hi <= lo {
            return Ok(0.0);
        }
        let (c, chi) = (self.c()?, self.chi()?);
        let c_sq = c * c;
        let u_max = 1.0 - (lo / c).powi(2);
        let u_min = 1.0 - (hi / c).powi(2);

        if chi == 0.0 {
            return Ok(c_sq / 3.0 * (u_max.powf(1.5) - u_min.powf(1.5)));
        }

        let chi_sq = chi * chi;
        let p = |u: f64| if u <= 0.0 { 0.0 } else { gamma_lr(1.5, chi_sq * u) };
        Ok(c_sq / (2.0 * chi.abs().powi(3)) * GAMMA_3_2 * (p(u_max) - p(u_min)))
    }
}

impl Pdf for Argus {
    fn state(&self) -> &ModelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ModelState {
        &mut self.state
    }

    fn cache(&mut self) -> Result<()> {
        let c = self.c()?;
        if !(c.is_finite() && c > 0.0) {
            return Err(Error::Pdf(format!("Argus: endpoint c must be positive, got {c}")));
        }
        let (lo, hi) = self.support(0.0, c)?;
        let norm = self.integral(lo, hi)?;
        if !norm.is_finite() || norm <= 0.0 {
            return Err(Error::Degenerate(format!("Argus: normalization is {norm}")));
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
            return Err(Error::Pdf(format!("Argus expects 1 variable, got {}", vars.len())));
        };
        let x = *x;
        let (c, chi) = (self.c()?, self.chi()?);
        if !self.limits.contains(x) || x < 0.0 || x > c {
            return Ok(0.0);
        }
        let u = 1.0 - (x / c).powi(2);
        Ok(x * u.sqrt() * (-chi * chi * u).exp() / self.norm)
    }

    fn evaluate_cached(&self, vars: &[f64], row: &CacheRow<'_>) -> Result<f64> {
        cached_or(self, &self.binding, vars, row)
    }

    fn area(&self, min: f64, max: f64) -> Result<f64> {
        let (lo, hi) = self.support(min, max)?;
        Ok(self.integral(lo, hi)? / self.norm)
    }

    fn generate(&self, rng: &mut dyn rand::RngCore) -> Result<BTreeMap<String, f64>> {
        let (lo, hi) = self.support(0.0, self.c()?)?;
        let u = u01(rng);
        let x = invert_cdf(|x| self.area(lo, x), u, lo, hi)?;
        Ok(BTreeMap::from([(self.state.vars()[0].name().to_string(), x)]))
    }

    fn project(&self, var: &str, value: f64) -> Result<f64> {
        project_1d(self, var, value)
    }
}
