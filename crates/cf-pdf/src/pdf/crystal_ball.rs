use crate::cache::{CacheAllocator, CacheMap, CacheRow};
use crate::dataset::Dataset;
use crate::pdf::{
    Binding, Pdf, cache_shape, cached_or, invert_cdf, project_1d, sampling_bracket, u01,
};
use crate::state::{Limits, ModelState};
use cf_core::{Error, ParExpr, ParMap, Result, Variable};
use statrs::function::erf::erf;
use std::collections::BTreeMap;
use std::f64::consts::{FRAC_PI_2, SQRT_2};

/// Gaussian core with power-law tails on both sides.
///
/// In `t = (x - mu)/sigma`:
/// - `t < -alpha`: `A·(B - t)^(-n)`, `A = (n/alpha)^n·exp(-alpha²/2)`, `B = n/alpha - alpha`
/// - `-alpha <= t <= beta`: `exp(-t²/2)`
/// - `t > beta`: `A'·(B' + t)^(-m)`, `A' = (m/beta)^m·exp(-beta²/2)`, `B' = m/beta - beta`
///
/// The shape and its first derivative are continuous at both junctions. Without a limit on
/// a side, that side's power must exceed one for the density to be normalizable.
#[derive(Debug, Clone)]
pub struct DoubleCrystalBall {
    state: ModelState,
    exprs: [ParExpr; 6],
    limits: Limits,
    norm: f64,
    binding: Option<Binding>,
}

#[derive(Debug, Clone, Copy)]
struct Shape {
    mu: f64,
    sigma: f64,
    alpha: f64,
    n: f64,
    beta: f64,
    m: f64,
}

/// Powers closer to one than this use the logarithmic antiderivative.
const UNIT_POWER_EPS: f64 = 1e-9;

impl Shape {
    fn t(&self, x: f64) -> f64 {
        (x - self.mu) / self.sigma
    }

    /// `ln A`
    fn ln_a_lo(&self) -> f64 {
        self.n * (self.n / self.alpha).ln() - 0.5 * self.alpha * self.alpha
    }

    fn b_lo(&self) -> f64 {
        self.n / self.alpha - self.alpha
    }

    fn ln_a_up(&self) -> f64 {
        self.m * (self.m / self.beta).ln() - 0.5 * self.beta * self.beta
    }

    fn b_up(&self) -> f64 {
        self.m / self.beta - self.beta
    }

    fn value(&self, t: f64) -> f64 {
        if t < -self.alpha {
            (self.ln_a_lo() - self.n * (self.b_lo() - t).ln()).exp()
        } else if t > self.beta {
            (self.ln_a_up() - self.m * (self.b_up() + t).ln()).exp()
        } else {
            (-0.5 * t * t).exp()
        }
    }

    fn prim_lo(&self, t: f64) -> f64 {
        let d = self.b_lo() - t;
        if (self.n - 1.0).abs() < UNIT_POWER_EPS {
            -self.ln_a_lo().exp() * d.ln()
        } else {
            ((self.ln_a_lo() + (1.0 - self.n) * d.ln()).exp()) / (self.n - 1.0)
        }
    }

    fn prim_core(&self, t: f64) -> f64 {
        FRAC_PI_2.sqrt() * erf(t / SQRT_2)
    }

    fn prim_up(&self, t: f64) -> f64 {
        let d = self.b_up() + t;
        if (self.m - 1.0).abs() < UNIT_POWER_EPS {
            self.ln_a_up().exp() * d.ln()
        } else {
            -((self.ln_a_up() + (1.0 - self.m) * d.ln()).exp()) / (self.m - 1.0)
        }
    }

    /// `∫ value(t) dt` over `[t1, t2]`, split at the junctions.
    fn integral_t(&self, t1: f64, t2: f64) -> f64 {
        if t2 <= t1 {
            return 0.0;
        }
        let (ja, jb) = (-self.alpha, self.beta);
        let mut sum = 0.0;
        if t1 < ja {
            sum += self.prim_lo(t2.min(ja)) - self.prim_lo(t1);
        }
        let (c1, c2) = (t1.max(ja), t2.min(jb));
        if c2 > c1 {
            sum += self.prim_core(c2) - self.prim_core(c1);
        }
        if t2 > jb {
            sum += self.prim_up(t2) - self.prim_up(t1.max(jb));
        }
        sum
    }
}

impl DoubleCrystalBall {
    /// Double Crystal Ball in `x`, truncated to `limits`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        x: Variable,
        mu: impl Into<ParExpr>,
        sigma: impl Into<ParExpr>,
        alpha: impl Into<ParExpr>,
        n: impl Into<ParExpr>,
        beta: impl Into<ParExpr>,
        m: impl Into<ParExpr>,
        limits: Limits,
    ) -> Result<Self> {
        let exprs = [mu.into(), sigma.into(), alpha.into(), n.into(), beta.into(), m.into()];
        let mut pars = ParMap::new();
        exprs.iter().for_each(|e| e.collect_parameters(&mut pars));
        let mut dcb = Self {
            state: ModelState::new(vec![x], pars)?,
            exprs,
            limits,
            norm: 1.0,
            binding: None,
        };
        dcb.cache()?;
        Ok(dcb)
    }

    fn shape(&self) -> Result<Shape> {
        let pars = self.state.pars();
        let v = |i: usize| self.exprs[i].evaluate(pars);
        Ok(Shape { mu: v(0)?, sigma: v(1)?, alpha: v(2)?, n: v(3)?, beta: v(4)?, m: v(5)? })
    }

    /// Normalization constant for the current parameters.
    pub fn norm(&self) -> f64 {
        self.norm
    }

    /// Truncate the support and refresh the normalization.
    pub fn set_limits(&mut self, limits: Limits) -> Result<()> {
        self.limits = limits;
        self.cache()
    }

    fn inputs(&self) -> Result<Vec<f64>> {
        let s = self.shape()?;
        let (lo, hi) = self.limits.bounds();
        Ok(vec![s.mu, s.sigma, s.alpha, s.n, s.beta, s.m, lo, hi])
    }
}

impl Pdf for DoubleCrystalBall {
    fn state(&self) -> &ModelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ModelState {
        &mut self.state
    }

    fn cache(&mut self) -> Result<()> {
        let s = self.shape()?;
        let positive = [s.sigma, s.alpha, s.n, s.beta, s.m];
        if positive.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
            return Err(Error::Pdf(format!(
                "DoubleCrystalBall: sigma, alpha, n, beta, m must be positive, got {positive:?}"
            )));
        }
        if self.limits.lower.is_none() && s.n <= 1.0 {
            return Err(Error::Pdf(format!(
                "DoubleCrystalBall: lower tail with n = {} needs a lower limit",
                s.n
            )));
        }
        if self.limits.upper.is_none() && s.m <= 1.0 {
            return Err(Error::Pdf(format!(
                "DoubleCrystalBall: upper tail with m = {} needs an upper limit",
                s.m
            )));
        }
        let (lo, hi) = self.limits.bounds();
        let norm = s.sigma * s.integral_t(s.t(lo), s.t(hi));
        if !norm.is_finite() || norm <= 0.0 {
            return Err(Error::Degenerate(format!("DoubleCrystalBall: normalization is {norm}")));
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
            return Err(Error::Pdf(format!(
                "DoubleCrystalBall expects 1 variable, got {}",
                vars.len()
            )));
        };
        if !self.limits.contains(*x) {
            return Ok(0.0);
        }
        let s = self.shape()?;
        Ok(s.value(s.t(*x)) / self.norm)
    }

    fn evaluate_cached(&self, vars: &[f64], row: &CacheRow<'_>) -> Result<f64> {
        cached_or(self, &self.binding, vars, row)
    }

    fn area(&self, min: f64, max: f64) -> Result<f64> {
        let (lo, hi) = self.limits.clip(min, max);
        if hi <= lo {
            return Ok(0.0);
        }
        let s = self.shape()?;
        Ok(s.sigma * s.integral_t(s.t(lo), s.t(hi)) / self.norm)
    }

    fn generate(&self, rng: &mut dyn rand::RngCore) -> Result<BTreeMap<String, f64>> {
        let s = self.shape()?;
        let (lower, _) = self.limits.bounds();
        let cdf = |x: f64| self.area(lower, x);
        let (lo, hi) = sampling_bracket(cdf, s.mu, s.sigma, self.limits.bounds())?;
        let x = invert_cdf(cdf, u01(rng), lo, hi)?;
        Ok(BTreeMap::from([(self.state.vars()[0].name().to_string(), x)]))
    }

    fn project(&self, var: &str, value: f64) -> Result<f64> {
        project_1d(self, var, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{IntegrationConfig, Quadrature};
    use approx::assert_relative_eq;
    use cf_core::Parameter;
    use rand::SeedableRng;

    fn dcb(alpha: f64, n: f64, beta: f64, m: f64, limits: Limits) -> DoubleCrystalBall {
        DoubleCrystalBall::new(
            Variable::new("m"),
            Parameter::fixed("mean", 5.28),
            Parameter::fixed("width", 0.01),
            Parameter::fixed("alpha", alpha),
            Parameter::fixed("n", n),
            Parameter::fixed("beta", beta),
            Parameter::fixed("mm", m),
            limits,
        )
        .unwrap()
    }

    #[test]
    fn test_continuous_at_junctions() {
        let d = dcb(1.5, 3.0, 2.0, 5.0, Limits::none());
        let eps = 1e-9;
        for t in [-1.5, 2.0] {
            let x = 5.28 + 0.01 * t;
            let left = d.evaluate_value(x - eps).unwrap();
            let right = d.evaluate_value(x + eps).unwrap();
            assert_relative_eq!(left, right, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_area_over_wide_range_is_one() {
        let d = dcb(1.5, 5.0, 2.0, 6.0, Limits::none());
        let full = d.area(f64::NEG_INFINITY, f64::INFINITY).unwrap();
        assert_relative_eq!(full, 1.0, epsilon = 1e-12);

        let q = Quadrature::new(IntegrationConfig { panels: 2000, order: 8 }).unwrap();
        let total = q.integrate(5.28 - 1.0, 5.28 + 1.0, |x| d.evaluate_value(x)).unwrap();
        assert_relative_eq!(total, 1.0, epsilon = 1e-4);
        let split = d.area(5.27, 5.29).unwrap() + d.area(5.29, 6.0).unwrap();
        assert_relative_eq!(split, d.area(5.27, 6.0).unwrap(), epsilon = 1e-12);
    }

    #[test]
    fn test_unit_power_needs_limits() {
        let unbounded = DoubleCrystalBall::new(
            Variable::new("m"),
            0.0,
            1.0,
            1.0,
            1.0,
            1.0,
            3.0,
            Limits::none(),
        );
        assert!(matches!(unbounded, Err(Error::Pdf(_))));

        let mut d = dcb(1.0, 3.0, 1.0, 3.0, Limits::none());
        d.set_limits(Limits::between(5.0, 5.5).unwrap()).unwrap();
        let q = Quadrature::new(IntegrationConfig { panels: 400, order: 8 }).unwrap();
        let total = q.integrate(5.0, 5.5, |x| d.evaluate_value(x)).unwrap();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_log_antiderivative_for_unit_powers() {
        let d = dcb(1.2, 1.0, 1.4, 1.0, Limits::between(5.0, 5.6).unwrap());
        let q = Quadrature::new(IntegrationConfig { panels: 400, order: 8 }).unwrap();
        let total = q.integrate(5.0, 5.6, |x| d.evaluate_value(x)).unwrap();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
        let split = d.area(5.0, 5.28).unwrap() + d.area(5.28, 5.6).unwrap();
        assert_relative_eq!(split, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_generate_median() {
        let d = dcb(1.5, 3.0, 2.0, 5.0, Limits::none());
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let xs: Vec<f64> = (0..1000).map(|_| d.generate(&mut rng).unwrap()["m"]).collect();
        let below = xs.iter().filter(|&&x| d.area(f64::NEG_INFINITY, x).unwrap() < 0.5).count();
        assert!((400..600).contains(&below));
    }
}
