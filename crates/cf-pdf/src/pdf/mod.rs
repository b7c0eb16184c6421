//! Probability density models.
//!
//! Every model implements [`Pdf`]. The lifecycle is strictly split:
//! - `&mut self` methods (`set_*`, `cache`, `cache_real`, `cache_complex`) mutate the model
//!   and are called by the session coordinator between evaluations;
//! - `&self` methods (`evaluate*`, `area`, `project*`, `generate`) never mutate and may run
//!   concurrently over many dataset entries.

use crate::cache::{CacheAllocator, CacheMap, CacheRow, CacheSlot};
use crate::dataset::Dataset;
use crate::state::ModelState;
use cf_core::{Error, ParMap, Result};
use num_complex::Complex64;
use std::collections::BTreeMap;

mod argus;
mod crystal_ball;
mod decay3body;
mod gauss;
mod product;

pub use argus::Argus;
pub use crystal_ball::DoubleCrystalBall;
pub use decay3body::{Decay3BodyCp, NormComponents, multiply};
pub use gauss::Gauss;
pub use product::ProductPdf;

/// Capability interface shared by all density models.
pub trait Pdf: Send + Sync {
    /// Variables and parameters of the model.
    fn state(&self) -> &ModelState;

    /// Mutable access to variables and parameters.
    fn state_mut(&mut self) -> &mut ModelState;

    /// Variable names in declaration order.
    fn var_names(&self) -> Vec<String> {
        self.state().var_names()
    }

    /// Number of variables.
    fn n_vars(&self) -> usize {
        self.state().vars().len()
    }

    /// Parameters keyed by name.
    fn pars(&self) -> &ParMap {
        self.state().pars()
    }

    /// True iff every parameter is fixed.
    fn is_fixed(&self) -> bool {
        self.state().is_fixed()
    }

    /// Whether the model depends on a variable.
    fn depends_on(&self, var: &str) -> bool {
        self.state().var_index(var).is_some()
    }

    /// Set the variable values positionally.
    fn set_vars(&mut self, vars: &[f64]) -> Result<()> {
        self.state_mut().set_vars(vars)
    }

    /// Set one variable by name.
    fn set_var(&mut self, name: &str, value: f64, error: Option<f64>) -> Result<()> {
        self.state_mut().set_var(name, value, error)
    }

    /// Set every parameter value positionally, in name order.
    fn set_pars(&mut self, pars: &[f64]) -> Result<()> {
        self.state_mut().set_pars(pars)
    }

    /// Set one parameter by name.
    fn set_par(&mut self, name: &str, value: f64, error: Option<f64>) -> Result<()> {
        self.state_mut().set_par(name, value, error)
    }

    /// Fix a parameter.
    fn fix_par(&mut self, name: &str) -> Result<()> {
        self.state_mut().fix_par(name)
    }

    /// Let a parameter float.
    fn release_par(&mut self, name: &str) -> Result<()> {
        self.state_mut().release_par(name)
    }

    /// Refresh everything common to all points (normalization) for the current parameters.
    ///
    /// Also drops per-entry cache slots whose inputs are no longer fixed or have changed.
    fn cache(&mut self) -> Result<()>;

    /// Real per-entry values to cache for `data`, or an empty map if not cacheable.
    fn cache_real(&mut self, _data: &Dataset, _alloc: &mut CacheAllocator) -> Result<CacheMap<f64>> {
        Ok(CacheMap::new())
    }

    /// Complex per-entry values to cache for `data`, or an empty map if not cacheable.
    fn cache_complex(
        &mut self,
        _data: &Dataset,
        _alloc: &mut CacheAllocator,
    ) -> Result<CacheMap<Complex64>> {
        Ok(CacheMap::new())
    }

    /// Normalized density at explicit variable values (declaration order).
    fn evaluate(&self, vars: &[f64]) -> Result<f64>;

    /// Normalized density at the current variable values.
    fn evaluate_current(&self) -> Result<f64> {
        self.evaluate(&self.state().values())
    }

    /// Normalized density of a single-variable model.
    fn evaluate_value(&self, x: f64) -> Result<f64> {
        if self.n_vars() != 1 {
            return Err(Error::Pdf(format!(
                "evaluate(value) called on a model of {} variables",
                self.n_vars()
            )));
        }
        self.evaluate(&[x])
    }

    /// Normalized density of a dataset entry, reading cached values from `row` when the
    /// model holds cache slots.
    fn evaluate_cached(&self, vars: &[f64], _row: &CacheRow<'_>) -> Result<f64> {
        self.evaluate(vars)
    }

    /// Probability content of `[min, max]`.
    fn area(&self, _min: f64, _max: f64) -> Result<f64> {
        Err(Error::Pdf("area is not available for this model".into()))
    }

    /// Draw one point, keyed by variable name.
    fn generate(&self, rng: &mut dyn rand::RngCore) -> Result<BTreeMap<String, f64>>;

    /// Density marginalized over every variable except `var`, at `var = value`.
    fn project(&self, var: &str, value: f64) -> Result<f64>;

    /// Density marginalized over every variable except `var1` and `var2`, at
    /// `var1 = val1`, `var2 = val2`.
    fn project2(&self, var1: &str, var2: &str, _val1: f64, _val2: f64) -> Result<f64> {
        Err(Error::Pdf(format!(
            "projection onto ('{var1}', '{var2}') is not available for this model"
        )))
    }

    /// Write the variable values of a dataset entry into `out` (declaration order).
    fn entry_values(&self, data: &Dataset, entry: usize, out: &mut Vec<f64>) -> Result<()> {
        out.clear();
        for v in self.state().vars() {
            out.push(data.value(v.name(), entry)?);
        }
        Ok(())
    }
}

/// A cache slot together with the input values its sequence was computed for.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Binding {
    pub slot: CacheSlot,
    pub inputs: Vec<f64>,
}

impl Binding {
    /// Keep the binding only while `inputs` are unchanged.
    pub fn retain(binding: &mut Option<Binding>, fixed: bool, inputs: &[f64]) {
        if binding.as_ref().is_some_and(|b| !fixed || b.inputs != inputs) {
            log::debug!("dropping stale cache slot");
            *binding = None;
        }
    }
}

/// Evaluate `f` at every entry of `data`, in entry order.
pub(crate) fn per_entry<P, T, F>(pdf: &P, data: &Dataset, mut f: F) -> Result<Vec<T>>
where
    P: Pdf + ?Sized,
    F: FnMut(&[f64]) -> Result<T>,
{
    let mut buf = Vec::with_capacity(pdf.n_vars());
    let mut out = Vec::with_capacity(data.n_entries());
    for entry in 0..data.n_entries() {
        pdf.entry_values(data, entry, &mut buf)?;
        out.push(f(&buf)?);
    }
    Ok(out)
}

/// Cache the normalized density of a one-dimensional shape if all its parameters are fixed.
pub(crate) fn cache_shape<P: Pdf>(
    pdf: &P,
    binding: &Option<Binding>,
    inputs: Vec<f64>,
    data: &Dataset,
    alloc: &mut CacheAllocator,
) -> Result<(Option<Binding>, CacheMap<f64>)> {
    if !pdf.is_fixed() {
        return Ok((None, CacheMap::new()));
    }
    // The full sequence is built before a slot is claimed.
    let values = per_entry(pdf, data, |vars| pdf.evaluate(vars))?;
    let slot = alloc.claim_real(binding.as_ref().map(|b| b.slot));
    Ok((Some(Binding { slot, inputs }), CacheMap::from([(slot.index(), values)])))
}

/// Read a cached shape value, or evaluate when the model holds no slot.
pub(crate) fn cached_or<P: Pdf>(
    pdf: &P,
    binding: &Option<Binding>,
    vars: &[f64],
    row: &CacheRow<'_>,
) -> Result<f64> {
    match binding {
        Some(b) => row.real(&b.slot),
        None => pdf.evaluate(vars),
    }
}

/// Projection of a one-dimensional model: its density at `value`.
pub(crate) fn project_1d<P: Pdf>(pdf: &P, var: &str, value: f64) -> Result<f64> {
    if !pdf.depends_on(var) {
        return Err(Error::Pdf(format!("model does not depend on variable '{var}'")));
    }
    pdf.evaluate(&[value])
}

/// Uniform(0,1) from RngCore (open interval).
#[inline]
pub(crate) fn u01(rng: &mut dyn rand::RngCore) -> f64 {
    (rng.next_u64() as f64 + 0.5) * (1.0 / 18446744073709551616.0_f64)
}

/// Solve `cdf(x) = u` on `[lo, hi]` by bisection. `cdf` must be non-decreasing.
pub(crate) fn invert_cdf<F>(cdf: F, u: f64, mut lo: f64, mut hi: f64) -> Result<f64>
where
    F: Fn(f64) -> Result<f64>,
{
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if cdf(mid)? < u {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-12 * (1.0 + mid.abs()) {
            break;
        }
    }
    Ok(0.5 * (lo + hi))
}

/// Finite bracket `[lo, hi]` of a shape centred at `mu` with scale `sigma` such that the
/// probability outside it is below `1e-12` on each side, clipped to finite limits.
pub(crate) fn sampling_bracket<F>(
    cdf: F,
    mu: f64,
    sigma: f64,
    limits: (f64, f64),
) -> Result<(f64, f64)>
where
    F: Fn(f64) -> Result<f64>,
{
    let mut lo = if limits.0.is_finite() { limits.0 } else { mu - sigma };
    let mut step = sigma;
    while !limits.0.is_finite() && cdf(lo)? > 1e-12 {
        step *= 2.0;
        lo = mu - step;
        if step > 1e12 * sigma {
            return Err(Error::Computation("could not bracket the lower tail".into()));
        }
    }
    let mut hi = if limits.1.is_finite() { limits.1 } else { mu + sigma };
    step = sigma;
    while !limits.1.is_finite() && cdf(hi)? < 1.0 - 1e-12 {
        step *= 2.0;
        hi = mu + step;
        if step > 1e12 * sigma {
            return Err(Error::Computation("could not bracket the upper tail".into()));
        }
    }
    Ok((lo, hi))
}
