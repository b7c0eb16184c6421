//! Three-body decay density with interference between a decay and its CP conjugate.
//!
//! With `A` the direct amplitude, `Ā` the conjugate amplitude at the CP-swapped point, `F`
//! the product of attached functions, `z` the interference coefficient and `κ` the
//! coherence factor:
//!
//! ```text
//! unnorm = F·(|A|² + |Ā|² + 2κ·Re(z·A·conj(Ā)))
//! norm   = nDir + nCnj + 2κ·Re(z·nXed)
//! nDir = ∫F|A|²    nCnj = ∫F|Ā|²    nXed = ∫F·A·conj(Ā)
//! ```
//!
//! The three components depend only on the amplitude and function parameters, so a change
//! of `z` or `κ` alone costs no integration.

use crate::amplitude::{Amplitude, CoefExpr};
use crate::cache::{CacheAllocator, CacheMap, CacheRow, CacheSlot};
use crate::dataset::Dataset;
use crate::function::DalitzFunction;
use crate::normalize::{IntegrationConfig, Quadrature};
use crate::pdf::{Binding, Pdf, per_entry, u01};
use crate::phase_space::{DalitzPoint, PhaseSpace};
use crate::state::ModelState;
use cf_core::{Error, ParExpr, ParMap, Parameter, Result, Variable};
use num_complex::Complex64;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Add, Mul};
use std::sync::Arc;

/// Accept-reject trials before `generate` gives up.
const MAX_GENERATE_ATTEMPTS: usize = 10_000_000;

/// The three phase-space integrals entering the normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NormComponents {
    /// `∫F|A|²`
    pub dir: f64,
    /// `∫F|Ā|²`
    pub cnj: f64,
    /// `∫F·A·conj(Ā)`
    pub xed: Complex64,
}

impl Add for NormComponents {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self { dir: self.dir + rhs.dir, cnj: self.cnj + rhs.cnj, xed: self.xed + rhs.xed }
    }
}

impl Mul<f64> for NormComponents {
    type Output = Self;
    fn mul(self, w: f64) -> Self {
        Self { dir: self.dir * w, cnj: self.cnj * w, xed: self.xed * w }
    }
}

#[derive(Debug, Clone)]
struct StoredComponents {
    values: NormComponents,
    inputs: Vec<f64>,
}

#[derive(Debug, Clone)]
struct AmpBinding {
    dir: CacheSlot,
    cnj: CacheSlot,
    inputs: Vec<f64>,
}

/// Decay density over `(mSq12, mSq13, mSq23)` with CP interference.
#[derive(Debug, Clone)]
pub struct Decay3BodyCp {
    state: ModelState,
    ps: PhaseSpace,
    amp: Amplitude,
    amp_cnj: Option<Amplitude>,
    z: CoefExpr,
    kappa: Option<ParExpr>,
    funcs: Vec<Arc<dyn DalitzFunction>>,
    quad: Quadrature,

    components: Option<StoredComponents>,
    norm: f64,
    fixed_amp: bool,
    max_pdf: Option<f64>,

    amp_binding: Option<AmpBinding>,
    func_binding: Option<Binding>,
}

impl Decay3BodyCp {
    /// Model over the variables `[mSq12, mSq13, mSq23]`.
    ///
    /// The conjugate amplitude is the direct one evaluated at the CP-swapped point.
    pub fn new(vars: [Variable; 3], amp: Amplitude, z: CoefExpr, ps: PhaseSpace) -> Result<Self> {
        let mut model = Self {
            state: ModelState::new(vars.into(), ParMap::new())?,
            ps,
            amp,
            amp_cnj: None,
            z,
            kappa: None,
            funcs: Vec::new(),
            quad: Quadrature::new(IntegrationConfig::default())?,
            components: None,
            norm: 1.0,
            fixed_amp: false,
            max_pdf: None,
            amp_binding: None,
            func_binding: None,
        };
        model.rebuild()?;
        Ok(model)
    }

    /// Scale the interference term by a coherence factor.
    pub fn with_kappa(mut self, kappa: impl Into<ParExpr>) -> Result<Self> {
        self.kappa = Some(kappa.into());
        self.rebuild()?;
        Ok(self)
    }

    /// Use a distinct amplitude for the conjugate process, evaluated at the CP-swapped point.
    pub fn with_conjugate(mut self, amp_cnj: Amplitude) -> Result<Self> {
        self.amp_cnj = Some(amp_cnj);
        self.rebuild()?;
        Ok(self)
    }

    /// Change the integration rule used for normalization and projections.
    pub fn with_integration(mut self, config: IntegrationConfig) -> Result<Self> {
        self.quad = Quadrature::new(config)?;
        self.rebuild()?;
        Ok(self)
    }

    /// Multiply the density by `f`. Its parameters join the model, and the normalization
    /// is re-integrated including `f`.
    pub fn attach(&mut self, f: Arc<dyn DalitzFunction>) -> Result<()> {
        self.funcs.push(f);
        self.func_binding = None;
        self.rebuild()
    }

    /// Register every parameter, drop stored components and refresh the normalization.
    fn rebuild(&mut self) -> Result<()> {
        let mut pars = ParMap::new();
        self.amp.collect_parameters(&mut pars);
        if let Some(cnj) = &self.amp_cnj {
            cnj.collect_parameters(&mut pars);
        }
        self.z.collect_parameters(&mut pars);
        if let Some(k) = &self.kappa {
            k.collect_parameters(&mut pars);
        }
        for f in &self.funcs {
            f.collect_parameters(&mut pars);
        }
        self.state.register(pars);
        self.components = None;
        self.amp_binding = None;
        self.cache()
    }

    /// Phase space of the decay.
    pub fn phase_space(&self) -> &PhaseSpace {
        &self.ps
    }

    /// Name of the `mSq12` variable.
    pub fn msq12_name(&self) -> &str {
        self.state.vars()[0].name()
    }

    /// Name of the `mSq13` variable.
    pub fn msq13_name(&self) -> &str {
        self.state.vars()[1].name()
    }

    /// Name of the `mSq23` variable.
    pub fn msq23_name(&self) -> &str {
        self.state.vars()[2].name()
    }

    /// Current normalization components, if computed or injected.
    pub fn components(&self) -> Option<NormComponents> {
        self.components.as_ref().map(|c| c.values)
    }

    /// `∫F|A|²`
    pub fn n_dir(&self) -> f64 {
        self.components().map_or(f64::NAN, |c| c.dir)
    }

    /// `∫F|Ā|²`
    pub fn n_cnj(&self) -> f64 {
        self.components().map_or(f64::NAN, |c| c.cnj)
    }

    /// `∫F·A·conj(Ā)`
    pub fn n_xed(&self) -> Complex64 {
        self.components().map_or(Complex64::new(f64::NAN, f64::NAN), |c| c.xed)
    }

    /// Normalization for the current parameters.
    pub fn norm(&self) -> f64 {
        self.norm
    }

    /// Whether every parameter feeding the normalization components was fixed at the last
    /// `cache()`.
    pub fn fixed_amp(&self) -> bool {
        self.fixed_amp
    }

    /// Whether per-entry amplitudes are read from the cache.
    pub fn caches_amplitudes(&self) -> bool {
        self.amp_binding.is_some()
    }

    /// Upper bound of the normalized density used by `generate`.
    pub fn set_max_pdf(&mut self, max: f64) {
        self.max_pdf = Some(max);
    }

    /// Inject known normalization components.
    ///
    /// Honored only when the amplitude and functions are fixed; returns whether they were.
    pub fn set_norm_components(&mut self, dir: f64, cnj: f64, xed: Complex64) -> Result<bool> {
        self.fixed_amp = self.norm_inputs_fixed();
        if !self.fixed_amp {
            log::debug!("ignoring injected normalization components: amplitude is floating");
            return Ok(false);
        }
        let inputs = self.state.par_values(&self.norm_names())?;
        let values = NormComponents { dir, cnj, xed };
        self.components = Some(StoredComponents { values, inputs });
        self.norm = self.norm_from(&values)?;
        Ok(true)
    }

    /// Inject components of a CP-symmetric amplitude, where `nCnj = nDir`.
    pub fn set_norm_components_symmetric(&mut self, dir: f64, xed: Complex64) -> Result<bool> {
        self.set_norm_components(dir, dir, xed)
    }

    fn amp_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.amp.collect_names(&mut names);
        if let Some(cnj) = &self.amp_cnj {
            cnj.collect_names(&mut names);
        }
        names
    }

    fn func_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.funcs.iter().for_each(|f| f.collect_names(&mut names));
        names
    }

    fn norm_names(&self) -> BTreeSet<String> {
        let mut names = self.amp_names();
        names.extend(self.func_names());
        names
    }

    fn all_fixed(&self, names: &BTreeSet<String>) -> bool {
        names.iter().all(|n| self.state.pars().get(n).is_some_and(Parameter::is_fixed))
    }

    fn norm_inputs_fixed(&self) -> bool {
        self.all_fixed(&self.norm_names())
    }

    fn amplitudes(&self, p: &DalitzPoint) -> Result<(Complex64, Complex64)> {
        let pars = self.state.pars();
        let a = self.amp.evaluate(&self.ps, p, pars)?;
        let cnj = self.amp_cnj.as_ref().unwrap_or(&self.amp);
        let abar = cnj.evaluate(&self.ps, &p.swapped(), pars)?;
        Ok((a, abar))
    }

    fn funcs_value(&self, p: &DalitzPoint) -> Result<f64> {
        let pars = self.state.pars();
        self.funcs.iter().try_fold(1.0, |acc, f| Ok(acc * f.evaluate(p, pars)?))
    }

    fn interference(&self) -> Result<(Complex64, f64)> {
        let pars = self.state.pars();
        let z = self.z.evaluate(pars)?;
        let kappa = match &self.kappa {
            Some(k) => k.evaluate(pars)?,
            None => 1.0,
        };
        Ok((z, kappa))
    }

    fn combine(&self, a: Complex64, abar: Complex64, f: f64) -> Result<f64> {
        let (z, kappa) = self.interference()?;
        let cross = (z * a * abar.conj()).re;
        Ok(f * (a.norm_sqr() + abar.norm_sqr() + 2.0 * kappa * cross))
    }

    fn norm_from(&self, c: &NormComponents) -> Result<f64> {
        let (z, kappa) = self.interference()?;
        let norm = c.dir + c.cnj + 2.0 * kappa * (z * c.xed).re;
        if !norm.is_finite() || norm <= 0.0 {
            return Err(Error::Degenerate(format!(
                "Decay3BodyCp: normalization is {norm} (nDir = {}, nCnj = {}, nXed = {})",
                c.dir, c.cnj, c.xed
            )));
        }
        Ok(norm)
    }

    fn integrate_components(&self) -> Result<NormComponents> {
        self.quad.integrate_dalitz(&self.ps, |m12, m13| {
            let p = DalitzPoint::from_pair(&self.ps, m12, m13);
            let (a, abar) = self.amplitudes(&p)?;
            let f = self.funcs_value(&p)?;
            Ok(NormComponents {
                dir: f * a.norm_sqr(),
                cnj: f * abar.norm_sqr(),
                xed: a * abar.conj() * f,
            })
        })
    }

    fn point(&self, vars: &[f64]) -> Result<DalitzPoint> {
        match *vars {
            [m12, m13, m23] => Ok(DalitzPoint::new(m12, m13, m23)),
            [m12, m13] => Ok(DalitzPoint::from_pair(&self.ps, m12, m13)),
            _ => Err(Error::Pdf(format!(
                "Decay3BodyCp expects 2 or 3 variables, got {}",
                vars.len()
            ))),
        }
    }

    fn normalized(&self, unnorm: f64) -> Result<f64> {
        let v = unnorm / self.norm;
        if !v.is_finite() || v < 0.0 {
            return Err(Error::Degenerate(format!("Decay3BodyCp: density is {v}")));
        }
        Ok(v)
    }

    /// Unnormalized density; zero outside the phase space.
    pub fn evaluate_unnorm(&self, msq12: f64, msq13: f64, msq23: f64) -> Result<f64> {
        if !self.ps.contains(msq12, msq13) {
            return Ok(0.0);
        }
        let p = DalitzPoint::new(msq12, msq13, msq23);
        let (a, abar) = self.amplitudes(&p)?;
        self.combine(a, abar, self.funcs_value(&p)?)
    }

    /// Unnormalized density; fails outside the phase space.
    pub fn evaluate_unnorm_checked(&self, msq12: f64, msq13: f64, msq23: f64) -> Result<f64> {
        if !self.ps.contains(msq12, msq13) {
            return Err(Error::Pdf(format!(
                "point ({msq12}, {msq13}) lies outside the phase space"
            )));
        }
        self.evaluate_unnorm(msq12, msq13, msq23)
    }
}

/// Multiply a decay model by a function, returning the combined model.
pub fn multiply(mut model: Decay3BodyCp, f: Arc<dyn DalitzFunction>) -> Result<Decay3BodyCp> {
    model.attach(f)?;
    Ok(model)
}

impl Pdf for Decay3BodyCp {
    fn state(&self) -> &ModelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ModelState {
        &mut self.state
    }

    fn cache(&mut self) -> Result<()> {
        self.fixed_amp = self.norm_inputs_fixed();
        let inputs = self.state.par_values(&self.norm_names())?;
        let valid = self.fixed_amp && self.components.as_ref().is_some_and(|c| c.inputs == inputs);
        if !valid {
            let values = self.integrate_components()?;
            log::debug!(
                "Decay3BodyCp: integrated nDir = {}, nCnj = {}, nXed = {}",
                values.dir,
                values.cnj,
                values.xed
            );
            self.components = Some(StoredComponents { values, inputs });
        }
        let values = self.components.as_ref().map(|c| c.values).unwrap_or_default();
        self.norm = self.norm_from(&values)?;

        let amp_names = self.amp_names();
        let amp_fixed = self.all_fixed(&amp_names);
        let amp_inputs = self.state.par_values(&amp_names)?;
        if self.amp_binding.as_ref().is_some_and(|b| !amp_fixed || b.inputs != amp_inputs) {
            log::debug!("Decay3BodyCp: dropping cached amplitudes");
            self.amp_binding = None;
        }
        let func_names = self.func_names();
        let func_inputs = self.state.par_values(&func_names)?;
        let funcs_fixed = self.all_fixed(&func_names);
        Binding::retain(&mut self.func_binding, funcs_fixed, &func_inputs);
        Ok(())
    }

    fn cache_complex(
        &mut self,
        data: &Dataset,
        alloc: &mut CacheAllocator,
    ) -> Result<CacheMap<Complex64>> {
        let amp_names = self.amp_names();
        if !self.all_fixed(&amp_names) {
            self.amp_binding = None;
            return Ok(CacheMap::new());
        }
        let pairs = per_entry(&*self, data, |vars| {
            let p = self.point(vars)?;
            if !self.ps.contains_point(&p) {
                return Ok((Complex64::new(0.0, 0.0), Complex64::new(0.0, 0.0)));
            }
            self.amplitudes(&p)
        })?;
        let (dir, cnj): (Vec<Complex64>, Vec<Complex64>) = pairs.into_iter().unzip();

        let prev = self.amp_binding.as_ref();
        let dir_slot = alloc.claim_complex(prev.map(|b| b.dir));
        let cnj_slot = alloc.claim_complex(prev.map(|b| b.cnj));
        log::debug!(
            "Decay3BodyCp: cached amplitudes of {} entries in complex slots {} and {}",
            data.n_entries(),
            dir_slot.index(),
            cnj_slot.index()
        );
        let inputs = self.state.par_values(&amp_names)?;
        self.amp_binding = Some(AmpBinding { dir: dir_slot, cnj: cnj_slot, inputs });
        Ok(CacheMap::from([(dir_slot.index(), dir), (cnj_slot.index(), cnj)]))
    }

    fn cache_real(&mut self, data: &Dataset, alloc: &mut CacheAllocator) -> Result<CacheMap<f64>> {
        let func_names = self.func_names();
        if self.funcs.is_empty() || !self.all_fixed(&func_names) {
            self.func_binding = None;
            return Ok(CacheMap::new());
        }
        let values = per_entry(&*self, data, |vars| self.funcs_value(&self.point(vars)?))?;
        let slot = alloc.claim_real(self.func_binding.as_ref().map(|b| b.slot));
        let inputs = self.state.par_values(&func_names)?;
        self.func_binding = Some(Binding { slot, inputs });
        Ok(CacheMap::from([(slot.index(), values)]))
    }

    fn evaluate(&self, vars: &[f64]) -> Result<f64> {
        let p = self.point(vars)?;
        self.normalized(self.evaluate_unnorm(p.msq12, p.msq13, p.msq23)?)
    }

    fn evaluate_cached(&self, vars: &[f64], row: &CacheRow<'_>) -> Result<f64> {
        let p = self.point(vars)?;
        if !self.ps.contains_point(&p) {
            return Ok(0.0);
        }
        let (a, abar) = match &self.amp_binding {
            Some(b) => (row.complex(&b.dir)?, row.complex(&b.cnj)?),
            None => self.amplitudes(&p)?,
        };
        let f = match &self.func_binding {
            Some(b) => row.real(&b.slot)?,
            None => self.funcs_value(&p)?,
        };
        self.normalized(self.combine(a, abar, f)?)
    }

    fn generate(&self, rng: &mut dyn rand::RngCore) -> Result<BTreeMap<String, f64>> {
        let max = self
            .max_pdf
            .ok_or_else(|| Error::Pdf("Decay3BodyCp::generate: maximum density not set".into()))?;
        let (lo12, hi12) = self.ps.msq12_range();
        let (lo13, hi13) = self.ps.msq13_range();
        for _ in 0..MAX_GENERATE_ATTEMPTS {
            let m12 = lo12 + (hi12 - lo12) * u01(rng);
            let m13 = lo13 + (hi13 - lo13) * u01(rng);
            if !self.ps.contains(m12, m13) {
                continue;
            }
            let p = DalitzPoint::from_pair(&self.ps, m12, m13);
            let value = self.evaluate(&[p.msq12, p.msq13, p.msq23])?;
            if value > max {
                return Err(Error::Pdf(format!(
                    "Decay3BodyCp::generate: density {value} exceeds the maximum {max}"
                )));
            }
            if u01(rng) * max < value {
                return Ok(BTreeMap::from([
                    (self.msq12_name().to_string(), p.msq12),
                    (self.msq13_name().to_string(), p.msq13),
                    (self.msq23_name().to_string(), p.msq23),
                ]));
            }
        }
        Err(Error::Computation(format!(
            "Decay3BodyCp::generate: no point accepted in {MAX_GENERATE_ATTEMPTS} attempts"
        )))
    }

    fn project(&self, var: &str, value: f64) -> Result<f64> {
        let idx = self
            .state
            .var_index(var)
            .ok_or_else(|| Error::Pdf(format!("Decay3BodyCp does not depend on '{var}'")))?;
        let ps = &self.ps;
        match idx {
            0 => {
                let (lo, hi) = ps.msq13_limits(value);
                self.quad.integrate(lo, hi, |m13| self.evaluate(&[value, m13]))
            }
            1 => {
                let (lo, hi) = ps.msq12_limits(value);
                self.quad.integrate(lo, hi, |m12| self.evaluate(&[m12, value]))
            }
            _ => {
                let (lo, hi) = ps.msq12_limits_given_msq23(value);
                self.quad.integrate(lo, hi, |m12| {
                    self.evaluate(&[m12, ps.msq_sum() - m12 - value, value])
                })
            }
        }
    }

    /// Any two invariants fix the third, so the projection is the density at that point.
    fn project2(&self, var1: &str, var2: &str, val1: f64, val2: f64) -> Result<f64> {
        let index = |var: &str| {
            self.state
                .var_index(var)
                .ok_or_else(|| Error::Pdf(format!("Decay3BodyCp does not depend on '{var}'")))
        };
        let (i, j) = (index(var1)?, index(var2)?);
        if i == j {
            return Err(Error::Pdf(format!("projection onto '{var1}' twice")));
        }
        let mut msq = [0.0; 3];
        msq[i] = val1;
        msq[j] = val2;
        msq[3 - i - j] = self.ps.msq_sum() - val1 - val2;
        if !self.ps.contains(msq[0], msq[1]) {
            return Ok(0.0);
        }
        self.evaluate(&msq)
    }

    fn entry_values(&self, data: &Dataset, entry: usize, out: &mut Vec<f64>) -> Result<()> {
        out.clear();
        let m12 = data.value(self.msq12_name(), entry)?;
        let m13 = data.value(self.msq13_name(), entry)?;
        let m23 = if data.has_column(self.msq23_name()) {
            data.value(self.msq23_name(), entry)?
        } else {
            self.ps.msq23(m12, m13)
        };
        out.extend([m12, m13, m23]);
        Ok(())
    }
}
