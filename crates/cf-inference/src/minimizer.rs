//! Negative log-likelihood of a model over a dataset, and its minimization.
//!
//! The adapter owns one cache session: [`Minimizer::cache`] asks the model for its
//! per-entry sequences and freezes them into a table that every objective call reads.

use crate::optimizer::{LbfgsOptimizer, ObjectiveFunction, OptimizerConfig};
use cf_core::{Error, FitResult, Result};
use cf_pdf::{CacheAllocator, CacheRegistry, CacheRow, CacheTable, Dataset, Pdf};
use nalgebra::DMatrix;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Adapter settings.
#[derive(Debug, Clone)]
pub struct MinimizerConfig {
    /// Settings of the quasi-Newton run.
    pub optimizer: OptimizerConfig,
    /// Entries per partial sum of the likelihood.
    pub chunk_size: usize,
    /// Relative step of the finite-difference gradient.
    pub gradient_step: f64,
    /// Relative step of the finite-difference Hessian.
    pub hessian_step: f64,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerConfig::default(),
            chunk_size: 4096,
            gradient_step: 1e-5,
            hessian_step: 1e-4,
        }
    }
}

/// Unbinned maximum-likelihood fit of one model to one dataset.
pub struct Minimizer<P: Pdf> {
    model: Mutex<P>,
    data: Arc<Dataset>,
    up: Option<f64>,
    config: MinimizerConfig,
    alloc: CacheAllocator,
    table: Option<CacheTable>,
    n_calls: AtomicUsize,
}

/// Floating parameters in name order: names, values and optimizer bounds.
fn floating<P: Pdf + ?Sized>(model: &P) -> (Vec<String>, Vec<f64>, Vec<(f64, f64)>) {
    let mut names = Vec::new();
    let mut values = Vec::new();
    let mut bounds = Vec::new();
    for (name, p) in model.pars().iter().filter(|(_, p)| !p.is_fixed()) {
        names.push(name.clone());
        values.push(p.value());
        bounds.push(p.bounds().unwrap_or((f64::NEG_INFINITY, f64::INFINITY)));
    }
    (names, values, bounds)
}

impl<P: Pdf> Minimizer<P> {
    /// Adapter over `model` and `data`. `up` starts unset.
    pub fn new(model: P, data: Arc<Dataset>) -> Self {
        Self::with_config(model, data, MinimizerConfig::default())
    }

    /// Adapter with explicit settings.
    pub fn with_config(model: P, data: Arc<Dataset>, config: MinimizerConfig) -> Self {
        Self {
            model: Mutex::new(model),
            data,
            up: None,
            config,
            alloc: CacheAllocator::new(),
            table: None,
            n_calls: AtomicUsize::new(0),
        }
    }

    /// Error definition: 1.0 for 1-sigma errors, `n²` for n-sigma errors.
    pub fn set_up(&mut self, up: f64) {
        self.up = Some(up);
    }

    /// The configured `up`.
    pub fn up(&self) -> Result<f64> {
        self.up.ok_or_else(|| Error::Minimizer("up has not been set".into()))
    }

    /// The dataset being fitted.
    pub fn data(&self) -> &Dataset {
        &self.data
    }

    /// Objective calls so far.
    pub fn n_calls(&self) -> usize {
        self.n_calls.load(Ordering::Relaxed)
    }

    /// Run `f` with shared access to the model.
    pub fn with_model<R>(&self, f: impl FnOnce(&P) -> R) -> Result<R> {
        let guard = self.lock()?;
        Ok(f(&*guard))
    }

    /// Release the model.
    pub fn into_model(self) -> Result<P> {
        self.model.into_inner().map_err(|_| Error::Minimizer("model lock poisoned".into()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, P>> {
        self.model.lock().map_err(|_| Error::Minimizer("model lock poisoned".into()))
    }

    /// Populate the session cache from the model's current fixed state.
    ///
    /// Calling it again rebuilds the same slots, so it is idempotent.
    pub fn cache(&mut self) -> Result<()> {
        let model = self
            .model
            .get_mut()
            .map_err(|_| Error::Minimizer("model lock poisoned".into()))?;
        model.cache()?;
        let mut reg = CacheRegistry::for_session(&self.alloc);
        reg.merge_real(model.cache_real(&self.data, &mut self.alloc)?);
        reg.merge_complex(model.cache_complex(&self.data, &mut self.alloc)?);
        log::debug!(
            "session {}: cached {} real and {} complex sequences over {} entries",
            self.alloc.session(),
            reg.n_real(),
            reg.n_complex(),
            self.data.n_entries()
        );
        self.table = Some(reg.freeze(self.data.n_entries())?);
        Ok(())
    }

    /// `-Σ ln density` with the floating parameters (name order) set to `params`.
    pub fn nll(&self, params: &[f64]) -> Result<f64> {
        self.n_calls.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.lock()?;
        let (names, _, _) = floating(&*guard);
        if names.len() != params.len() {
            return Err(Error::Validation(format!(
                "{} values for {} floating parameters",
                params.len(),
                names.len()
            )));
        }
        for (name, &v) in names.iter().zip(params) {
            guard.set_par(name, v, None)?;
        }
        guard.cache()?;

        let model: &P = &guard;
        let data = &*self.data;
        let table = self.table.as_ref();
        let n = data.n_entries();
        let chunk = self.config.chunk_size.max(1);
        let starts: Vec<usize> = (0..n).step_by(chunk).collect();
        // Partial sums are collected in chunk order and added sequentially.
        let partials = starts
            .par_iter()
            .map(|&start| {
                let mut vars = Vec::with_capacity(model.n_vars());
                let mut sum = 0.0;
                for entry in start..(start + chunk).min(n) {
                    model.entry_values(data, entry, &mut vars)?;
                    let density = match table {
                        Some(t) => model.evaluate_cached(&vars, &t.row(entry)?)?,
                        None => model.evaluate_cached(&vars, &CacheRow::empty())?,
                    };
                    if !density.is_finite() || density <= 0.0 {
                        return Err(Error::Degenerate(format!(
                            "density {density} at entry {entry}"
                        )));
                    }
                    sum -= density.ln();
                }
                Ok(sum)
            })
            .collect::<Result<Vec<f64>>>()?;
        Ok(partials.iter().sum())
    }

    /// Minimize over the floating parameters and write the result back into the model.
    ///
    /// Covariance is `up·H⁻¹` with `H` the finite-difference Hessian of the negative
    /// log-likelihood, so `up = 1` yields 1-sigma errors.
    pub fn minimize(&mut self) -> Result<FitResult> {
        let up = self.up()?;
        self.cache()?;
        let (names, init, bounds) = floating(&*self.lock()?);
        if names.is_empty() {
            return Err(Error::Minimizer("no floating parameters".into()));
        }

        let optimizer = LbfgsOptimizer::new(self.config.optimizer.clone());
        let res = optimizer.minimize(&*self, &init, &bounds)?;
        let hessian = self.hessian(&res.parameters)?;
        let n = names.len();

        let (uncertainties, covariance): (Vec<f64>, Option<Vec<f64>>) =
            match invert_hessian(&hessian) {
                Some(cov) => {
                    let cov = cov * up;
                    let unc = (0..n).map(|i| cov[(i, i)].sqrt()).collect();
                    let cov = &cov;
                    let flat = (0..n).flat_map(|i| (0..n).map(move |j| cov[(i, j)]));
                    (unc, Some(flat.collect()))
                }
                None => {
                    log::warn!("Hessian inversion failed, using diagonal approximation");
                    let unc = (0..n).map(|i| (up / hessian[(i, i)].abs().max(1e-300)).sqrt());
                    (unc.collect(), None)
                }
            };

        let nll = self.nll(&res.parameters)?;
        {
            let mut model = self.lock()?;
            for ((name, &v), &e) in names.iter().zip(&res.parameters).zip(&uncertainties) {
                model.set_par(name, v, Some(e))?;
            }
            model.cache()?;
        }
        log::info!(
            "fit finished: nll = {nll:.6}, converged = {}, {} objective calls",
            res.converged,
            self.n_calls()
        );

        Ok(FitResult {
            names,
            parameters: res.parameters,
            uncertainties,
            covariance,
            nll,
            converged: res.converged,
            n_evaluations: self.n_calls(),
        })
    }

    /// Central-difference Hessian of the objective.
    fn hessian(&self, x: &[f64]) -> Result<DMatrix<f64>> {
        let n = x.len();
        let h: Vec<f64> = x.iter().map(|v| self.config.hessian_step * v.abs().max(1.0)).collect();
        let f0 = self.nll(x)?;
        let mut probe = x.to_vec();
        let mut at = |shifts: &[(usize, f64)]| -> Result<f64> {
            probe.copy_from_slice(x);
            for &(i, s) in shifts {
                probe[i] += s;
            }
            self.nll(&probe)
        };

        let mut hess = DMatrix::zeros(n, n);
        for i in 0..n {
            let plus = at(&[(i, h[i])])?;
            let minus = at(&[(i, -h[i])])?;
            hess[(i, i)] = (plus - 2.0 * f0 + minus) / (h[i] * h[i]);
            for j in 0..i {
                let pp = at(&[(i, h[i]), (j, h[j])])?;
                let pm = at(&[(i, h[i]), (j, -h[j])])?;
                let mp = at(&[(i, -h[i]), (j, h[j])])?;
                let mm = at(&[(i, -h[i]), (j, -h[j])])?;
                let v = (pp - pm - mp + mm) / (4.0 * h[i] * h[j]);
                hess[(i, j)] = v;
                hess[(j, i)] = v;
            }
        }
        Ok(hess)
    }
}

impl<P: Pdf> ObjectiveFunction for Minimizer<P> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        self.nll(params)
    }

    // Steps well above rounding noise of sums over many entries.
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut probe = params.to_vec();
        let mut grad = Vec::with_capacity(params.len());
        for i in 0..params.len() {
            let h = self.config.gradient_step * params[i].abs().max(1.0);
            probe[i] = params[i] + h;
            let up = self.nll(&probe)?;
            probe[i] = params[i] - h;
            let down = self.nll(&probe)?;
            probe[i] = params[i];
            grad.push((up - down) / (2.0 * h));
        }
        Ok(grad)
    }
}

/// Invert a Hessian by Cholesky, adding diagonal damping while it is not positive definite.
fn invert_hessian(hessian: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = hessian.nrows();
    let identity = DMatrix::identity(n, n);
    let scale = (0..n).map(|i| hessian[(i, i)].abs()).fold(0.0_f64, f64::max).max(1.0);

    let mut damped = hessian.clone();
    let mut damping = 0.0_f64;
    for _ in 0..10 {
        if let Some(chol) = nalgebra::linalg::Cholesky::new(damped.clone()) {
            return Some(chol.solve(&identity));
        }
        let next = if damping == 0.0 { scale * 1e-9 } else { damping * 10.0 };
        for i in 0..n {
            damped[(i, i)] += next - damping;
        }
        damping = next;
    }

    let cov = damped.lu().try_inverse()?;
    (0..n).all(|i| cov[(i, i)].is_finite() && cov[(i, i)] > 0.0).then_some(cov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cf_core::{Parameter, Variable};
    use cf_pdf::{Argus, Gauss};

    fn gauss(mu: Parameter) -> Gauss {
        Gauss::new(Variable::new("x"), mu, Parameter::fixed("sigma", 1.0)).unwrap()
    }

    fn data(xs: Vec<f64>) -> Arc<Dataset> {
        Arc::new(Dataset::from_columns(vec![("x".to_string(), xs)]).unwrap())
    }

    #[test]
    fn test_up_must_be_set() {
        let mut m = Minimizer::new(gauss(Parameter::new("mu", 0.0, 0.1)), data(vec![0.0]));
        assert!(matches!(m.up(), Err(Error::Minimizer(_))));
        assert!(matches!(m.minimize(), Err(Error::Minimizer(_))));
        m.set_up(1.0);
        assert_eq!(m.up().unwrap(), 1.0);
    }

    #[test]
    fn test_nll_matches_direct_sum() {
        let xs = vec![-1.2, 0.3, 0.8, 2.5, -0.1];
        let mut m = Minimizer::with_config(
            gauss(Parameter::new("mu", 0.0, 0.1)),
            data(xs.clone()),
            MinimizerConfig { chunk_size: 2, ..Default::default() },
        );
        m.cache().unwrap();
        let nll = m.nll(&[0.4]).unwrap();
        let g = gauss(Parameter::fixed("mu", 0.4));
        let expected: f64 = xs.iter().map(|&x| -g.evaluate_value(x).unwrap().ln()).sum();
        assert_relative_eq!(nll, expected, max_relative = 1e-12);
        assert!(m.nll(&[0.4, 1.0]).is_err());
    }

    #[test]
    fn test_cache_is_idempotent() {
        let model = gauss(Parameter::fixed("mu", 0.2));
        let mut m = Minimizer::new(model, data(vec![-0.5, 0.0, 0.7]));
        m.cache().unwrap();
        let first = m.nll(&[]).unwrap();
        m.cache().unwrap();
        assert_eq!(m.nll(&[]).unwrap(), first);
        assert_eq!(m.alloc.n_real(), 1);
    }

    #[test]
    fn test_zero_density_is_degenerate() {
        let argus = Argus::new(Variable::new("x"), Parameter::fixed("c", 5.29), 1.0).unwrap();
        let mut m = Minimizer::new(argus, data(vec![5.0, 5.3]));
        m.cache().unwrap();
        assert!(matches!(m.nll(&[]), Err(Error::Degenerate(_))));
    }

    #[test]
    fn test_unbounded_fit_from_distant_start() {
        let truth = gauss(Parameter::fixed("mu", 3.0));
        let toy = Arc::new(crate::toys::generate_dataset(&truth, 2000, 11).unwrap());
        let xs = toy.column("x").unwrap();
        let mean = xs.iter().sum::<f64>() / xs.len() as f64;

        // The first quasi-Newton step from mu = -2 overshoots by thousands of units, where
        // every density underflows to zero.
        let mut m = Minimizer::new(gauss(Parameter::new("mu", -2.0, 0.1)), Arc::clone(&toy));
        m.cache().unwrap();
        let inf = f64::INFINITY;
        let r = LbfgsOptimizer::default().minimize(&m, &[-2.0], &[(-inf, inf)]).unwrap();
        assert_relative_eq!(r.parameters[0], mean, epsilon = 1e-3);

        m.set_up(1.0);
        let fit = m.minimize().unwrap();
        assert_relative_eq!(fit.value("mu").unwrap(), mean, epsilon = 1e-3);
        let expected_err = 1.0 / 2000f64.sqrt();
        assert_relative_eq!(fit.uncertainty("mu").unwrap(), expected_err, max_relative = 0.05);
    }

    #[test]
    fn test_objective_error_fails_the_fit() {
        // 5.3 lies beyond the Argus endpoint for every value of chi.
        let chi = Parameter::new("chi", 1.0, 0.1);
        let argus = Argus::new(Variable::new("x"), Parameter::fixed("c", 5.29), chi).unwrap();
        let mut m = Minimizer::new(argus, data(vec![5.0, 5.2, 5.3]));
        m.set_up(1.0);
        match m.minimize() {
            Err(Error::Computation(msg)) => assert!(msg.contains("Numeric degeneracy"), "{msg}"),
            other => panic!("expected the fit to fail, got {other:?}"),
        }
    }

    #[test]
    fn test_hessian_inversion() {
        let h = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let cov = invert_hessian(&h).unwrap();
        let product = &h * &cov;
        assert_relative_eq!(product[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(product[(0, 1)], 0.0, epsilon = 1e-12);
    }
}
