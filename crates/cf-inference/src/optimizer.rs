//! Bounded quasi-Newton minimization.
//!
//! Thin wrapper around argmin's L-BFGS with a More–Thuente line search. Box constraints are
//! enforced by clamping every trial point and projecting the gradient at active bounds.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::{LineSearch, MoreThuenteLineSearch};
use argmin::solver::quasinewton::LBFGS;
use cf_core::{Error, Result};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Restarts after a line search stepped onto a degenerate point.
const MAX_RESTARTS: usize = 12;

/// Settings of the L-BFGS run.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Iteration cap.
    pub max_iter: u64,
    /// Gradient-norm tolerance.
    pub tol: f64,
    /// History length of the inverse-Hessian approximation.
    pub m: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 1000, tol: 1e-6, m: 10 }
    }
}

/// Outcome of one minimization.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Best point found, inside the bounds.
    pub parameters: Vec<f64>,
    /// Objective at `parameters`.
    pub fval: f64,
    /// Iterations performed.
    pub n_iter: u64,
    /// Objective evaluations requested by the solver.
    pub n_fev: usize,
    /// Gradient evaluations requested by the solver.
    pub n_gev: usize,
    /// Whether the solver reported convergence.
    pub converged: bool,
    /// Termination status as text.
    pub message: String,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimizationResult(fval={:.6}, n_iter={}, n_fev={}, n_gev={}, converged={})",
            self.fval, self.n_iter, self.n_fev, self.n_gev, self.converged
        )
    }
}

/// Function to be minimized over a flat parameter vector.
pub trait ObjectiveFunction: Send + Sync {
    /// Objective value at `params`.
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Gradient at `params`; central differences unless overridden.
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; params.len()];
        let mut probe = params.to_vec();
        for i in 0..params.len() {
            let h = 1e-7 * params[i].abs().max(1.0);
            probe[i] = params[i] + h;
            let up = self.eval(&probe)?;
            probe[i] = params[i] - h;
            let down = self.eval(&probe)?;
            probe[i] = params[i];
            grad[i] = (up - down) / (2.0 * h);
        }
        Ok(grad)
    }
}

pub(crate) fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

/// Evaluation counters and the first objective failure of a run.
#[derive(Default)]
struct Tracker {
    cost: AtomicUsize,
    grad: AtomicUsize,
    failure: Mutex<Option<Error>>,
}

impl Tracker {
    /// Remember `e` (the first failure wins) and hand argmin a copy of its message.
    fn fail(&self, e: Error) -> argmin::core::Error {
        let msg = argmin::core::Error::msg(e.to_string());
        if let Ok(mut slot) = self.failure.lock() {
            slot.get_or_insert(e);
        }
        msg
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }
}

struct Problem<'a> {
    objective: &'a dyn ObjectiveFunction,
    bounds: &'a [(f64, f64)],
    tracker: Arc<Tracker>,
}

impl CostFunction for Problem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<f64, argmin::core::Error> {
        self.tracker.cost.fetch_add(1, Ordering::Relaxed);
        self.objective.eval(&clamp_params(params, self.bounds)).map_err(|e| self.tracker.fail(e))
    }
}

impl Gradient for Problem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Self::Param) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        self.tracker.grad.fetch_add(1, Ordering::Relaxed);
        let x = clamp_params(params, self.bounds);
        let mut g = self.objective.gradient(&x).map_err(|e| self.tracker.fail(e))?;
        // Components pushing outward at an active bound are zeroed.
        for ((gi, &xi), &(lo, hi)) in g.iter_mut().zip(&x).zip(self.bounds) {
            if (xi <= lo + 1e-12 && *gi > 0.0) || (xi >= hi - 1e-12 && *gi < 0.0) {
                *gi = 0.0;
            }
        }
        Ok(g)
    }
}

/// One L-BFGS run from a fixed start point.
struct Run {
    best: Vec<f64>,
    fval: f64,
    n_iter: u64,
    status: TerminationStatus,
}

/// L-BFGS with box constraints.
#[derive(Debug, Clone, Default)]
pub struct LbfgsOptimizer {
    config: OptimizerConfig,
}

impl LbfgsOptimizer {
    /// Optimizer with the given settings.
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Settings in use.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Minimize `objective` from `init` within `bounds` (one `(lo, hi)` per parameter).
    ///
    /// A line search that steps onto a degenerate point (`Error::Degenerate`) is retried
    /// from the best point so far with a ten times shorter initial step. Any other failure
    /// of the objective, or a degenerate start point, aborts with `Error::Computation`.
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<OptimizationResult> {
        if init.len() != bounds.len() {
            return Err(Error::Validation(format!(
                "{} initial values for {} bounds",
                init.len(),
                bounds.len()
            )));
        }
        let tracker = Arc::new(Tracker::default());
        let mut start = clamp_params(init, bounds);
        let mut step = 1.0;
        let mut n_iter = 0;
        let mut restarts = 0;

        let run = loop {
            let run = self.run(objective, &start, bounds, step, &tracker)?;
            n_iter += run.n_iter;
            match tracker.take_failure() {
                None => break run,
                Some(Error::Degenerate(msg)) if restarts < MAX_RESTARTS => {
                    restarts += 1;
                    step *= 0.1;
                    log::debug!(
                        "line search hit a degenerate point ({msg}); restarting with step {step:e}"
                    );
                    start = run.best;
                }
                Some(e) => {
                    return Err(Error::Computation(format!(
                        "objective failed during minimization: {e}"
                    )));
                }
            }
        };

        Ok(OptimizationResult {
            parameters: run.best,
            fval: run.fval,
            n_iter,
            n_fev: tracker.cost.load(Ordering::Relaxed),
            n_gev: tracker.grad.load(Ordering::Relaxed),
            converged: matches!(
                run.status,
                TerminationStatus::Terminated(TerminationReason::SolverConverged)
                    | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
            ),
            message: run.status.to_string(),
        })
    }

    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        start: &[f64],
        bounds: &[(f64, f64)],
        step: f64,
        tracker: &Arc<Tracker>,
    ) -> Result<Run> {
        let problem = Problem { objective, bounds, tracker: Arc::clone(tracker) };

        // argmin's default cost tolerance is machine epsilon; likelihood scales need a
        // looser one to terminate as converged.
        let tol_cost = if self.config.tol == 0.0 { 0.0 } else { (0.1 * self.config.tol).max(1e-12) };
        let mut linesearch: MoreThuenteLineSearch<Vec<f64>, Vec<f64>, f64> =
            MoreThuenteLineSearch::new();
        linesearch
            .initial_step_length(step)
            .map_err(|e| Error::Validation(format!("invalid line search step: {e}")))?;
        let solver = LBFGS::new(linesearch, self.config.m)
            .with_tolerance_grad(self.config.tol)
            .and_then(|s| s.with_tolerance_cost(tol_cost))
            .map_err(|e| Error::Validation(format!("invalid optimizer settings: {e}")))?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.param(start.to_vec()).max_iters(self.config.max_iter))
            .run()
            .map_err(|e| match tracker.take_failure() {
                Some(failure) => Error::Computation(format!("objective failed: {failure}")),
                None => Error::Computation(format!("optimization failed: {e}")),
            })?;

        let state = res.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| Error::Computation("optimizer returned no parameters".into()))?;
        Ok(Run {
            best: clamp_params(best, bounds),
            fval: state.get_best_cost(),
            n_iter: state.get_iter(),
            status: state.get_termination_status().clone(),
        })
    }
}
