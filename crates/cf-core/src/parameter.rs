//! Model parameters and expressions over them.
//!
//! A model owns its parameters in a [`ParMap`]. Everything that depends on a parameter
//! (expressions, amplitude coefficients, multiplicative functions) refers to it **by name**
//! and resolves the current value against the owning model's map at evaluation time, so a
//! value set through the model is immediately visible everywhere it is used.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Add, Div, Mul, Neg, Sub};

/// A named scalar with a value, an uncertainty and a fixed/floating flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    value: f64,
    error: f64,
    fixed: bool,
    bounds: Option<(f64, f64)>,
}

impl Parameter {
    /// Create a floating parameter with an initial step/uncertainty `error`.
    pub fn new(name: impl Into<String>, value: f64, error: f64) -> Self {
        Self { name: name.into(), value, error, fixed: false, bounds: None }
    }

    /// Create a fixed parameter.
    pub fn fixed(name: impl Into<String>, value: f64) -> Self {
        Self { name: name.into(), value, error: 0.0, fixed: true, bounds: None }
    }

    /// Attach box bounds `(low, high)` used by the optimizer.
    pub fn with_bounds(mut self, low: f64, high: f64) -> Result<Self> {
        if low.is_nan() || high.is_nan() || low > high {
            return Err(Error::Validation(format!(
                "parameter '{}' has invalid bounds ({low}, {high})",
                self.name
            )));
        }
        self.bounds = Some((low, high));
        Ok(self)
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Current uncertainty.
    pub fn error(&self) -> f64 {
        self.error
    }

    /// Whether the parameter is fixed.
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Optimizer bounds, if any.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        self.bounds
    }

    /// Set the value, and the error when one is given.
    pub fn set(&mut self, value: f64, error: Option<f64>) {
        self.value = value;
        if let Some(e) = error {
            self.error = e;
        }
    }

    /// Fix the parameter at its current value.
    pub fn fix(&mut self) {
        self.fixed = true;
    }

    /// Let the parameter float.
    pub fn release(&mut self) {
        self.fixed = false;
    }
}

/// Parameters of a model keyed by name.
///
/// The name order of the map is the positional order used by `set_pars(&[f64])`.
pub type ParMap = BTreeMap<String, Parameter>;

/// Look up the current value of a parameter.
pub fn par_value(pars: &ParMap, name: &str) -> Result<f64> {
    pars.get(name)
        .map(Parameter::value)
        .ok_or_else(|| Error::Validation(format!("unknown parameter '{name}'")))
}

/// Real-valued expression over parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ParExpr {
    /// A constant.
    Const(f64),
    /// A parameter. The stored snapshot is used to register the parameter with a model;
    /// evaluation always reads the model's current value by name.
    Par(Parameter),
    /// `a + b`
    Add(Box<ParExpr>, Box<ParExpr>),
    /// `a - b`
    Sub(Box<ParExpr>, Box<ParExpr>),
    /// `a * b`
    Mul(Box<ParExpr>, Box<ParExpr>),
    /// `a / b`
    Div(Box<ParExpr>, Box<ParExpr>),
    /// `-a`
    Neg(Box<ParExpr>),
}

impl ParExpr {
    /// Evaluate the expression with the parameter values in `pars`.
    pub fn evaluate(&self, pars: &ParMap) -> Result<f64> {
        Ok(match self {
            ParExpr::Const(v) => *v,
            ParExpr::Par(p) => par_value(pars, p.name())?,
            ParExpr::Add(a, b) => a.evaluate(pars)? + b.evaluate(pars)?,
            ParExpr::Sub(a, b) => a.evaluate(pars)? - b.evaluate(pars)?,
            ParExpr::Mul(a, b) => a.evaluate(pars)? * b.evaluate(pars)?,
            ParExpr::Div(a, b) => a.evaluate(pars)? / b.evaluate(pars)?,
            ParExpr::Neg(a) => -a.evaluate(pars)?,
        })
    }

    /// Insert (a snapshot of) every referenced parameter into `out`.
    ///
    /// Parameters already present in `out` are left untouched.
    pub fn collect_parameters(&self, out: &mut ParMap) {
        match self {
            ParExpr::Const(_) => {}
            ParExpr::Par(p) => {
                out.entry(p.name().to_string()).or_insert_with(|| p.clone());
            }
            ParExpr::Add(a, b) | ParExpr::Sub(a, b) | ParExpr::Mul(a, b) | ParExpr::Div(a, b) => {
                a.collect_parameters(out);
                b.collect_parameters(out);
            }
            ParExpr::Neg(a) => a.collect_parameters(out),
        }
    }

    /// Insert the names of every referenced parameter into `out`.
    pub fn collect_names(&self, out: &mut BTreeSet<String>) {
        match self {
            ParExpr::Const(_) => {}
            ParExpr::Par(p) => {
                out.insert(p.name().to_string());
            }
            ParExpr::Add(a, b) | ParExpr::Sub(a, b) | ParExpr::Mul(a, b) | ParExpr::Div(a, b) => {
                a.collect_names(out);
                b.collect_names(out);
            }
            ParExpr::Neg(a) => a.collect_names(out),
        }
    }

    /// True iff every referenced parameter is currently fixed in `pars`.
    ///
    /// A parameter missing from `pars` counts as floating.
    pub fn is_fixed(&self, pars: &ParMap) -> bool {
        let mut names = BTreeSet::new();
        self.collect_names(&mut names);
        names.iter().all(|n| pars.get(n).is_some_and(Parameter::is_fixed))
    }
}

impl From<f64> for ParExpr {
    fn from(v: f64) -> Self {
        ParExpr::Const(v)
    }
}

impl From<Parameter> for ParExpr {
    fn from(p: Parameter) -> Self {
        ParExpr::Par(p)
    }
}

impl From<&Parameter> for ParExpr {
    fn from(p: &Parameter) -> Self {
        ParExpr::Par(p.clone())
    }
}

macro_rules! impl_binop {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl<R: Into<ParExpr>> $trait<R> for ParExpr {
            type Output = ParExpr;
            fn $method(self, rhs: R) -> ParExpr {
                ParExpr::$variant(Box::new(self), Box::new(rhs.into()))
            }
        }
    };
}

impl_binop!(Add, add, Add);
impl_binop!(Sub, sub, Sub);
impl_binop!(Mul, mul, Mul);
impl_binop!(Div, div, Div);

impl Neg for ParExpr {
    type Output = ParExpr;
    fn neg(self) -> ParExpr {
        ParExpr::Neg(Box::new(self))
    }
}
