//! Variables, parameters and limits owned by a model.

use cf_core::{Error, ParMap, Parameter, Result, Variable};

/// The ordered variables and the name-keyed parameters of a model.
///
/// Variables keep their construction order, which is the positional order of
/// `set_vars` and of the value slices passed to `evaluate`. Parameters are ordered by name.
#[derive(Debug, Clone, Default)]
pub struct ModelState {
    vars: Vec<Variable>,
    pars: ParMap,
}

impl ModelState {
    /// Create a state from variables and already collected parameters.
    pub fn new(vars: Vec<Variable>, pars: ParMap) -> Result<Self> {
        for (i, v) in vars.iter().enumerate() {
            if vars[..i].iter().any(|w| w.name() == v.name()) {
                return Err(Error::Pdf(format!("variable '{}' declared twice", v.name())));
            }
        }
        Ok(Self { vars, pars })
    }

    /// Variables in declaration order.
    pub fn vars(&self) -> &[Variable] {
        &self.vars
    }

    /// Parameters keyed by name.
    pub fn pars(&self) -> &ParMap {
        &self.pars
    }

    /// Add parameters that are not yet known; existing entries keep their state.
    pub fn register(&mut self, pars: ParMap) {
        for (name, p) in pars {
            self.pars.entry(name).or_insert(p);
        }
    }

    /// Variable names in declaration order.
    pub fn var_names(&self) -> Vec<String> {
        self.vars.iter().map(|v| v.name().to_string()).collect()
    }

    /// Position of a variable.
    pub fn var_index(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.name() == name)
    }

    /// Current variable values in declaration order.
    pub fn values(&self) -> Vec<f64> {
        self.vars.iter().map(Variable::value).collect()
    }

    /// True iff every parameter is fixed.
    pub fn is_fixed(&self) -> bool {
        self.pars.values().all(Parameter::is_fixed)
    }

    /// Current values of the named parameters, in the given order.
    pub fn par_values<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Result<Vec<f64>> {
        names.into_iter().map(|n| cf_core::par_value(&self.pars, n)).collect()
    }

    /// Set every variable value positionally.
    pub fn set_vars(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.vars.len() {
            return Err(Error::Pdf(format!(
                "expected {} variable values, got {}",
                self.vars.len(),
                values.len()
            )));
        }
        for (var, &v) in self.vars.iter_mut().zip(values) {
            var.set(v, None);
        }
        Ok(())
    }

    /// Set one variable by name.
    pub fn set_var(&mut self, name: &str, value: f64, error: Option<f64>) -> Result<()> {
        let var = self
            .vars
            .iter_mut()
            .find(|v| v.name() == name)
            .ok_or_else(|| Error::Pdf(format!("unknown variable '{name}'")))?;
        var.set(value, error);
        Ok(())
    }

    /// Set every parameter value positionally, in name order.
    pub fn set_pars(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.pars.len() {
            return Err(Error::Pdf(format!(
                "expected {} parameter values, got {}",
                self.pars.len(),
                values.len()
            )));
        }
        for (par, &v) in self.pars.values_mut().zip(values) {
            par.set(v, None);
        }
        Ok(())
    }

    /// Set one parameter by name.
    pub fn set_par(&mut self, name: &str, value: f64, error: Option<f64>) -> Result<()> {
        self.par_mut(name)?.set(value, error);
        Ok(())
    }

    /// Fix a parameter at its current value.
    pub fn fix_par(&mut self, name: &str) -> Result<()> {
        self.par_mut(name)?.fix();
        Ok(())
    }

    /// Let a parameter float.
    pub fn release_par(&mut self, name: &str) -> Result<()> {
        self.par_mut(name)?.release();
        Ok(())
    }

    fn par_mut(&mut self, name: &str) -> Result<&mut Parameter> {
        self.pars.get_mut(name).ok_or_else(|| Error::Pdf(format!("unknown parameter '{name}'")))
    }
}

/// Optional truncation of a one-dimensional support.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Limits {
    /// Lower limit, if any.
    pub lower: Option<f64>,
    /// Upper limit, if any.
    pub upper: Option<f64>,
}

impl Limits {
    /// No truncation.
    pub fn none() -> Self {
        Self::default()
    }

    /// Both limits.
    pub fn between(lower: f64, upper: f64) -> Result<Self> {
        if lower.is_nan() || upper.is_nan() || lower >= upper {
            return Err(Error::Pdf(format!("invalid limits ({lower}, {upper})")));
        }
        Ok(Self { lower: Some(lower), upper: Some(upper) })
    }

    /// Whether `x` is inside the limits.
    pub fn contains(&self, x: f64) -> bool {
        self.lower.is_none_or(|lo| x >= lo) && self.upper.is_none_or(|hi| x <= hi)
    }

    /// Clip an interval to the limits.
    pub fn clip(&self, min: f64, max: f64) -> (f64, f64) {
        let lo = self.lower.map_or(min, |l| min.max(l));
        let hi = self.upper.map_or(max, |u| max.min(u));
        (lo, hi)
    }

    /// The limits as a pair, open ends mapped to infinities.
    pub fn bounds(&self) -> (f64, f64) {
        (self.lower.unwrap_or(f64::NEG_INFINITY), self.upper.unwrap_or(f64::INFINITY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ModelState {
        let pars: ParMap = [Parameter::new("b", 2.0, 0.1), Parameter::fixed("a", 1.0)]
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        ModelState::new(vec![Variable::new("y"), Variable::new("x")], pars).unwrap()
    }

    #[test]
    fn test_positional_setters_follow_declared_orders() {
        let mut s = state();
        s.set_vars(&[5.0, 6.0]).unwrap();
        assert_eq!(s.values(), vec![5.0, 6.0]);
        assert_eq!(s.var_names(), vec!["y", "x"]);

        // Parameters are positional in name order: a, b.
        s.set_pars(&[10.0, 20.0]).unwrap();
        assert_eq!(s.pars()["a"].value(), 10.0);
        assert_eq!(s.pars()["b"].value(), 20.0);
        assert!(s.set_pars(&[1.0]).is_err());
    }

    #[test]
    fn test_fix_release_and_unknown_names() {
        let mut s = state();
        assert!(!s.is_fixed());
        s.fix_par("b").unwrap();
        assert!(s.is_fixed());
        s.release_par("a").unwrap();
        assert!(!s.is_fixed());
        assert!(matches!(s.set_par("nope", 1.0, None), Err(Error::Pdf(_))));
        assert!(matches!(s.set_var("z", 1.0, None), Err(Error::Pdf(_))));
    }

    #[test]
    fn test_duplicate_variables_rejected() {
        let r = ModelState::new(vec![Variable::new("x"), Variable::new("x")], ParMap::new());
        assert!(r.is_err());
    }

    #[test]
    fn test_limits_clip() {
        let l = Limits::between(-1.0, 2.0).unwrap();
        assert_eq!(l.clip(-5.0, 1.0), (-1.0, 1.0));
        assert!(l.contains(0.0));
        assert!(!l.contains(2.5));
        assert!(Limits::between(1.0, 1.0).is_err());
        assert_eq!(Limits::none().bounds(), (f64::NEG_INFINITY, f64::INFINITY));
    }
}
