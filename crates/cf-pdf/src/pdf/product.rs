use crate::cache::{CacheAllocator, CacheMap, CacheRow};
use crate::dataset::Dataset;
use crate::pdf::Pdf;
use crate::state::ModelState;
use cf_core::{Error, ParMap, Result};
use num_complex::Complex64;
use std::collections::BTreeMap;
use std::fmt;

/// Product of independent densities over disjoint variables.
///
/// Parameters with the same name are shared: setting, fixing or releasing one through the
/// product reaches every factor that holds it.
pub struct ProductPdf {
    state: ModelState,
    parts: Vec<Box<dyn Pdf>>,
    /// Position of each factor's variables among the product's variables.
    var_maps: Vec<Vec<usize>>,
}

impl fmt::Debug for ProductPdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProductPdf")
            .field("vars", &self.state.var_names())
            .field("n_parts", &self.parts.len())
            .finish()
    }
}

impl ProductPdf {
    /// Combine factors. Their variables must be disjoint.
    pub fn new(parts: Vec<Box<dyn Pdf>>) -> Result<Self> {
        if parts.is_empty() {
            return Err(Error::Pdf("ProductPdf needs at least one factor".into()));
        }
        let mut vars = Vec::new();
        let mut pars = ParMap::new();
        for part in &parts {
            vars.extend(part.state().vars().iter().cloned());
            for (name, p) in part.pars() {
                pars.entry(name.clone()).or_insert_with(|| p.clone());
            }
        }
        let state = ModelState::new(vars, pars)?;
        let var_maps = parts
            .iter()
            .map(|part| {
                part.var_names()
                    .iter()
                    .map(|n| {
                        state.var_index(n).ok_or_else(|| Error::Pdf(format!("lost variable '{n}'")))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let mut product = Self { state, parts, var_maps };
        let names: Vec<String> = product.state.pars().keys().cloned().collect();
        for name in &names {
            product.push_par(name)?;
        }
        product.cache()?;
        Ok(product)
    }

    /// The factors, in construction order.
    pub fn parts(&self) -> &[Box<dyn Pdf>] {
        &self.parts
    }

    fn sub_values(&self, part: usize, vars: &[f64]) -> Vec<f64> {
        self.var_maps[part].iter().map(|&i| vars[i]).collect()
    }

    fn check_len(&self, vars: &[f64]) -> Result<()> {
        if vars.len() != self.n_vars() {
            return Err(Error::Pdf(format!(
                "ProductPdf expects {} variables, got {}",
                self.n_vars(),
                vars.len()
            )));
        }
        Ok(())
    }

    /// Copy the product's view of a parameter into every factor holding it.
    fn push_par(&mut self, name: &str) -> Result<()> {
        let Some(par) = self.state.pars().get(name).cloned() else {
            return Err(Error::Pdf(format!("unknown parameter '{name}'")));
        };
        for part in self.parts.iter_mut().filter(|p| p.pars().contains_key(name)) {
            part.set_par(name, par.value(), Some(par.error()))?;
            if par.is_fixed() {
                part.fix_par(name)?;
            } else {
                part.release_par(name)?;
            }
        }
        Ok(())
    }
}

impl Pdf for ProductPdf {
    fn state(&self) -> &ModelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ModelState {
        &mut self.state
    }

    fn set_vars(&mut self, vars: &[f64]) -> Result<()> {
        self.state.set_vars(vars)?;
        for i in 0..self.parts.len() {
            let sub = self.sub_values(i, vars);
            self.parts[i].set_vars(&sub)?;
        }
        Ok(())
    }

    fn set_var(&mut self, name: &str, value: f64, error: Option<f64>) -> Result<()> {
        self.state.set_var(name, value, error)?;
        for part in self.parts.iter_mut().filter(|p| p.depends_on(name)) {
            part.set_var(name, value, error)?;
        }
        Ok(())
    }

    fn set_pars(&mut self, pars: &[f64]) -> Result<()> {
        self.state.set_pars(pars)?;
        let names: Vec<String> = self.state.pars().keys().cloned().collect();
        names.iter().try_for_each(|n| self.push_par(n))
    }

    fn set_par(&mut self, name: &str, value: f64, error: Option<f64>) -> Result<()> {
        self.state.set_par(name, value, error)?;
        self.push_par(name)
    }

    fn fix_par(&mut self, name: &str) -> Result<()> {
        self.state.fix_par(name)?;
        self.push_par(name)
    }

    fn release_par(&mut self, name: &str) -> Result<()> {
        self.state.release_par(name)?;
        self.push_par(name)
    }

    fn cache(&mut self) -> Result<()> {
        self.parts.iter_mut().try_for_each(|p| p.cache())
    }

    fn cache_real(&mut self, data: &Dataset, alloc: &mut CacheAllocator) -> Result<CacheMap<f64>> {
        let mut map = CacheMap::new();
        for part in &mut self.parts {
            map.extend(part.cache_real(data, alloc)?);
        }
        Ok(map)
    }

    fn cache_complex(
        &mut self,
        data: &Dataset,
        alloc: &mut CacheAllocator,
    ) -> Result<CacheMap<Complex64>> {
        let mut map = CacheMap::new();
        for part in &mut self.parts {
            map.extend(part.cache_complex(data, alloc)?);
        }
        Ok(map)
    }

    fn evaluate(&self, vars: &[f64]) -> Result<f64> {
        self.check_len(vars)?;
        self.parts
            .iter()
            .enumerate()
            .try_fold(1.0, |acc, (i, p)| Ok(acc * p.evaluate(&self.sub_values(i, vars))?))
    }

    fn evaluate_cached(&self, vars: &[f64], row: &CacheRow<'_>) -> Result<f64> {
        self.check_len(vars)?;
        self.parts.iter().enumerate().try_fold(1.0, |acc, (i, p)| {
            Ok(acc * p.evaluate_cached(&self.sub_values(i, vars), row)?)
        })
    }

    fn generate(&self, rng: &mut dyn rand::RngCore) -> Result<BTreeMap<String, f64>> {
        let mut point = BTreeMap::new();
        for part in &self.parts {
            point.extend(part.generate(rng)?);
        }
        Ok(point)
    }

    /// Every other factor integrates to one, so the projection is the owning factor's.
    fn project(&self, var: &str, value: f64) -> Result<f64> {
        match self.parts.iter().find(|p| p.depends_on(var)) {
            Some(part) => part.project(var, value),
            None => Err(Error::Pdf(format!("ProductPdf does not depend on '{var}'"))),
        }
    }

    /// Variables of one factor project jointly; variables of two factors multiply.
    fn project2(&self, var1: &str, var2: &str, val1: f64, val2: f64) -> Result<f64> {
        if var1 == var2 {
            return Err(Error::Pdf(format!("projection onto '{var1}' twice")));
        }
        let owner = |var: &str| {
            self.parts
                .iter()
                .position(|p| p.depends_on(var))
                .ok_or_else(|| Error::Pdf(format!("ProductPdf does not depend on '{var}'")))
        };
        let (a, b) = (owner(var1)?, owner(var2)?);
        if a == b {
            return self.parts[a].project2(var1, var2, val1, val2);
        }
        Ok(self.parts[a].project(var1, val1)? * self.parts[b].project(var2, val2)?)
    }

    fn entry_values(&self, data: &Dataset, entry: usize, out: &mut Vec<f64>) -> Result<()> {
        out.clear();
        out.resize(self.n_vars(), 0.0);
        let mut buf = Vec::new();
        for (part, map) in self.parts.iter().zip(&self.var_maps) {
            part.entry_values(data, entry, &mut buf)?;
            for (&i, &v) in map.iter().zip(&buf) {
                out[i] = v;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheRegistry;
    use crate::pdf::{Argus, Gauss};
    use approx::assert_relative_eq;
    use cf_core::{Parameter, Variable};
    use rand::SeedableRng;

    fn gauss(var: &str, mu: &Parameter, sigma: f64) -> Box<dyn Pdf> {
        Box::new(Gauss::new(Variable::new(var), mu, sigma).unwrap())
    }

    #[test]
    fn test_evaluates_product_of_factors() {
        let mu = Parameter::fixed("mu", 0.5);
        let gx = Gauss::new(Variable::new("x"), &mu, 1.0).unwrap();
        let gy = Gauss::new(Variable::new("y"), &mu, 2.0).unwrap();
        let expected = gx.evaluate_value(0.1).unwrap() * gy.evaluate_value(-0.3).unwrap();
        let p = ProductPdf::new(vec![Box::new(gx), Box::new(gy)]).unwrap();
        assert_eq!(p.var_names(), vec!["x".to_string(), "y".to_string()]);
        assert_relative_eq!(p.evaluate(&[0.1, -0.3]).unwrap(), expected, max_relative = 1e-14);
        assert!(matches!(p.evaluate(&[0.1]), Err(Error::Pdf(_))));
    }

    #[test]
    fn test_shared_variable_is_rejected() {
        let mu = Parameter::fixed("mu", 0.0);
        let r = ProductPdf::new(vec![gauss("x", &mu, 1.0), gauss("x", &mu, 2.0)]);
        assert!(matches!(r, Err(Error::Pdf(_))));
    }

    #[test]
    fn test_shared_parameter_reaches_every_factor() {
        let mu = Parameter::new("mu", 0.0, 0.1);
        let mut p = ProductPdf::new(vec![gauss("x", &mu, 1.0), gauss("y", &mu, 1.0)]).unwrap();
        p.set_par("mu", 0.7, None).unwrap();
        p.cache().unwrap();
        for part in p.parts() {
            assert_eq!(part.pars()["mu"].value(), 0.7);
        }
        p.fix_par("mu").unwrap();
        assert!(p.parts().iter().all(|part| part.is_fixed()));
        assert!(p.set_par("nope", 1.0, None).is_err());
    }

    #[test]
    fn test_factors_get_distinct_cache_slots() {
        let mu = Parameter::fixed("mu", 0.0);
        let mut p = ProductPdf::new(vec![gauss("x", &mu, 1.0), gauss("y", &mu, 3.0)]).unwrap();
        let data = Dataset::from_columns(vec![
            ("x".to_string(), vec![-0.5, 0.0, 1.5]),
            ("y".to_string(), vec![2.0, -1.0, 0.25]),
        ])
        .unwrap();
        let mut alloc = CacheAllocator::new();
        let map = p.cache_real(&data, &mut alloc).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(alloc.n_real(), 2);

        let mut reg = CacheRegistry::new();
        reg.merge_real(map);
        let table = reg.freeze(data.n_entries()).unwrap();
        let mut vars = Vec::new();
        for i in 0..data.n_entries() {
            p.entry_values(&data, i, &mut vars).unwrap();
            let cached = p.evaluate_cached(&vars, &table.row(i).unwrap()).unwrap();
            assert_relative_eq!(cached, p.evaluate(&vars).unwrap(), max_relative = 1e-14);
        }
    }

    #[test]
    fn test_project_and_generate() {
        let mu = Parameter::fixed("mu", 0.0);
        let argus = Argus::new(Variable::new("mbc"), 5.29, 2.0).unwrap();
        let expected = argus.evaluate_value(5.2).unwrap();
        let p = ProductPdf::new(vec![gauss("de", &mu, 0.02), Box::new(argus)]).unwrap();
        assert_relative_eq!(p.project("mbc", 5.2).unwrap(), expected);
        assert!(matches!(p.project("q", 1.0), Err(Error::Pdf(_))));

        let joint = p.project2("mbc", "de", 5.2, 0.01).unwrap();
        let de = p.parts()[0].project("de", 0.01).unwrap();
        assert_relative_eq!(joint, expected * de, max_relative = 1e-14);
        assert!(matches!(p.project2("de", "de", 0.0, 0.0), Err(Error::Pdf(_))));
        assert!(matches!(p.project2("de", "q", 0.0, 0.0), Err(Error::Pdf(_))));

        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let point = p.generate(&mut rng).unwrap();
        assert_eq!(point.len(), 2);
        assert!(point.contains_key("de") && point.contains_key("mbc"));
    }
}
