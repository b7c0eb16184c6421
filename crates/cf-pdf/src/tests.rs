use crate::amplitude::{Amplitude, CoefExpr, Lineshape};
use crate::cache::{CacheAllocator, CacheRegistry, CacheTable};
use crate::dataset::Dataset;
use crate::function::DalitzPolynomial;
use crate::pdf::{Decay3BodyCp, Gauss, Pdf, ProductPdf, multiply};
use crate::phase_space::{Pair, PhaseSpace};
use approx::assert_relative_eq;
use cf_core::{Parameter, Variable};
use std::sync::Arc;

fn d0() -> PhaseSpace {
    PhaseSpace::new(1.86484, 0.497614, 0.13957, 0.13957).unwrap()
}

fn decay() -> Decay3BodyCp {
    let amp = Amplitude::new()
        .with_term(
            CoefExpr::polar(Parameter::fixed("kst_mag", 1.0), Parameter::fixed("kst_ph", 0.0)),
            Lineshape::breit_wigner(Pair::P12, 0.8917, 0.0508, 1).unwrap(),
        )
        .with_term(
            CoefExpr::polar(Parameter::fixed("rho_mag", 0.4), Parameter::fixed("rho_ph", 2.0)),
            Lineshape::breit_wigner(Pair::P23, 0.7753, 0.1491, 1).unwrap(),
        )
        .with_term(CoefExpr::cartesian(1.5, 0.0), Lineshape::NonResonant);
    let z = CoefExpr::polar(Parameter::new("z_mag", 0.6, 0.05), Parameter::new("z_ph", 0.4, 0.1));
    let vars = [Variable::new("mSq12"), Variable::new("mSq13"), Variable::new("mSq23")];
    let model = Decay3BodyCp::new(vars, amp, z, d0()).unwrap();
    let eff = DalitzPolynomial::new(1.0, 1.0)
        .with_term(0, 0, 1.0)
        .with_term(1, 0, Parameter::fixed("eff_x", 0.1));
    multiply(model, Arc::new(eff)).unwrap()
}

/// Points on a grid inside the Dalitz plot, without the `mSq23` column.
fn dalitz_grid(ps: &PhaseSpace) -> Dataset {
    let (lo, hi) = ps.msq12_range();
    let (mut m12s, mut m13s) = (Vec::new(), Vec::new());
    for i in 1..12 {
        let m12 = lo + (hi - lo) * i as f64 / 12.0;
        let (lo13, hi13) = ps.msq13_limits(m12);
        for j in 1..5 {
            m12s.push(m12);
            m13s.push(lo13 + (hi13 - lo13) * j as f64 / 5.0);
        }
    }
    Dataset::from_columns(vec![("mSq12".to_string(), m12s), ("mSq13".to_string(), m13s)]).unwrap()
}

fn fill(model: &mut dyn Pdf, data: &Dataset, alloc: &mut CacheAllocator) -> CacheTable {
    let mut reg = CacheRegistry::for_session(alloc);
    reg.merge_real(model.cache_real(data, alloc).unwrap());
    reg.merge_complex(model.cache_complex(data, alloc).unwrap());
    reg.freeze(data.n_entries()).unwrap()
}

fn assert_cached_matches(model: &dyn Pdf, data: &Dataset, table: &CacheTable) {
    let mut vars = Vec::new();
    for i in 0..data.n_entries() {
        model.entry_values(data, i, &mut vars).unwrap();
        let cached = model.evaluate_cached(&vars, &table.row(i).unwrap()).unwrap();
        assert_relative_eq!(cached, model.evaluate(&vars).unwrap(), max_relative = 1e-12);
    }
}

#[test]
fn test_decay_cached_evaluation_matches_direct() {
    let mut model = decay();
    let data = dalitz_grid(model.phase_space());
    let mut alloc = CacheAllocator::new();
    let table = fill(&mut model, &data, &mut alloc);

    assert!(model.caches_amplitudes());
    assert_eq!(alloc.n_complex(), 2);
    assert_eq!(alloc.n_real(), 1);
    assert_cached_matches(&model, &data, &table);

    // Only the interference coefficient floats: cached amplitudes stay valid.
    model.set_par("z_ph", -1.1, None).unwrap();
    model.cache().unwrap();
    assert!(model.caches_amplitudes());
    assert_cached_matches(&model, &data, &table);
}

#[test]
fn test_floating_amplitude_disables_cached_path() {
    let mut model = decay();
    let data = dalitz_grid(model.phase_space());
    let mut alloc = CacheAllocator::new();
    let table = fill(&mut model, &data, &mut alloc);

    model.release_par("rho_mag").unwrap();
    model.set_par("rho_mag", 0.9, None).unwrap();
    model.cache().unwrap();
    assert!(!model.caches_amplitudes());
    assert_cached_matches(&model, &data, &table);
}

#[test]
fn test_recache_reuses_slots_within_session() {
    let mut model = decay();
    let data = dalitz_grid(model.phase_space());
    let mut alloc = CacheAllocator::new();
    let first = model.cache_complex(&data, &mut alloc).unwrap();
    let second = model.cache_complex(&data, &mut alloc).unwrap();
    assert_eq!(first.keys().collect::<Vec<_>>(), second.keys().collect::<Vec<_>>());
    assert_eq!(alloc.n_complex(), 2);

    // A new session numbers slots from zero again.
    let mut fresh = CacheAllocator::new();
    let table = fill(&mut model, &data, &mut fresh);
    assert_eq!(fresh.n_complex(), 2);
    assert_cached_matches(&model, &data, &table);
}

#[test]
fn test_product_of_decay_and_gauss_uses_disjoint_slots() {
    let decay = decay();
    let ps = *decay.phase_space();
    let gauss = Gauss::new(Variable::new("de"), 0.0, 0.02).unwrap();
    let mut product = ProductPdf::new(vec![Box::new(decay), Box::new(gauss)]).unwrap();
    assert_eq!(product.n_vars(), 4);

    let grid = dalitz_grid(&ps);
    let n = grid.n_entries();
    let de: Vec<f64> = (0..n).map(|i| -0.05 + 0.1 * i as f64 / n as f64).collect();
    let mut columns: Vec<(String, Vec<f64>)> = grid
        .column_names()
        .iter()
        .map(|c| (c.clone(), grid.column(c).unwrap().to_vec()))
        .collect();
    columns.push(("de".to_string(), de));
    let data = Dataset::from_columns(columns).unwrap();

    let mut alloc = CacheAllocator::new();
    let table = fill(&mut product, &data, &mut alloc);
    assert_eq!(alloc.n_real(), 2);
    assert_eq!(alloc.n_complex(), 2);
    assert_cached_matches(&product, &data, &table);
}

#[test]
fn test_missing_msq23_is_derived() {
    let model = decay();
    let ps = *model.phase_space();
    let data = dalitz_grid(&ps);
    let mut vars = Vec::new();
    model.entry_values(&data, 3, &mut vars).unwrap();
    assert_eq!(vars.len(), 3);
    assert_relative_eq!(vars[2], ps.msq23(vars[0], vars[1]), epsilon = 1e-15);
}

#[test]
fn test_stale_slot_of_previous_session_is_not_read() {
    let data = Dataset::from_columns(vec![("x".to_string(), vec![-0.3, 0.1, 0.8])]).unwrap();
    let mut old = Gauss::new(Variable::new("x"), 0.0, 1.0).unwrap();
    fill(&mut old, &data, &mut CacheAllocator::new());

    // A different model takes slot 0 of a new session while `old` still holds slot 0 of the
    // previous one.
    let mut other = Gauss::new(Variable::new("x"), 0.5, 2.0).unwrap();
    let table = fill(&mut other, &data, &mut CacheAllocator::new());
    let row = table.row(0).unwrap();
    assert!(old.evaluate_cached(&[-0.3], &row).is_err());
    let direct = other.evaluate(&[-0.3]).unwrap();
    assert_relative_eq!(other.evaluate_cached(&[-0.3], &row).unwrap(), direct);
}

#[test]
fn test_shapes_have_no_two_variable_projection() {
    let gauss = Gauss::new(Variable::new("x"), 0.0, 1.0).unwrap();
    assert!(matches!(gauss.project2("x", "y", 0.0, 0.0), Err(cf_core::Error::Pdf(_))));
}
