//! Parameter recovery from toy datasets.
//!
//! - Gaussian mean: estimate equals the sample mean, error `sigma/sqrt(N)` scaled by `sqrt(up)`
//! - Gaussian mean and width together
//! - Dalitz CP interference coefficient with a fixed, cached amplitude

use approx::assert_relative_eq;
use cf_core::{Parameter, Variable};
use cf_inference::{Minimizer, generate_dataset};
use cf_pdf::{
    Amplitude, CoefExpr, Decay3BodyCp, Gauss, IntegrationConfig, Lineshape, Pair, Pdf,
    PhaseSpace, Quadrature,
};
use std::sync::Arc;

fn gauss(mu: Parameter, sigma: Parameter) -> Gauss {
    Gauss::new(Variable::new("x"), mu, sigma).unwrap()
}

fn sample_mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

#[test]
fn test_gaussian_mean_recovery() {
    let n = 5000;
    let truth = gauss(Parameter::fixed("mu", 0.3), Parameter::fixed("sigma", 1.0));
    let data = Arc::new(generate_dataset(&truth, n, 42).unwrap());
    let mean = sample_mean(data.column("x").unwrap());

    let model = gauss(Parameter::new("mu", 0.0, 0.1), Parameter::fixed("sigma", 1.0));
    let mut fit = Minimizer::new(model, Arc::clone(&data));
    fit.set_up(1.0);
    let r = fit.minimize().unwrap();

    assert_eq!(r.names, vec!["mu".to_string()]);
    let mu = r.value("mu").unwrap();
    assert!((mu - mean).abs() < 1e-3, "mu = {mu}, sample mean = {mean}");
    let expected_err = 1.0 / (n as f64).sqrt();
    assert_relative_eq!(r.uncertainty("mu").unwrap(), expected_err, max_relative = 0.1);

    // The best values and errors are written back into the model.
    let (value, error) = fit.with_model(|m| (m.pars()["mu"].value(), m.pars()["mu"].error())).unwrap();
    assert_relative_eq!(value, mu);
    assert_relative_eq!(error, r.uncertainty("mu").unwrap());

    // Errors scale with sqrt(up).
    let model = gauss(Parameter::new("mu", 0.0, 0.1), Parameter::fixed("sigma", 1.0));
    let mut fit2 = Minimizer::new(model, data);
    fit2.set_up(4.0);
    let r2 = fit2.minimize().unwrap();
    assert_relative_eq!(
        r2.uncertainty("mu").unwrap(),
        2.0 * r.uncertainty("mu").unwrap(),
        max_relative = 0.05
    );
}

#[test]
fn test_gaussian_mean_and_width_recovery() {
    let truth = gauss(Parameter::fixed("mu", -1.0), Parameter::fixed("sigma", 2.0));
    let data = Arc::new(generate_dataset(&truth, 4000, 7).unwrap());
    let xs = data.column("x").unwrap();
    let mean = sample_mean(xs);
    let std = (xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / xs.len() as f64).sqrt();

    let sigma = Parameter::new("sigma", 1.0, 0.1).with_bounds(0.1, 10.0).unwrap();
    let mut fit = Minimizer::new(gauss(Parameter::new("mu", 0.0, 0.1), sigma), data);
    fit.set_up(1.0);
    let r = fit.minimize().unwrap();

    assert_relative_eq!(r.value("mu").unwrap(), mean, epsilon = 1e-3);
    assert_relative_eq!(r.value("sigma").unwrap(), std, epsilon = 1e-3);
    let corr = r.correlation(0, 1).unwrap();
    assert!(corr.abs() < 0.1, "mean and width should be nearly uncorrelated, got {corr}");
}

fn dalitz_model(z_mag: Parameter, z_ph: Parameter) -> Decay3BodyCp {
    let ps = PhaseSpace::new(1.86484, 0.497614, 0.13957, 0.13957).unwrap();
    let amp = Amplitude::new()
        .with_term(
            CoefExpr::polar(Parameter::fixed("kst_mag", 1.0), Parameter::fixed("kst_ph", 0.0)),
            Lineshape::breit_wigner(Pair::P12, 0.8917, 0.0508, 1).unwrap(),
        )
        .with_term(
            CoefExpr::polar(Parameter::fixed("rho_mag", 0.5), Parameter::fixed("rho_ph", 1.5)),
            Lineshape::breit_wigner(Pair::P23, 0.7753, 0.1491, 1).unwrap(),
        )
        .with_term(CoefExpr::cartesian(1.0, 0.0), Lineshape::NonResonant);
    let vars = [Variable::new("mSq12"), Variable::new("mSq13"), Variable::new("mSq23")];
    Decay3BodyCp::new(vars, amp, CoefExpr::polar(z_mag, z_ph), ps).unwrap()
}

/// Twice the largest density over the quadrature grid.
fn max_density(model: &Decay3BodyCp) -> f64 {
    let ps = model.phase_space();
    let q = Quadrature::new(IntegrationConfig::default()).unwrap();
    let (lo, hi) = ps.msq12_range();
    let mut max = 0.0_f64;
    for (m12, _) in q.points(lo, hi) {
        let (lo13, hi13) = ps.msq13_limits(m12);
        for (m13, _) in q.points(lo13, hi13) {
            max = max.max(model.evaluate(&[m12, m13]).unwrap());
        }
    }
    2.0 * max
}

#[test]
fn test_dalitz_interference_recovery() {
    let mut truth = dalitz_model(Parameter::fixed("z_mag", 0.6), Parameter::fixed("z_ph", 0.4));
    truth.set_max_pdf(max_density(&truth));
    let data = Arc::new(generate_dataset(&truth, 3000, 2024).unwrap());
    assert_eq!(data.n_entries(), 3000);

    let z_mag = Parameter::new("z_mag", 0.4, 0.05).with_bounds(0.0, 1.0).unwrap();
    let z_ph = Parameter::new("z_ph", 0.0, 0.1).with_bounds(-3.0, 3.0).unwrap();
    let mut fit = Minimizer::new(dalitz_model(z_mag, z_ph), data);
    fit.set_up(1.0);
    let r = fit.minimize().unwrap();

    for (name, truth) in [("z_mag", 0.6), ("z_ph", 0.4)] {
        let value = r.value(name).unwrap();
        let err = r.uncertainty(name).unwrap();
        assert!(err.is_finite() && err > 0.0, "{name}: error {err}");
        assert!((value - truth).abs() < 5.0 * err, "{name} = {value} ± {err}, truth {truth}");
    }
    // The amplitude stayed fixed, so the fit ran on cached amplitudes.
    assert!(fit.with_model(|m| m.caches_amplitudes()).unwrap());
}
