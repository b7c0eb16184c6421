//! Complex decay amplitudes built from resonance terms.

use crate::phase_space::{DalitzPoint, Pair, PhaseSpace};
use cf_core::{Error, ParExpr, ParMap, Result};
use num_complex::Complex64;
use std::collections::BTreeSet;

/// Complex coefficient over parameter expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum CoefExpr {
    /// `re + i·im`
    Cartesian {
        /// Real part.
        re: ParExpr,
        /// Imaginary part.
        im: ParExpr,
    },
    /// `mag·exp(i·phase)`, phase in radians.
    Polar {
        /// Magnitude.
        mag: ParExpr,
        /// Phase.
        phase: ParExpr,
    },
}

impl CoefExpr {
    /// Cartesian coefficient.
    pub fn cartesian(re: impl Into<ParExpr>, im: impl Into<ParExpr>) -> Self {
        Self::Cartesian { re: re.into(), im: im.into() }
    }

    /// Polar coefficient.
    pub fn polar(mag: impl Into<ParExpr>, phase: impl Into<ParExpr>) -> Self {
        Self::Polar { mag: mag.into(), phase: phase.into() }
    }

    /// A constant coefficient.
    pub fn constant(value: Complex64) -> Self {
        Self::cartesian(value.re, value.im)
    }

    /// Value with the parameters in `pars`.
    pub fn evaluate(&self, pars: &ParMap) -> Result<Complex64> {
        Ok(match self {
            CoefExpr::Cartesian { re, im } => Complex64::new(re.evaluate(pars)?, im.evaluate(pars)?),
            CoefExpr::Polar { mag, phase } => {
                Complex64::from_polar(mag.evaluate(pars)?, phase.evaluate(pars)?)
            }
        })
    }

    fn parts(&self) -> [&ParExpr; 2] {
        match self {
            CoefExpr::Cartesian { re, im } => [re, im],
            CoefExpr::Polar { mag, phase } => [mag, phase],
        }
    }

    /// Register every referenced parameter in `out`.
    pub fn collect_parameters(&self, out: &mut ParMap) {
        self.parts().iter().for_each(|e| e.collect_parameters(out));
    }

    /// Names of every referenced parameter.
    pub fn collect_names(&self, out: &mut BTreeSet<String>) {
        self.parts().iter().for_each(|e| e.collect_names(out));
    }

    /// True iff every referenced parameter is fixed.
    pub fn is_fixed(&self, pars: &ParMap) -> bool {
        self.parts().iter().all(|e| e.is_fixed(pars))
    }
}

/// Kinematic dependence of a resonance term.
#[derive(Debug, Clone, PartialEq)]
pub enum Lineshape {
    /// Constant over the Dalitz plot.
    NonResonant,
    /// Relativistic Breit-Wigner with constant width in one pair.
    BreitWigner {
        /// Resonating pair.
        pair: Pair,
        /// Pole mass.
        mass: ParExpr,
        /// Total width.
        width: ParExpr,
        /// Spin, 0 or 1.
        spin: u8,
    },
}

impl Lineshape {
    /// Breit-Wigner lineshape. Spins above 1 are not supported.
    pub fn breit_wigner(
        pair: Pair,
        mass: impl Into<ParExpr>,
        width: impl Into<ParExpr>,
        spin: u8,
    ) -> Result<Self> {
        if spin > 1 {
            return Err(Error::Pdf(format!("Breit-Wigner with spin {spin} is not supported")));
        }
        Ok(Self::BreitWigner { pair, mass: mass.into(), width: width.into(), spin })
    }

    fn exprs(&self) -> Vec<&ParExpr> {
        match self {
            Lineshape::NonResonant => Vec::new(),
            Lineshape::BreitWigner { mass, width, .. } => vec![mass, width],
        }
    }

    /// Complex value at a point.
    pub fn evaluate(&self, ps: &PhaseSpace, p: &DalitzPoint, pars: &ParMap) -> Result<Complex64> {
        match self {
            Lineshape::NonResonant => Ok(Complex64::new(1.0, 0.0)),
            Lineshape::BreitWigner { pair, mass, width, spin } => {
                let m0 = mass.evaluate(pars)?;
                let g0 = width.evaluate(pars)?;
                let s = p.msq(*pair);
                let bw = Complex64::new(m0 * m0 - s, -m0 * g0).inv();
                Ok(if *spin == 1 { bw * zemach_p_wave(ps, p, *pair) } else { bw })
            }
        }
    }
}

/// Zemach angular factor of a P-wave in pair `ab` with spectator `c`:
/// `m²(bc) - m²(ac) + (M² - mc²)(ma² - mb²) / m²(ab)`.
fn zemach_p_wave(ps: &PhaseSpace, p: &DalitzPoint, pair: Pair) -> f64 {
    let (ma, mb, mc) = ps.pair_masses(pair);
    let (s_ab, s_bc, s_ac) = match pair {
        Pair::P12 => (p.msq12, p.msq23, p.msq13),
        Pair::P13 => (p.msq13, p.msq23, p.msq12),
        Pair::P23 => (p.msq23, p.msq13, p.msq12),
    };
    s_bc - s_ac + (ps.mother().powi(2) - mc * mc) * (ma * ma - mb * mb) / s_ab
}

/// One term of an amplitude.
#[derive(Debug, Clone, PartialEq)]
pub struct Resonance {
    /// Complex coefficient.
    pub coef: CoefExpr,
    /// Kinematic dependence.
    pub shape: Lineshape,
}

/// Ordered sum of resonance terms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Amplitude {
    terms: Vec<Resonance>,
}

impl Amplitude {
    /// Empty amplitude (identically zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a term.
    pub fn with_term(mut self, coef: CoefExpr, shape: Lineshape) -> Self {
        self.terms.push(Resonance { coef, shape });
        self
    }

    /// Terms in insertion order.
    pub fn terms(&self) -> &[Resonance] {
        &self.terms
    }

    /// Total amplitude at a point.
    pub fn evaluate(&self, ps: &PhaseSpace, p: &DalitzPoint, pars: &ParMap) -> Result<Complex64> {
        let mut total = Complex64::new(0.0, 0.0);
        for term in &self.terms {
            total += term.coef.evaluate(pars)? * term.shape.evaluate(ps, p, pars)?;
        }
        Ok(total)
    }

    /// Register every referenced parameter in `out`.
    pub fn collect_parameters(&self, out: &mut ParMap) {
        for t in &self.terms {
            t.coef.collect_parameters(out);
            t.shape.exprs().iter().for_each(|e| e.collect_parameters(out));
        }
    }

    /// Names of every referenced parameter.
    pub fn collect_names(&self, out: &mut BTreeSet<String>) {
        for t in &self.terms {
            t.coef.collect_names(out);
            t.shape.exprs().iter().for_each(|e| e.collect_names(out));
        }
    }

    /// True iff every referenced parameter is fixed.
    pub fn is_fixed(&self, pars: &ParMap) -> bool {
        self.terms.iter().all(|t| {
            t.coef.is_fixed(pars) && t.shape.exprs().iter().all(|e| e.is_fixed(pars))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cf_core::Parameter;

    fn collect(amp: &Amplitude) -> ParMap {
        let mut pars = ParMap::new();
        amp.collect_parameters(&mut pars);
        pars
    }

    #[test]
    fn test_breit_wigner_peaks_at_pole() {
        let ps = PhaseSpace::new(1.86484, 0.497614, 0.13957, 0.13957).unwrap();
        let bw = Lineshape::breit_wigner(Pair::P23, 0.775, 0.149, 0).unwrap();
        let pars = ParMap::new();
        let at_pole = DalitzPoint::new(1.0, 1.0, 0.775 * 0.775);
        let v = bw.evaluate(&ps, &at_pole, &pars).unwrap();
        // Purely imaginary at the pole, |BW| = 1 / (m0 Γ0).
        assert_relative_eq!(v.re, 0.0, epsilon = 1e-12);
        assert_relative_eq!(v.norm(), 1.0 / (0.775 * 0.149), epsilon = 1e-9);

        let off = DalitzPoint::new(1.0, 1.0, 0.4);
        assert!(bw.evaluate(&ps, &off, &pars).unwrap().norm() < v.norm());
        assert!(Lineshape::breit_wigner(Pair::P12, 1.0, 0.1, 2).is_err());
    }

    #[test]
    fn test_p_wave_vanishes_at_helicity_zero_for_equal_masses() {
        // With m2 = m3, the 23 P-wave factor is s13 - s12, zero on the symmetry line.
        let ps = PhaseSpace::new(1.86484, 0.497614, 0.13957, 0.13957).unwrap();
        let bw = Lineshape::breit_wigner(Pair::P23, 0.775, 0.149, 1).unwrap();
        let p = DalitzPoint::from_pair(&ps, 1.3, 1.3);
        assert_relative_eq!(bw.evaluate(&ps, &p, &ParMap::new()).unwrap().norm(), 0.0);
    }

    #[test]
    fn test_amplitude_sums_terms_and_tracks_fixed_state() {
        let ps = PhaseSpace::new(2.0, 0.1, 0.1, 0.1).unwrap();
        let mag = Parameter::new("a_mag", 2.0, 0.1);
        let amp = Amplitude::new()
            .with_term(CoefExpr::constant(Complex64::new(1.0, 0.0)), Lineshape::NonResonant)
            .with_term(CoefExpr::polar(&mag, std::f64::consts::FRAC_PI_2), Lineshape::NonResonant);
        let mut pars = collect(&amp);
        let p = DalitzPoint::from_pair(&ps, 1.0, 1.0);
        let v = amp.evaluate(&ps, &p, &pars).unwrap();
        assert_relative_eq!(v.re, 1.0, epsilon = 1e-12);
        assert_relative_eq!(v.im, 2.0, epsilon = 1e-12);

        assert!(!amp.is_fixed(&pars));
        pars.get_mut("a_mag").unwrap().fix();
        assert!(amp.is_fixed(&pars));
    }
}
