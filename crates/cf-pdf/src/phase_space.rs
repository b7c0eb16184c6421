//! Three-body decay kinematics.
//!
//! A decay `M -> 1 2 3` is described by the invariant masses squared `mSq12`, `mSq13` and
//! `mSq23`; two of them are independent since their sum is fixed:
//! `mSq12 + mSq13 + mSq23 = M² + m1² + m2² + m3²`.

use cf_core::{Error, Result};

/// A pair of final-state particles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pair {
    /// Particles 1 and 2.
    P12,
    /// Particles 1 and 3.
    P13,
    /// Particles 2 and 3.
    P23,
}

/// A point of the Dalitz plot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DalitzPoint {
    /// `m²(12)`
    pub msq12: f64,
    /// `m²(13)`
    pub msq13: f64,
    /// `m²(23)`
    pub msq23: f64,
}

impl DalitzPoint {
    /// A point from all three invariants. Their consistency is the caller's responsibility.
    pub fn new(msq12: f64, msq13: f64, msq23: f64) -> Self {
        Self { msq12, msq13, msq23 }
    }

    /// A point from the two independent invariants.
    pub fn from_pair(ps: &PhaseSpace, msq12: f64, msq13: f64) -> Self {
        Self { msq12, msq13, msq23: ps.msq23(msq12, msq13) }
    }

    /// Invariant of a pair.
    pub fn msq(&self, pair: Pair) -> f64 {
        match pair {
            Pair::P12 => self.msq12,
            Pair::P13 => self.msq13,
            Pair::P23 => self.msq23,
        }
    }

    /// The CP-conjugate point, with `mSq12` and `mSq13` exchanged.
    pub fn swapped(&self) -> Self {
        Self { msq12: self.msq13, msq13: self.msq12, msq23: self.msq23 }
    }
}

/// Masses of a three-body decay and the boundary of its Dalitz plot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSpace {
    mother: f64,
    m1: f64,
    m2: f64,
    m3: f64,
}

impl PhaseSpace {
    /// Decay of a particle of mass `mother` into particles of masses `m1`, `m2`, `m3`.
    pub fn new(mother: f64, m1: f64, m2: f64, m3: f64) -> Result<Self> {
        let masses = [mother, m1, m2, m3];
        if masses.iter().any(|m| !m.is_finite() || *m < 0.0) {
            return Err(Error::Validation(format!(
                "phase space masses must be finite and non-negative, got {masses:?}"
            )));
        }
        if mother <= m1 + m2 + m3 {
            return Err(Error::Validation(format!(
                "mother mass {mother} is below threshold {}",
                m1 + m2 + m3
            )));
        }
        Ok(Self { mother, m1, m2, m3 })
    }

    /// Mother mass.
    pub fn mother(&self) -> f64 {
        self.mother
    }

    /// Daughter masses `(m1, m2, m3)`.
    pub fn daughters(&self) -> (f64, f64, f64) {
        (self.m1, self.m2, self.m3)
    }

    /// Daughter mass by index 1..=3.
    fn mass(&self, i: u8) -> f64 {
        match i {
            1 => self.m1,
            2 => self.m2,
            _ => self.m3,
        }
    }

    /// Particles `(a, b, spectator)` of a pair.
    pub(crate) fn pair_masses(&self, pair: Pair) -> (f64, f64, f64) {
        match pair {
            Pair::P12 => (self.m1, self.m2, self.m3),
            Pair::P13 => (self.m1, self.m3, self.m2),
            Pair::P23 => (self.m2, self.m3, self.m1),
        }
    }

    /// `M² + m1² + m2² + m3²`
    pub fn msq_sum(&self) -> f64 {
        self.mother.powi(2) + self.m1.powi(2) + self.m2.powi(2) + self.m3.powi(2)
    }

    /// `mSq23` implied by the other two invariants.
    pub fn msq23(&self, msq12: f64, msq13: f64) -> f64 {
        self.msq_sum() - msq12 - msq13
    }

    /// Kinematic range of a pair invariant.
    pub fn range(&self, pair: Pair) -> (f64, f64) {
        let (a, b, c) = self.pair_masses(pair);
        ((a + b).powi(2), (self.mother - c).powi(2))
    }

    /// Kinematic range of `mSq12`.
    pub fn msq12_range(&self) -> (f64, f64) {
        self.range(Pair::P12)
    }

    /// Kinematic range of `mSq13`.
    pub fn msq13_range(&self) -> (f64, f64) {
        self.range(Pair::P13)
    }

    /// Kinematic range of `mSq23`.
    pub fn msq23_range(&self) -> (f64, f64) {
        self.range(Pair::P23)
    }

    /// Range of `m²(bc)` at fixed `m²(ab)`, evaluated in the `ab` rest frame.
    fn limits(&self, msq_ab: f64, a: u8, b: u8, c: u8) -> (f64, f64) {
        let (ma, mb, mc) = (self.mass(a), self.mass(b), self.mass(c));
        let (lo, hi) = ((ma + mb).powi(2), (self.mother - mc).powi(2));
        if msq_ab.is_nan() || msq_ab < lo || msq_ab > hi || msq_ab <= 0.0 {
            return (0.0, 0.0);
        }
        let m_ab = msq_ab.sqrt();
        let e_b = (msq_ab - ma * ma + mb * mb) / (2.0 * m_ab);
        let e_c = (self.mother.powi(2) - msq_ab - mc * mc) / (2.0 * m_ab);
        let p_b = (e_b * e_b - mb * mb).max(0.0).sqrt();
        let p_c = (e_c * e_c - mc * mc).max(0.0).sqrt();
        let e_sum = (e_b + e_c).powi(2);
        (e_sum - (p_b + p_c).powi(2), e_sum - (p_b - p_c).powi(2))
    }

    /// Allowed `mSq13` range at fixed `mSq12`. Empty (`(0, 0)`) outside the `mSq12` range.
    pub fn msq13_limits(&self, msq12: f64) -> (f64, f64) {
        self.limits(msq12, 2, 1, 3)
    }

    /// Allowed `mSq12` range at fixed `mSq13`.
    pub fn msq12_limits(&self, msq13: f64) -> (f64, f64) {
        self.limits(msq13, 3, 1, 2)
    }

    /// Allowed `mSq12` range at fixed `mSq23`.
    pub fn msq12_limits_given_msq23(&self, msq23: f64) -> (f64, f64) {
        self.limits(msq23, 3, 2, 1)
    }

    /// Whether `(mSq12, mSq13)` lies inside the Dalitz plot (boundary included).
    pub fn contains(&self, msq12: f64, msq13: f64) -> bool {
        let (lo12, hi12) = self.msq12_range();
        if msq12.is_nan() || msq12 < lo12 || msq12 > hi12 {
            return false;
        }
        let (lo13, hi13) = self.msq13_limits(msq12);
        msq13 >= lo13 && msq13 <= hi13
    }

    /// Whether a point lies inside the Dalitz plot.
    pub fn contains_point(&self, p: &DalitzPoint) -> bool {
        self.contains(p.msq12, p.msq13)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // D0 -> K0s pi+ pi-
    fn d0() -> PhaseSpace {
        PhaseSpace::new(1.86484, 0.497614, 0.13957, 0.13957).unwrap()
    }

    #[test]
    fn test_rejects_below_threshold() {
        assert!(PhaseSpace::new(1.0, 0.5, 0.3, 0.3).is_err());
        assert!(PhaseSpace::new(2.0, -0.1, 0.3, 0.3).is_err());
    }

    #[test]
    fn test_limits_touch_at_range_ends() {
        let ps = d0();
        let (lo, hi) = ps.msq12_range();
        let (a, b) = ps.msq13_limits(lo);
        assert_relative_eq!(a, b, epsilon = 1e-9);
        let (a, b) = ps.msq13_limits(hi);
        assert_relative_eq!(a, b, epsilon = 1e-9);
        assert_eq!(ps.msq13_limits(hi + 0.1), (0.0, 0.0));
    }

    #[test]
    fn test_limits_are_mutually_consistent() {
        let ps = d0();
        let m12 = 1.2;
        let (lo13, hi13) = ps.msq13_limits(m12);
        let m13 = 0.5 * (lo13 + hi13);
        assert!(ps.contains(m12, m13));

        let (lo12, hi12) = ps.msq12_limits(m13);
        assert!(m12 > lo12 && m12 < hi12);

        let m23 = ps.msq23(m12, m13);
        let (lo, hi) = ps.msq12_limits_given_msq23(m23);
        assert!(m12 > lo && m12 < hi);

        // A point on the msq13 boundary is on the msq12-given-msq23 boundary too.
        let m23_edge = ps.msq23(m12, hi13);
        let (lo, hi) = ps.msq12_limits_given_msq23(m23_edge);
        assert!((m12 - lo).abs() < 1e-7 || (m12 - hi).abs() < 1e-7);
    }

    #[test]
    fn test_outside_points() {
        let ps = d0();
        assert!(!ps.contains(0.1, 1.0));
        assert!(!ps.contains(1.2, 10.0));
        let p = DalitzPoint::from_pair(&ps, 1.0, 1.5);
        assert_relative_eq!(p.msq12 + p.msq13 + p.msq23, ps.msq_sum());
        assert_eq!(p.swapped().msq12, 1.5);
    }
}
