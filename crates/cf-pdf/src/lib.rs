//! # cf-pdf
//!
//! Density models for unbinned maximum-likelihood fits.
//!
//! This crate provides:
//! - A columnar [`Dataset`] of observable values.
//! - The per-dataset cache protocol: [`CacheAllocator`] hands out slot indices,
//!   [`CacheRegistry`] collects the per-entry sequences and freezes them into an
//!   entry-major [`CacheTable`].
//! - One-dimensional shapes ([`Gauss`], [`Argus`], [`DoubleCrystalBall`]).
//! - Three-body kinematics ([`PhaseSpace`]), coherent amplitudes ([`Amplitude`]) and the
//!   CP-interference decay model [`Decay3BodyCp`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod amplitude;
pub mod cache;
pub mod dataset;
pub mod function;
pub mod normalize;
pub mod pdf;
pub mod phase_space;
pub mod state;

pub use amplitude::{Amplitude, CoefExpr, Lineshape, Resonance};
pub use cache::{CacheAllocator, CacheKind, CacheMap, CacheRegistry, CacheRow, CacheSlot, CacheTable};
pub use dataset::Dataset;
pub use function::{DalitzFunction, DalitzPolynomial};
pub use normalize::{IntegrationConfig, Quadrature};
pub use pdf::{
    Argus, Decay3BodyCp, DoubleCrystalBall, Gauss, NormComponents, Pdf, ProductPdf, multiply,
};
pub use phase_space::{DalitzPoint, Pair, PhaseSpace};
pub use state::{Limits, ModelState};

#[cfg(test)]
mod tests;
