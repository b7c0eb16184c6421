//! # cf-inference
//!
//! Unbinned maximum-likelihood fitting for cfit models.
//!
//! This crate provides:
//! - [`Minimizer`], the adapter between a [`cf_pdf::Pdf`] with its dataset and the optimizer,
//!   owning the per-dataset cache session.
//! - A bounded L-BFGS optimizer over any [`ObjectiveFunction`].
//! - Toy dataset generation.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Likelihood adapter, minimization and covariance estimation.
pub mod minimizer;
/// Generic numerical optimizer (argmin L-BFGS backend).
pub mod optimizer;
/// Toy dataset generation.
pub mod toys;

pub use minimizer::{Minimizer, MinimizerConfig};
pub use optimizer::{LbfgsOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use toys::{generate_dataset, generate_toys};
