//! # cf-core
//!
//! Core types shared by the cfit crates: the error type, observables, parameters and
//! parameter expressions, and fit results.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod parameter;
pub mod types;
pub mod variable;

pub use error::{Error, Result};
pub use parameter::{ParExpr, ParMap, Parameter, par_value};
pub use types::FitResult;
pub use variable::Variable;
