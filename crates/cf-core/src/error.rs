//! Error types for cfit

use thiserror::Error;

/// cfit error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid use of a probability density model (wrong variable cardinality,
    /// malformed limits, unknown projection variable, ...).
    #[error("Pdf error: {0}")]
    Pdf(String),

    /// A minimizer invariant was violated (e.g. `up` requested before being set).
    #[error("Minimizer error: {0}")]
    Minimizer(String),

    /// The model produced a non-finite or negative density or normalization.
    #[error("Numeric degeneracy: {0}")]
    Degenerate(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
