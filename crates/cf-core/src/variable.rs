//! Observables.

use serde::{Deserialize, Serialize};

/// A named continuous observable with its current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    name: String,
    value: f64,
    error: f64,
}

impl Variable {
    /// Create a variable with value and error zero.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), value: 0.0, error: 0.0 }
    }

    /// Create a variable with a value.
    pub fn with_value(name: impl Into<String>, value: f64) -> Self {
        Self { name: name.into(), value, error: 0.0 }
    }

    /// Variable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Current uncertainty.
    pub fn error(&self) -> f64 {
        self.error
    }

    /// Set the value, and the error when one is given.
    pub fn set(&mut self, value: f64, error: Option<f64>) {
        self.value = value;
        if let Some(e) = error {
            self.error = e;
        }
    }
}
