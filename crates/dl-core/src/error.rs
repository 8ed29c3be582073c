use std::fmt;

/// Settings rejected by [`crate::StabilizerSettings::validate`].
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigValidationError {
    InvalidValue(String),
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValidationError::InvalidValue(msg) => write!(f, "invalid setting: {msg}"),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Failure reported by an optimizer backend.
#[derive(Clone, Debug, PartialEq)]
pub enum OptimizerError {
    /// The backend rejected the submitted graph.
    Rejected(String),
    /// The backend is not ready to take requests.
    Unavailable,
}

impl fmt::Display for OptimizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerError::Rejected(msg) => write!(f, "optimizer rejected request: {msg}"),
            OptimizerError::Unavailable => write!(f, "optimizer unavailable"),
        }
    }
}

impl std::error::Error for OptimizerError {}
