//! Recoverable errors. Everything else that can go wrong inside a pool is a
//! programming error and panics on the spot.

use thiserror::Error;

/// Result type for configuration parsing.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration values that could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The idle limit is neither `unlimited` nor a byte size.
    #[error("invalid idle limit {value:?}: {reason}")]
    InvalidIdleLimit { value: String, reason: &'static str },

    /// A boolean switch in the environment holds something else.
    #[error("{var} has invalid value {value:?}, expected an integer or a boolean")]
    InvalidToggle { var: &'static str, value: String },
}
