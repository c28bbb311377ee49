use thiserror::Error;

/// Configuration errors.
///
/// Raised while loading or validating controller configuration and while
/// binding a configuration to a concrete robot model. None of these reach the
/// per-tick control path.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid bounds for {field}: min {min} > max {max} at index {index}")]
    InvertedBounds {
        field: String,
        index: usize,
        min: f64,
        max: f64,
    },

    #[error("Length mismatch for {field}: expected {expected}, got {got}")]
    LengthMismatch {
        field: String,
        expected: usize,
        got: usize,
    },

    #[error("Unknown body: {0}")]
    UnknownBody(String),

    #[error("Unknown joint: {0}")]
    UnknownJoint(String),

    #[error("Incompatible configuration: {0}")]
    Incompatible(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}
