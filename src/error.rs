use thiserror::Error;

use crate::processing::StageKind;

/// Convenience result type for pipeline operations.
pub type TransformResult<T> = Result<T, TransformError>;

/// Error type returned by stages, the chain, parsers and loaders.
///
/// Recoverable per-value problems (a string that does not parse as an integer in non-strict
/// mode, an email that does not match its pattern) are never reported through this type; they
/// are absorbed into the stage statistics instead.
#[derive(Debug, Error)]
pub enum TransformError {
    /// A batch entry does not satisfy the envelope contract (`data` and `metadata` mappings).
    #[error("invalid input shape at record {index}: {message}")]
    InvalidInputShape { index: usize, message: String },

    /// A raw input unit could not be parsed and fallback records are disabled.
    #[error("parse error at record {index}: {message}")]
    Parse { index: usize, message: String },

    /// A cleaning rule failed under strict validation.
    #[error("{stage} stage: validation failed for field '{field}': {message}")]
    FieldValidation {
        stage: StageKind,
        field: String,
        message: String,
    },

    /// A type conversion failed under strict mode.
    #[error("type_conversion stage: cannot convert '{field}' value '{value}' to {target_type}")]
    Conversion {
        field: String,
        target_type: String,
        value: String,
    },

    /// A configuration value names something this crate does not support.
    #[error("unknown configuration value for '{key}': '{value}'")]
    UnknownConfigurationValue { key: String, value: String },

    /// A configuration value is well-formed but unusable (bad regex, bad strftime pattern).
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The source could not be reached or read.
    #[error("extract failed: {message}")]
    Extract { message: String },

    /// The sink rejected or failed a load.
    #[error("load failed: {message}")]
    Load { message: String },

    /// Underlying I/O error (e.g. config file not found).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV sink error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl TransformError {
    /// Whether the error comes from the envelope contract rather than a rule or the environment.
    pub fn is_shape_violation(&self) -> bool {
        matches!(self, Self::InvalidInputShape { .. })
    }
}
