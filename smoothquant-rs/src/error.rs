//! Error types for smoothquant-rs.

use thiserror::Error;

/// Result type alias for smoothquant-rs operations.
pub type Result<T> = std::result::Result<T, SmoothQuantError>;

/// Errors that can occur while calibrating, smoothing, quantizing or evaluating.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SmoothQuantError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid YAML configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Shape mismatch in tensor operations.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Channel count of an activation scale does not match the layer it is applied to.
    #[error("dimension mismatch for {layer}: expected {expected} channels, got {actual}")]
    DimensionMismatch {
        /// Layer the scale was applied to.
        layer: String,
        /// Channel count of the layer.
        expected: usize,
        /// Channel count of the scale vector.
        actual: usize,
    },

    /// No activation scale was recorded for a layer that needs one.
    #[error("missing activation scale for layer {0}")]
    MissingActScale(String),

    /// A smoothing factor came out NaN or infinite.
    #[error("non-finite smoothing factor for {layer} at channel {channel}")]
    NonFiniteScale {
        /// Layer being smoothed.
        layer: String,
        /// Offending channel.
        channel: usize,
    },

    /// The model has already been smoothed once.
    #[error("model is already smoothed; activation scales must come from the unsmoothed model")]
    AlreadySmoothed,

    /// A float-only operation was attempted on a fake-quantized layer.
    #[error("layer {0} is already quantized")]
    AlreadyQuantized(String),

    /// Model loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Candle tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for SmoothQuantError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        Self::Template(err.to_string())
    }
}

impl From<tokenizers::Error> for SmoothQuantError {
    fn from(err: tokenizers::Error) -> Self {
        Self::Tokenizer(err.to_string())
    }
}
