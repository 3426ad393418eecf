//! Error types for the ECG receiver
//!
//! Each pipeline layer has its own error enum so callers can tell a discarded
//! line apart from a refused diagnosis or a failed network cycle. `EcgError`
//! wraps all of them for surfaces (like the CLI) that only need to report.

use thiserror::Error;

/// Why a single raw line could not be turned into a sample.
///
/// Decode errors are recoverable: the line is logged and dropped, the stream
/// continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty line")]
    EmptyLine,

    #[error("wrong field count: expected {expected}, found {found}")]
    WrongFieldCount { expected: usize, found: usize },

    #[error("non-numeric {field} field: {value:?}")]
    NonNumericField { field: &'static str, value: String },

    #[error("unrecognized line prefix: {0:?}")]
    UnrecognizedPrefix(String),

    #[error("line longer than {limit} bytes")]
    LineTooLong { limit: usize },
}

impl DecodeError {
    /// Stable short name, used as a key in ingestion statistics.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::EmptyLine => "empty_line",
            DecodeError::WrongFieldCount { .. } => "wrong_field_count",
            DecodeError::NonNumericField { .. } => "non_numeric_field",
            DecodeError::UnrecognizedPrefix(_) => "unrecognized_prefix",
            DecodeError::LineTooLong { .. } => "line_too_long",
        }
    }
}

/// Errors from feature extraction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    #[error("insufficient data: {duration_s:.2}s buffered, {required_s:.2}s required ({samples} samples)")]
    InsufficientData {
        duration_s: f64,
        required_s: f64,
        samples: usize,
    },
}

/// Errors from one diagnosis cycle against the inference endpoint.
#[derive(Debug, Error)]
pub enum DiagnosisError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("unexpected response envelope: {0}")]
    InvalidEnvelope(String),

    #[error(transparent)]
    Parse(#[from] ResultParseError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for DiagnosisError {
    fn from(e: reqwest::Error) -> Self {
        // reqwest errors may embed the request URL but never the headers
        DiagnosisError::Network(e.to_string())
    }
}

/// Errors from turning an endpoint response into a diagnosis record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResultParseError {
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("unrecognized severity: {0:?}")]
    SeverityUnrecognized(String),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("API key environment variable {0} is not set")]
    MissingApiKey(String),
}

/// Crate-level error for callers that do not need to branch per layer.
#[derive(Debug, Error)]
pub enum EcgError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error(transparent)]
    Diagnosis(#[from] DiagnosisError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("logging setup failed: {0}")]
    Logging(String),
}
