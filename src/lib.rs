//! ECG Receiver - streaming ECG ingestion and advisory diagnosis
//!
//! The crate turns a serial stream of ECG lines into typed samples, keeps a
//! rolling window of them, derives heart rate, HRV and signal quality from the
//! window, and submits compact feature summaries to a remote inference
//! endpoint for an advisory diagnosis:
//!
//! decode → format lock → rolling buffer → feature extraction → diagnosis →
//! history / event channel
//!
//! ## Modules
//!
//! - **Ingestion**: [`decoder`], [`detector`], [`buffer`], [`session`]
//! - **Analysis**: [`features`]
//! - **Diagnosis**: [`diagnosis`] (client, parser, orchestrator, scheduler, windowed)
//! - **Surfaces**: [`monitor`], [`events`], [`config`], [`logging`]
//!
//! Not a medical device. Estimates are heuristic and diagnoses are advisory.

pub mod buffer;
pub mod config;
pub mod decoder;
pub mod detector;
pub mod diagnosis;
pub mod error;
pub mod events;
pub mod features;
pub mod logging;
pub mod monitor;
pub mod session;
pub mod types;

pub use buffer::{BufferSnapshot, RollingBuffer, SharedBuffer};
pub use config::{ApiKey, AppConfig};
pub use decoder::LineDecoder;
pub use detector::FormatDetector;
pub use diagnosis::{DiagnosisBackend, DiagnosisOrchestrator, HttpDiagnosisClient, TriggerError};
pub use error::{ConfigError, DecodeError, DiagnosisError, EcgError, FeatureError, ResultParseError};
pub use events::{EventBus, PipelineEvent};
pub use features::{FeatureExtractor, WindowFeatures};
pub use monitor::EcgMonitor;
pub use session::{IngestStats, StreamSession};
pub use types::{
    DiagnosisRequest, DiagnosisResult, FeatureSnapshot, PatientContext, Sample, Severity,
    StreamFormat, TriggerSource,
};

/// Crate version, reported by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name used in reports
pub const PRODUCER_NAME: &str = "ecg-receiver";
