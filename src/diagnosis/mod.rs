//! Remote diagnosis
//!
//! - [`client`]: the backend seam and the HTTPS client
//! - [`parser`]: response body to [`DiagnosisResult`](crate::types::DiagnosisResult)
//! - [`history`]: bounded result history
//! - [`orchestrator`]: the single-request state machine
//! - [`schedule`]: the periodic trigger
//! - [`windowed`]: one request per window of a whole recording

pub mod client;
pub mod history;
pub mod orchestrator;
pub mod parser;
pub mod schedule;
pub mod windowed;

pub use client::{DiagnosisBackend, DiagnosisPayload, HttpDiagnosisClient};
pub use history::DiagnosisHistory;
pub use orchestrator::{CycleOutcome, DiagnosisOrchestrator, DiagnosisState, TriggerError};
pub use parser::{parse_response, ResultParser};
pub use schedule::AutoDiagnosis;
pub use windowed::{diagnose_windows, WindowDiagnosis};
