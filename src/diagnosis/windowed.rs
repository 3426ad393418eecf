//! Diagnosis of a whole recording, one request per analysis window
//!
//! Runs outside the orchestrator: windows are submitted one after another,
//! each with its own timeout, and nothing is written to history.

use crate::diagnosis::client::DiagnosisBackend;
use crate::diagnosis::parser::parse_response;
use crate::error::{DiagnosisError, EcgError};
use crate::features::WindowFeatures;
use crate::types::{DiagnosisRequest, DiagnosisResult, PatientContext, TriggerSource};
use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Pause between consecutive window submissions
const WINDOW_PAUSE: Duration = Duration::from_millis(100);

/// Diagnosis outcome for one window
#[derive(Debug)]
pub struct WindowDiagnosis {
    pub window: usize,
    pub start_sample: usize,
    pub end_sample: usize,
    pub outcome: Result<DiagnosisResult, EcgError>,
}

/// Submit every window that has features, in order.
///
/// Windows whose extraction failed are reported with that error and are not
/// submitted.
pub async fn diagnose_windows(
    backend: &dyn DiagnosisBackend,
    windows: Vec<WindowFeatures>,
    patient_context: Option<PatientContext>,
    timeout: Duration,
) -> Vec<WindowDiagnosis> {
    let mut results = Vec::with_capacity(windows.len());
    let mut submitted_any = false;

    for window in windows {
        let outcome = match window.result {
            Err(e) => Err(EcgError::from(e)),
            Ok(features) => {
                if submitted_any {
                    tokio::time::sleep(WINDOW_PAUSE).await;
                }
                submitted_any = true;

                let request = DiagnosisRequest {
                    id: Uuid::new_v4(),
                    features,
                    patient_context: patient_context.clone(),
                    submitted_at: Utc::now(),
                    source: TriggerSource::Manual,
                };
                submit_one(backend, &request, timeout).await
            }
        };

        match &outcome {
            Ok(result) => info!(
                window = window.window,
                condition = %result.primary_condition,
                severity = %result.severity,
                "window diagnosed"
            ),
            Err(e) => warn!(window = window.window, error = %e, "window not diagnosed"),
        }
        results.push(WindowDiagnosis {
            window: window.window,
            start_sample: window.start_sample,
            end_sample: window.end_sample,
            outcome,
        });
    }
    results
}

async fn submit_one(
    backend: &dyn DiagnosisBackend,
    request: &DiagnosisRequest,
    timeout: Duration,
) -> Result<DiagnosisResult, EcgError> {
    let body = tokio::time::timeout(timeout, backend.submit(request))
        .await
        .unwrap_or(Err(DiagnosisError::Timeout(timeout)))?;
    let result = parse_response(&body, request).map_err(DiagnosisError::from)?;
    Ok(result)
}
