//! Diagnosis orchestration
//!
//! The orchestrator owns the request state machine:
//!
//! ```text
//! Idle --trigger--> Requesting --(succeeded | failed | timed out | cancelled)--> Idle
//! ```
//!
//! At most one request is outstanding. A trigger while `Requesting` is refused
//! with [`TriggerError::Busy`]; a trigger on a window that is too short is
//! refused with [`TriggerError::InsufficientData`] and leaves the state alone.
//! The network call runs on a spawned task, bounded by the configured timeout.
//! Every transition is tagged with the request id so a response that arrives
//! after cancellation is ignored.

use crate::buffer::SharedBuffer;
use crate::diagnosis::client::DiagnosisBackend;
use crate::diagnosis::history::DiagnosisHistory;
use crate::diagnosis::parser::ResultParser;
use crate::error::{DiagnosisError, FeatureError};
use crate::events::{DiagnosisEvent, DiagnosisFailure, EventBus, FailureKind, PipelineEvent};
use crate::features::FeatureExtractor;
use crate::types::{DiagnosisRequest, DiagnosisResult, PatientContext, TriggerSource};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Why a trigger was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TriggerError {
    #[error("a diagnosis request is already in flight ({in_flight})")]
    Busy { in_flight: Uuid },

    #[error(transparent)]
    InsufficientData(#[from] FeatureError),
}

/// Externally visible orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosisState {
    Idle,
    Requesting {
        request_id: Uuid,
        source: TriggerSource,
    },
}

/// How the most recent cycle ended
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Succeeded(Arc<DiagnosisResult>),
    Failed(DiagnosisFailure),
    Cancelled { request_id: Uuid },
}

impl CycleOutcome {
    pub fn request_id(&self) -> Uuid {
        match self {
            CycleOutcome::Succeeded(result) => result.request_id,
            CycleOutcome::Failed(failure) => failure.request_id,
            CycleOutcome::Cancelled { request_id } => *request_id,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CycleOutcome::Failed(f) if f.kind == FailureKind::Timeout)
    }
}

#[derive(Debug)]
enum Phase {
    Idle,
    Requesting {
        request_id: Uuid,
        source: TriggerSource,
        started: Instant,
        abort: AbortHandle,
    },
}

#[derive(Debug)]
struct Machine {
    phase: Phase,
    last_outcome: Option<CycleOutcome>,
}

struct Inner {
    backend: Arc<dyn DiagnosisBackend>,
    buffer: SharedBuffer,
    extractor: FeatureExtractor,
    timeout: Duration,
    machine: Mutex<Machine>,
    history: Mutex<DiagnosisHistory>,
    patient_context: RwLock<Option<PatientContext>>,
    events: EventBus,
    idle: Notify,
}

/// Cloneable handle to the diagnosis state machine
#[derive(Clone)]
pub struct DiagnosisOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DiagnosisOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosisOrchestrator")
            .field("state", &self.state())
            .field("history_len", &self.inner.history.lock().len())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

impl DiagnosisOrchestrator {
    pub fn new(
        backend: Arc<dyn DiagnosisBackend>,
        buffer: SharedBuffer,
        extractor: FeatureExtractor,
        timeout: Duration,
        history_len: usize,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                buffer,
                extractor,
                timeout,
                machine: Mutex::new(Machine {
                    phase: Phase::Idle,
                    last_outcome: None,
                }),
                history: Mutex::new(DiagnosisHistory::new(history_len)),
                patient_context: RwLock::new(None),
                events,
                idle: Notify::new(),
            }),
        }
    }

    /// Start a diagnosis cycle for the current buffer contents.
    ///
    /// Must be called from within a tokio runtime. Returns the request id.
    pub fn trigger(&self, source: TriggerSource) -> Result<Uuid, TriggerError> {
        if let Some(in_flight) = self.in_flight() {
            return Err(TriggerError::Busy { in_flight });
        }

        // Feature extraction happens outside the state lock
        let snapshot = self.inner.buffer.snapshot();
        let features = self.inner.extractor.extract(&snapshot)?;
        let request = DiagnosisRequest {
            id: Uuid::new_v4(),
            features,
            patient_context: self.inner.patient_context.read().clone(),
            submitted_at: Utc::now(),
            source,
        };
        let request_id = request.id;

        let mut machine = self.inner.machine.lock();
        if let Phase::Requesting { request_id: in_flight, .. } = machine.phase {
            return Err(TriggerError::Busy { in_flight });
        }

        // The task cannot complete before the abort handle is stored: completion
        // needs the machine lock held here.
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let response = tokio::time::timeout(inner.timeout, inner.backend.submit(&request)).await;
            let response = response.unwrap_or(Err(DiagnosisError::Timeout(inner.timeout)));
            inner.complete(&request, response);
        });
        machine.phase = Phase::Requesting {
            request_id,
            source,
            started: Instant::now(),
            abort: handle.abort_handle(),
        };
        info!(%request_id, ?source, "diagnosis request started");
        self.inner
            .events
            .publish(PipelineEvent::Diagnosis(DiagnosisEvent::Started { request_id, source }));
        drop(machine);
        Ok(request_id)
    }

    /// Abort the in-flight request, if any. Nothing is appended to history.
    ///
    /// Returns the cancelled request id.
    pub fn cancel(&self) -> Option<Uuid> {
        let mut machine = self.inner.machine.lock();
        let Phase::Requesting { request_id, abort, .. } =
            std::mem::replace(&mut machine.phase, Phase::Idle)
        else {
            return None;
        };
        abort.abort();
        machine.last_outcome = Some(CycleOutcome::Cancelled { request_id });
        drop(machine);

        info!(%request_id, "diagnosis request cancelled");
        self.inner
            .events
            .publish(PipelineEvent::Diagnosis(DiagnosisEvent::Cancelled { request_id }));
        self.inner.idle.notify_waiters();
        Some(request_id)
    }

    pub fn state(&self) -> DiagnosisState {
        match self.inner.machine.lock().phase {
            Phase::Idle => DiagnosisState::Idle,
            Phase::Requesting { request_id, source, .. } => {
                DiagnosisState::Requesting { request_id, source }
            }
        }
    }

    pub fn in_flight(&self) -> Option<Uuid> {
        match self.inner.machine.lock().phase {
            Phase::Requesting { request_id, .. } => Some(request_id),
            Phase::Idle => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight().is_some()
    }

    pub fn last_outcome(&self) -> Option<CycleOutcome> {
        self.inner.machine.lock().last_outcome.clone()
    }

    /// Resolve once the machine is back to `Idle`.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }

    pub fn set_patient_context(&self, context: Option<PatientContext>) {
        *self.inner.patient_context.write() = context.filter(|c| !c.is_empty());
    }

    pub fn patient_context(&self) -> Option<PatientContext> {
        self.inner.patient_context.read().clone()
    }

    /// All stored results, newest last
    pub fn history(&self) -> Vec<Arc<DiagnosisResult>> {
        self.inner.history.lock().iter().cloned().collect()
    }

    /// The `n` most recent results, newest first
    pub fn recent(&self, n: usize) -> Vec<Arc<DiagnosisResult>> {
        self.inner.history.lock().recent(n)
    }

    pub fn latest(&self) -> Option<Arc<DiagnosisResult>> {
        self.inner.history.lock().latest().cloned()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    pub fn export_history(&self) -> Vec<DiagnosisResult> {
        self.inner.history.lock().export()
    }
}

impl Inner {
    /// Finish a cycle. Ignored unless `request` is still the one in flight.
    fn complete(&self, request: &DiagnosisRequest, response: Result<String, DiagnosisError>) {
        let mut machine = self.machine.lock();
        let elapsed = match machine.phase {
            Phase::Requesting {
                request_id,
                started,
                ..
            } if request_id == request.id => started.elapsed(),
            _ => {
                warn!(request_id = %request.id, "ignoring response for stale request");
                return;
            }
        };
        machine.phase = Phase::Idle;

        let outcome = match response.and_then(|body| Ok(ResultParser::parse(&body, request)?)) {
            Ok(result) => {
                let result = Arc::new(result);
                self.history.lock().push(Arc::clone(&result));
                info!(
                    request_id = %request.id,
                    condition = %result.primary_condition,
                    severity = %result.severity,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "diagnosis completed"
                );
                if result.is_flagged() {
                    warn!(request_id = %request.id, flags = ?result.flags, "diagnosis response was corrected");
                }
                CycleOutcome::Succeeded(result)
            }
            Err(e) => {
                let kind = failure_kind(&e);
                if kind == FailureKind::Timeout {
                    warn!(request_id = %request.id, "diagnosis request timed out");
                } else {
                    error!(request_id = %request.id, error = %e, "diagnosis request failed");
                }
                CycleOutcome::Failed(DiagnosisFailure {
                    request_id: request.id,
                    kind,
                    message: e.to_string(),
                    failed_at: Utc::now(),
                })
            }
        };
        machine.last_outcome = Some(outcome.clone());
        drop(machine);

        let event = match outcome {
            CycleOutcome::Succeeded(result) => DiagnosisEvent::Completed { result },
            CycleOutcome::Failed(failure) => DiagnosisEvent::Failed(failure),
            CycleOutcome::Cancelled { request_id } => DiagnosisEvent::Cancelled { request_id },
        };
        self.events.publish(PipelineEvent::Diagnosis(event));
        self.idle.notify_waiters();
    }
}

fn failure_kind(error: &DiagnosisError) -> FailureKind {
    match error {
        DiagnosisError::Network(_) | DiagnosisError::Cancelled => FailureKind::Network,
        DiagnosisError::Status { .. } => FailureKind::Http,
        DiagnosisError::Timeout(_) => FailureKind::Timeout,
        DiagnosisError::InvalidEnvelope(_)
        | DiagnosisError::Parse(_)
        | DiagnosisError::Json(_) => FailureKind::InvalidResponse,
    }
}
