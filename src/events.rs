//! Pipeline events
//!
//! Observers (a UI, the CLI, a log sink) subscribe to an [`EventBus`] and
//! receive every decoded sample, format lock, device message and diagnosis
//! state change. Publishing never blocks the ingestion path: slow
//! subscribers lag and miss events instead.

use crate::types::{DeviceMessage, DiagnosisResult, Sample, StreamFormat, TriggerSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PipelineEvent {
    Sample(Arc<Sample>),
    FormatLocked(StreamFormat),
    Device(DeviceMessage),
    Diagnosis(DiagnosisEvent),
}

/// Diagnosis cycle transitions
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DiagnosisEvent {
    Started {
        request_id: Uuid,
        source: TriggerSource,
    },
    Completed {
        result: Arc<DiagnosisResult>,
    },
    Failed(DiagnosisFailure),
    Cancelled {
        request_id: Uuid,
    },
}

/// Coarse failure category shown to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Http,
    InvalidResponse,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisFailure {
    pub request_id: Uuid,
    pub kind: FailureKind,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

/// Broadcast channel for [`PipelineEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Send to all current subscribers. Having none is not an error.
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
