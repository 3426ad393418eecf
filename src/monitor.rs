//! Monitor facade
//!
//! [`EcgMonitor`] wires the pipeline together for one device: the shared
//! buffer, the event bus, the diagnosis orchestrator and its scheduler. Each
//! `connect` starts a fresh [`StreamSession`] on its own task; the buffer,
//! history and subscribers outlive connections.
//!
//! All constructors spawn tasks and must be called inside a tokio runtime.

use crate::buffer::SharedBuffer;
use crate::config::AppConfig;
use crate::diagnosis::{
    AutoDiagnosis, DiagnosisBackend, DiagnosisOrchestrator, HttpDiagnosisClient, TriggerError,
};
use crate::error::{EcgError, FeatureError};
use crate::events::{EventBus, PipelineEvent};
use crate::features::FeatureExtractor;
use crate::session::{IngestStats, StreamSession};
use crate::types::{FeatureSnapshot, PatientContext, QualityBreakdown, TriggerSource};
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

type IngestTask = JoinHandle<std::io::Result<IngestStats>>;

#[derive(Debug)]
pub struct EcgMonitor {
    config: AppConfig,
    buffer: SharedBuffer,
    events: EventBus,
    extractor: FeatureExtractor,
    orchestrator: DiagnosisOrchestrator,
    auto: AutoDiagnosis,
    ingest: Option<IngestTask>,
}

impl EcgMonitor {
    /// Build a monitor around any diagnosis backend.
    pub fn new(config: AppConfig, backend: Arc<dyn DiagnosisBackend>) -> Self {
        let buffer = SharedBuffer::new(config.stream.buffer_capacity);
        let events = EventBus::default();
        let extractor = FeatureExtractor::new(config.features.clone());
        let orchestrator = DiagnosisOrchestrator::new(
            backend,
            buffer.clone(),
            extractor.clone(),
            config.diagnosis.timeout(),
            config.diagnosis.history_len,
            events.clone(),
        );
        let auto = AutoDiagnosis::spawn(
            orchestrator.clone(),
            config.diagnosis.auto_interval(),
            config.diagnosis.auto_enabled,
        );

        Self {
            config,
            buffer,
            events,
            extractor,
            orchestrator,
            auto,
            ingest: None,
        }
    }

    /// Build a monitor talking to the configured HTTPS endpoint.
    ///
    /// Fails when the API key variable is unset.
    pub fn from_config(config: AppConfig) -> Result<Self, EcgError> {
        let api_key = config.diagnosis.api_key()?;
        let client = HttpDiagnosisClient::new(&config.diagnosis, api_key)?;
        Ok(Self::new(config, Arc::new(client)))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn orchestrator(&self) -> &DiagnosisOrchestrator {
        &self.orchestrator
    }

    /// Start reading a new connection.
    ///
    /// Any previous connection is dropped, an in-flight diagnosis is
    /// cancelled and the buffer is cleared.
    pub fn connect<R>(&mut self, reader: R)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        self.disconnect();
        self.buffer.clear();

        let session = StreamSession::new(&self.config.stream, self.buffer.clone(), self.events.clone());
        self.ingest = Some(tokio::spawn(session.run(reader)));
        info!(capacity = self.buffer.capacity(), "stream connected");
    }

    /// Stop reading and cancel any in-flight diagnosis. Buffered samples are kept.
    pub fn disconnect(&mut self) {
        if let Some(task) = self.ingest.take() {
            task.abort();
            info!("stream disconnected");
        }
        self.orchestrator.cancel();
    }

    pub fn is_connected(&self) -> bool {
        self.ingest.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Wait for the current connection to reach EOF.
    ///
    /// Returns `None` when nothing is connected. Cancel-safe: dropping the
    /// future keeps the connection.
    pub async fn wait(&mut self) -> Option<Result<IngestStats, EcgError>> {
        let task = self.ingest.as_mut()?;
        let joined = task.await;
        self.ingest = None;
        let result = match joined {
            Ok(stats) => stats.map_err(EcgError::from),
            Err(e) => Err(EcgError::Io(std::io::Error::new(std::io::ErrorKind::Interrupted, e))),
        };
        Some(result)
    }

    /// Features of the current buffer contents
    pub fn features(&self) -> Result<FeatureSnapshot, FeatureError> {
        self.extractor.extract(&self.buffer.snapshot())
    }

    /// Signal quality of the current buffer contents, without the duration gate
    pub fn quality(&self) -> QualityBreakdown {
        self.extractor.quality(&self.buffer.snapshot())
    }

    pub fn trigger_diagnosis(&self) -> Result<Uuid, TriggerError> {
        self.orchestrator.trigger(TriggerSource::Manual)
    }

    pub fn set_auto_diagnosis(&self, enabled: bool) {
        self.auto.set_enabled(enabled);
    }

    pub fn auto_diagnosis_enabled(&self) -> bool {
        self.auto.is_enabled()
    }

    pub fn set_patient_context(&self, context: Option<PatientContext>) {
        self.orchestrator.set_patient_context(context);
    }

    /// Stop every task owned by the monitor.
    pub fn shutdown(mut self) {
        self.auto.stop();
        self.disconnect();
        info!("monitor shut down");
    }
}

impl Drop for EcgMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.ingest.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiagnosisError;
    use crate::types::DiagnosisRequest;
    use async_trait::async_trait;

    struct NeverBackend;

    #[async_trait]
    impl DiagnosisBackend for NeverBackend {
        async fn submit(&self, _request: &DiagnosisRequest) -> Result<String, DiagnosisError> {
            std::future::pending().await
        }
    }

    fn monitor() -> EcgMonitor {
        EcgMonitor::new(AppConfig::default(), Arc::new(NeverBackend))
    }

    #[tokio::test]
    async fn test_connect_reads_to_eof() {
        let mut monitor = monitor();
        monitor.connect(&b"DATA,0,1,0,60,OK\nDATA,4,2,0,60,OK\n"[..]);
        let stats = monitor.wait().await.unwrap().unwrap();
        assert_eq!(stats.samples, 2);
        assert_eq!(monitor.buffer().len(), 2);
        assert!(monitor.wait().await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_clears_buffer() {
        let mut monitor = monitor();
        monitor.connect(&b"1\n2\n3\n"[..]);
        monitor.wait().await.unwrap().unwrap();
        assert_eq!(monitor.buffer().len(), 3);

        monitor.connect(&b"DATA,0,1,0,60,OK\n"[..]);
        monitor.wait().await.unwrap().unwrap();
        let snapshot = monitor.buffer().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.samples()[0].sequence_index, 0);
    }

    #[tokio::test]
    async fn test_reconnect_cancels_diagnosis() {
        let mut monitor = monitor();
        let lines: String = (0..2000)
            .map(|i| format!("DATA,{},{},0,75,OK\n", i * 4, if i % 200 == 100 { 900 } else { i % 5 }))
            .collect();
        monitor.connect(std::io::Cursor::new(lines.into_bytes()));
        monitor.wait().await.unwrap().unwrap();

        let id = monitor.trigger_diagnosis().unwrap();
        assert_eq!(monitor.orchestrator().in_flight(), Some(id));

        monitor.connect(&b""[..]);
        assert_eq!(monitor.orchestrator().in_flight(), None);
        assert!(monitor.orchestrator().history().is_empty());
    }

    #[tokio::test]
    async fn test_features_need_enough_signal() {
        let monitor = monitor();
        assert!(matches!(
            monitor.features(),
            Err(FeatureError::InsufficientData { samples: 0, .. })
        ));
        assert!(!monitor.auto_diagnosis_enabled());
        monitor.set_auto_diagnosis(true);
        assert!(monitor.auto_diagnosis_enabled());
        monitor.shutdown();
    }
}
