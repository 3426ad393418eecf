//! Diagnosis scenarios against fake and local HTTP endpoints

use async_trait::async_trait;
use chrono::Utc;
use ecg_receiver::config::{ApiKey, DiagnosisConfig, EndpointProtocol};
use ecg_receiver::diagnosis::{parse_response, CycleOutcome, DiagnosisBackend};
use ecg_receiver::events::{DiagnosisEvent, PipelineEvent};
use ecg_receiver::types::{QualityBreakdown, ResultFlag, VoltageStats};
use ecg_receiver::{
    AppConfig, DiagnosisError, DiagnosisRequest, EcgMonitor, FeatureSnapshot,
    HttpDiagnosisClient, PatientContext, Severity, TriggerSource,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

fn request() -> DiagnosisRequest {
    DiagnosisRequest {
        id: Uuid::new_v4(),
        features: FeatureSnapshot {
            heart_rate_bpm: Some(64.0),
            peak_indices: vec![40, 274, 508],
            rr_intervals_ms: vec![936.0, 936.0],
            voltage: VoltageStats::default(),
            hrv: None,
            quality: QualityBreakdown::default(),
            quality_score: 0.93,
            sample_count: 2000,
            duration_s: 7.996,
            sample_rate_hz: 250.0,
            raw_excerpt: vec![300.0, 301.0, 1500.0],
        },
        patient_context: Some(PatientContext {
            age: Some(52),
            gender: Some("female".to_string()),
            symptoms: None,
        }),
        submitted_at: Utc::now(),
        source: TriggerSource::Manual,
    }
}

#[test]
fn test_extreme_severity_defaults_to_moderate_and_flags() {
    let body = r#"{
        "primary_diagnosis": "Sinus bradycardia",
        "secondary_diagnoses": ["Athletic heart"],
        "severity": "extreme",
        "confidence": 0.7,
        "findings": ["Heart rate 64 bpm"],
        "recommendations": ["Routine follow-up"]
    }"#;
    let result = parse_response(body, &request()).unwrap();

    assert_eq!(result.severity, Severity::Moderate);
    assert!(result.is_flagged());
    assert_eq!(
        result.flags,
        vec![ResultFlag::SeverityUnrecognized {
            raw: "extreme".to_string()
        }]
    );
    assert_eq!(result.ranked_conditions(), vec!["Sinus bradycardia", "Athletic heart"]);
}

/// Serve one canned HTTP response and hand back the raw request text
async fn serve_once(status: &'static str, body: String) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            raw.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= header_end + 4 + content_length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }

        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&raw).to_string()
    });

    (format!("http://{addr}/v1/chat/completions"), handle)
}

fn client(endpoint: String, protocol: EndpointProtocol) -> HttpDiagnosisClient {
    let config = DiagnosisConfig {
        endpoint,
        protocol,
        ..Default::default()
    };
    HttpDiagnosisClient::new(&config, ApiKey::new("sk-integration")).unwrap()
}

#[tokio::test]
async fn test_chat_completions_round_trip() {
    let content = "```json\n{\"primary_diagnosis\": \"Normal sinus rhythm\", \"severity\": \"low\", \"confidence\": 0.95}\n```";
    let envelope = serde_json::json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }]
    })
    .to_string();
    let (endpoint, server) = serve_once("200 OK", envelope).await;

    let req = request();
    let body = client(endpoint, EndpointProtocol::ChatCompletions)
        .submit(&req)
        .await
        .unwrap();
    let result = parse_response(&body, &req).unwrap();
    assert_eq!(result.primary_condition, "Normal sinus rhythm");
    assert_eq!(result.severity, Severity::Low);

    let raw_request = server.await.unwrap();
    assert!(raw_request.starts_with("POST /v1/chat/completions"));
    assert!(raw_request
        .to_ascii_lowercase()
        .contains("authorization: bearer sk-integration"));
    assert!(raw_request.contains("gemini-2.5-flash-preview-04-17"));
    assert!(raw_request.contains("rr_intervals"));
}

#[tokio::test]
async fn test_direct_protocol_sends_feature_payload() {
    let (endpoint, server) = serve_once(
        "200 OK",
        r#"{"primary_diagnosis": "Sinus bradycardia", "severity": "moderate", "confidence": 0.8}"#
            .to_string(),
    )
    .await;

    let body = client(endpoint, EndpointProtocol::Direct)
        .submit(&request())
        .await
        .unwrap();
    assert!(body.contains("Sinus bradycardia"));

    let raw_request = server.await.unwrap();
    let payload_start = raw_request.find("\r\n\r\n").unwrap() + 4;
    let payload: serde_json::Value = serde_json::from_str(&raw_request[payload_start..]).unwrap();
    assert_eq!(payload["heart_rate"], 64.0);
    assert_eq!(payload["peak_count"], 3);
    assert_eq!(payload["quality_score"], 0.93);
    assert_eq!(payload["raw_data_sample"].as_array().map(Vec::len), Some(3));
    assert_eq!(payload["patient_context"]["gender"], "female");
}

#[tokio::test]
async fn test_http_error_status() {
    let (endpoint, server) = serve_once("503 Service Unavailable", "overloaded".to_string()).await;

    let err = client(endpoint, EndpointProtocol::Direct)
        .submit(&request())
        .await
        .unwrap_err();
    match err {
        DiagnosisError::Status { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "overloaded");
        }
        other => panic!("unexpected error {other:?}"),
    }
    server.await.unwrap();
}

struct ScriptedBackend(&'static str);

#[async_trait]
impl DiagnosisBackend for ScriptedBackend {
    async fn submit(&self, _request: &DiagnosisRequest) -> Result<String, DiagnosisError> {
        Ok(self.0.to_string())
    }
}

fn recording() -> String {
    (0..2000u32)
        .map(|i| {
            let ecg = if i % 200 == 100 { 1500 } else { 300 + (i % 11) };
            format!("DATA,{},{},0,75,OK\n", i * 4, ecg)
        })
        .collect()
}

#[tokio::test]
async fn test_monitor_diagnosis_cycle_publishes_events() {
    let backend = ScriptedBackend(
        r#"{"primary_diagnosis": "Normal sinus rhythm", "severity": "low", "confidence": 0.9, "findings": ["Regular rhythm"]}"#,
    );
    let mut monitor = EcgMonitor::new(AppConfig::default(), Arc::new(backend));
    monitor.connect(std::io::Cursor::new(recording().into_bytes()));
    monitor.wait().await.unwrap().unwrap();

    // Subscribed after ingestion so sample events do not crowd the channel
    let mut events = monitor.subscribe();

    let id = monitor.trigger_diagnosis().unwrap();
    monitor.orchestrator().wait_idle().await;

    let history = monitor.orchestrator().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].request_id, id);
    assert!(matches!(
        monitor.orchestrator().last_outcome(),
        Some(CycleOutcome::Succeeded(_))
    ));

    let mut started = false;
    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PipelineEvent::Diagnosis(DiagnosisEvent::Started { request_id, source }) => {
                assert_eq!(request_id, id);
                assert_eq!(source, TriggerSource::Manual);
                started = true;
            }
            PipelineEvent::Diagnosis(DiagnosisEvent::Completed { result }) => {
                assert_eq!(result.request_id, id);
                completed = true;
            }
            _ => {}
        }
    }
    assert!(started && completed);
    monitor.shutdown();
}

#[tokio::test]
async fn test_short_recording_refuses_trigger() {
    let mut monitor = EcgMonitor::new(AppConfig::default(), Arc::new(ScriptedBackend("{}")));
    monitor.connect(&b"DATA,0,1,0,60,OK\nDATA,4,2,0,60,OK\nDATA,8,3,0,60,OK\n"[..]);
    monitor.wait().await.unwrap().unwrap();

    assert!(monitor.trigger_diagnosis().is_err());
    assert!(monitor.orchestrator().history().is_empty());
    assert!(monitor.orchestrator().last_outcome().is_none());
}
