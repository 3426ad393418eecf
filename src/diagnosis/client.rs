//! Inference endpoint client
//!
//! [`DiagnosisBackend`] is the seam between the orchestrator and the network.
//! [`HttpDiagnosisClient`] is the production backend: an HTTPS POST with a
//! bearer credential, speaking either the direct feature-payload protocol or
//! an OpenAI-style chat-completions protocol.

use crate::config::{ApiKey, DiagnosisConfig, EndpointProtocol};
use crate::error::DiagnosisError;
use crate::types::{DiagnosisRequest, HrvMetrics, PatientContext, VoltageStats};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Longest error body kept in a `DiagnosisError::Status`
const MAX_ERROR_BODY: usize = 512;

/// Something that can turn a diagnosis request into a raw response body
#[async_trait]
pub trait DiagnosisBackend: Send + Sync {
    /// Submit one request and return the raw diagnosis text (JSON-like).
    async fn submit(&self, request: &DiagnosisRequest) -> Result<String, DiagnosisError>;
}

/// Compact summary of a feature window sent to the endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosisPayload {
    pub request_id: Uuid,
    pub heart_rate: Option<f64>,
    pub peak_count: usize,
    pub rr_intervals: Vec<f64>,
    pub voltage_stats: VoltageStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_rate_variability: Option<HrvMetrics>,
    pub quality_score: f64,
    pub sample_count: usize,
    pub duration_s: f64,
    pub sample_rate_hz: f64,
    /// First ECG values of the window
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub raw_data_sample: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_context: Option<PatientContext>,
}

impl From<&DiagnosisRequest> for DiagnosisPayload {
    fn from(request: &DiagnosisRequest) -> Self {
        let features = &request.features;
        Self {
            request_id: request.id,
            heart_rate: features.heart_rate_bpm,
            peak_count: features.peak_count(),
            rr_intervals: features.rr_intervals_ms.clone(),
            voltage_stats: features.voltage,
            heart_rate_variability: features.hrv,
            quality_score: features.quality_score,
            sample_count: features.sample_count,
            duration_s: features.duration_s,
            sample_rate_hz: features.sample_rate_hz,
            raw_data_sample: features.raw_excerpt.clone(),
            patient_context: request
                .patient_context
                .clone()
                .filter(|context| !context.is_empty()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageOut>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessageOut {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageIn,
}

#[derive(Debug, Deserialize)]
struct ChatMessageIn {
    #[serde(default)]
    content: Option<String>,
}

/// Build the cardiology prompt that wraps a payload for chat-completions endpoints.
pub fn build_prompt(payload: &DiagnosisPayload) -> Result<String, DiagnosisError> {
    let summary = serde_json::to_string_pretty(payload)?;
    Ok(format!(
        "You are a cardiologist reviewing a single-lead ECG window. \
The window has been summarised into the features below \
(voltages in device units, intervals in milliseconds).\n\n\
{summary}\n\n\
Answer with one JSON object and nothing else, using these keys:\n\
- \"primary_diagnosis\": string\n\
- \"secondary_diagnoses\": array of strings, most likely first\n\
- \"severity\": one of \"low\", \"moderate\", \"high\", \"critical\"\n\
- \"confidence\": number between 0 and 1\n\
- \"findings\": array of strings\n\
- \"recommendations\": object with \"immediate_actions\", \"follow_up\" and \"lifestyle\" arrays\n\
- \"risk_factors\": array of strings\n\
- \"normal_ranges_comparison\": object with \"heart_rate\", \"rhythm\" and \"morphology\" strings\n\
- \"prognosis\": string"
    ))
}

/// Pull the assistant text out of a chat-completions response body.
pub fn extract_chat_content(body: &str) -> Result<String, DiagnosisError> {
    let completion: ChatCompletion = serde_json::from_str(body)
        .map_err(|e| DiagnosisError::InvalidEnvelope(e.to_string()))?;
    completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| DiagnosisError::InvalidEnvelope("no response content".to_string()))
}

/// HTTPS backend for the inference endpoint
#[derive(Debug, Clone)]
pub struct HttpDiagnosisClient {
    client: Client,
    endpoint: String,
    api_key: ApiKey,
    protocol: EndpointProtocol,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl HttpDiagnosisClient {
    pub fn new(config: &DiagnosisConfig, api_key: ApiKey) -> Result<Self, DiagnosisError> {
        let client = Client::builder()
            .user_agent(concat!("ecg-receiver/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
            protocol: config.protocol,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    /// JSON body for one request under the configured protocol
    pub fn request_body(&self, request: &DiagnosisRequest) -> Result<serde_json::Value, DiagnosisError> {
        let payload = DiagnosisPayload::from(request);
        let body = match self.protocol {
            EndpointProtocol::Direct => serde_json::to_value(&payload)?,
            EndpointProtocol::ChatCompletions => serde_json::to_value(ChatRequest {
                model: &self.model,
                messages: vec![ChatMessageOut {
                    role: "user",
                    content: build_prompt(&payload)?,
                }],
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            })?,
        };
        Ok(body)
    }
}

#[async_trait]
impl DiagnosisBackend for HttpDiagnosisClient {
    async fn submit(&self, request: &DiagnosisRequest) -> Result<String, DiagnosisError> {
        let body = self.request_body(request)?;
        debug!(request_id = %request.id, endpoint = %self.endpoint, "submitting diagnosis request");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(DiagnosisError::Status {
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        match self.protocol {
            EndpointProtocol::Direct => Ok(text),
            EndpointProtocol::ChatCompletions => extract_chat_content(&text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeatureSnapshot, QualityBreakdown, TriggerSource};
    use chrono::Utc;

    fn request(context: Option<PatientContext>) -> DiagnosisRequest {
        DiagnosisRequest {
            id: Uuid::nil(),
            features: FeatureSnapshot {
                heart_rate_bpm: Some(72.0),
                peak_indices: vec![10, 218, 426],
                rr_intervals_ms: vec![832.0, 832.0],
                voltage: VoltageStats::default(),
                hrv: None,
                quality: QualityBreakdown::default(),
                quality_score: 0.9,
                sample_count: 2000,
                duration_s: 8.0,
                sample_rate_hz: 250.0,
                raw_excerpt: vec![512.0, 530.0, 1210.0],
            },
            patient_context: context,
            submitted_at: Utc::now(),
            source: TriggerSource::Manual,
        }
    }

    fn client(protocol: EndpointProtocol) -> HttpDiagnosisClient {
        let config = DiagnosisConfig {
            protocol,
            ..Default::default()
        };
        HttpDiagnosisClient::new(&config, ApiKey::new("sk-test")).unwrap()
    }

    #[test]
    fn test_direct_payload_fields() {
        let context = PatientContext {
            age: Some(45),
            gender: Some("male".to_string()),
            symptoms: None,
        };
        let body = client(EndpointProtocol::Direct)
            .request_body(&request(Some(context)))
            .unwrap();

        assert_eq!(body["heart_rate"], 72.0);
        assert_eq!(body["peak_count"], 3);
        assert_eq!(body["rr_intervals"][1], 832.0);
        assert_eq!(body["quality_score"], 0.9);
        assert!(body["voltage_stats"]["std_dev"].is_number());
        assert_eq!(body["raw_data_sample"][2], 1210.0);
        assert_eq!(body["patient_context"]["age"], 45);
        assert!(body["patient_context"].get("symptoms").is_none());
    }

    #[test]
    fn test_empty_patient_context_is_omitted() {
        let body = client(EndpointProtocol::Direct)
            .request_body(&request(Some(PatientContext::default())))
            .unwrap();
        assert!(body.get("patient_context").is_none());
    }

    #[test]
    fn test_chat_payload_embeds_features() {
        let body = client(EndpointProtocol::ChatCompletions)
            .request_body(&request(None))
            .unwrap();
        assert_eq!(body["model"], "gemini-2.5-flash-preview-04-17");
        assert_eq!(body["max_tokens"], 2000);
        let prompt = body["messages"][0]["content"].as_str().unwrap();
        assert!(prompt.contains("\"peak_count\": 3"));
        assert!(prompt.contains("primary_diagnosis"));
    }

    #[test]
    fn test_extract_chat_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  {\"severity\":\"low\"} "}}]}"#;
        assert_eq!(extract_chat_content(body).unwrap(), r#"{"severity":"low"}"#);

        assert!(matches!(
            extract_chat_content(r#"{"choices":[]}"#),
            Err(DiagnosisError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            extract_chat_content("<html>"),
            Err(DiagnosisError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_client_debug_hides_key() {
        let rendered = format!("{:?}", client(EndpointProtocol::Direct));
        assert!(!rendered.contains("sk-test"));
    }
}
