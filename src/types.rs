//! Core types for the ECG receiver pipeline
//!
//! This module defines the data structures that flow through each stage:
//! decoded samples, feature snapshots, diagnosis requests and results.

use crate::error::ResultParseError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Device-reported status token carried by structured lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SampleStatus {
    Ok,
    Warn,
    Error,
}

impl SampleStatus {
    /// Parse a wire status token (case-insensitive). Unknown tokens yield `None`.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "OK" => Some(SampleStatus::Ok),
            "WARN" | "WARNING" => Some(SampleStatus::Warn),
            "ERROR" | "ERR" => Some(SampleStatus::Error),
            _ => None,
        }
    }
}

/// One decoded point of the waveform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Monotonic counter assigned by the ingesting session
    pub sequence_index: u64,
    /// Sample time in seconds
    pub timestamp: f64,
    /// ECG amplitude in device units (may be negative)
    pub ecg_value: f64,
    /// Respiration channel, when the device sends one
    pub resp_value: Option<f64>,
    /// Device-computed heart rate, when the device sends one
    pub heart_rate_hint: Option<f64>,
    /// Device status token
    pub status: Option<SampleStatus>,
}

/// Wire format a connection has locked onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    /// `DATA,<timestamp>,<ecg>,<resp>,<hr>,<status>`
    Structured,
    /// One or more bare numbers per line
    BareNumeric,
    /// Not locked yet
    #[default]
    Unknown,
}

impl StreamFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFormat::Structured => "structured",
            StreamFormat::BareNumeric => "bare_numeric",
            StreamFormat::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a device log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceLevel {
    Info,
    Error,
}

/// Log output emitted by the device firmware (`INFO,...` / `ERROR,...`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMessage {
    pub level: DeviceLevel,
    pub text: String,
}

/// Voltage statistics over the analysis window
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VoltageStats {
    pub mean: f64,
    /// Population standard deviation
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub peak_to_peak: f64,
    pub rms: f64,
}

/// Heart rate variability metrics, available with three or more peaks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HrvMetrics {
    /// Mean RR interval (ms)
    pub mean_rr_ms: f64,
    /// Standard deviation of RR intervals (ms)
    pub sdnn_ms: f64,
    /// Root mean square of successive RR differences (ms)
    pub rmssd_ms: f64,
    /// SDNN / mean RR
    pub rr_cv: f64,
    /// True when the RR coefficient of variation is below the regularity limit
    pub rhythm_regular: bool,
}

/// Components of the signal quality score, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityBreakdown {
    /// Received samples / expected samples over the window
    pub density: f64,
    /// Saturating score of the standard deviation (0 for a flat line)
    pub variance: f64,
    /// 1 minus the penalty for samples pinned to the window rails
    pub clipping: f64,
    /// Product of the three components
    pub score: f64,
}

/// Features derived from one point-in-time view of the buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    /// Estimated heart rate, `None` with fewer than two peaks
    pub heart_rate_bpm: Option<f64>,
    /// Indices into the analysed window
    pub peak_indices: Vec<usize>,
    /// Intervals between consecutive peaks (ms)
    pub rr_intervals_ms: Vec<f64>,
    pub voltage: VoltageStats,
    pub hrv: Option<HrvMetrics>,
    pub quality: QualityBreakdown,
    /// Overall signal quality in [0, 1]
    pub quality_score: f64,
    pub sample_count: usize,
    pub duration_s: f64,
    /// Observed sample rate (Hz) from the median sample spacing
    pub sample_rate_hz: f64,
    /// Leading ECG values of the window, as context for the endpoint
    #[serde(default)]
    pub raw_excerpt: Vec<f64>,
}

impl FeatureSnapshot {
    pub fn peak_count(&self) -> usize {
        self.peak_indices.len()
    }
}

/// Optional patient information forwarded to the inference endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symptoms: Option<String>,
}

impl PatientContext {
    pub fn is_empty(&self) -> bool {
        self.age.is_none() && self.gender.is_none() && self.symptoms.is_none()
    }
}

/// What started a diagnosis cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Timer,
}

/// One submission to the inference endpoint
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisRequest {
    pub id: Uuid,
    pub features: FeatureSnapshot,
    pub patient_context: Option<PatientContext>,
    pub submitted_at: DateTime<Utc>,
    pub source: TriggerSource,
}

/// Ordinal clinical urgency returned by the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Moderate,
    High,
    Critical,
}

impl Severity {
    /// Map a response token onto one of the four known levels.
    pub fn from_token(token: &str) -> Result<Self, ResultParseError> {
        match token.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "moderate" => Ok(Severity::Moderate),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(ResultParseError::SeverityUnrecognized(token.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Moderate => "moderate",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recommendations grouped the way the endpoint returns them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendations {
    pub immediate_actions: Vec<String>,
    pub follow_up: Vec<String>,
    pub lifestyle: Vec<String>,
    /// Flat recommendations that came without a category
    pub general: Vec<String>,
}

impl Recommendations {
    pub fn is_empty(&self) -> bool {
        self.immediate_actions.is_empty()
            && self.follow_up.is_empty()
            && self.lifestyle.is_empty()
            && self.general.is_empty()
    }
}

/// Best-effort corrections applied while parsing a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultFlag {
    /// Severity token did not map to a known level; defaulted to moderate
    SeverityUnrecognized { raw: String },
    /// Confidence was outside [0, 1] and has been clamped
    ConfidenceClamped { raw: f64 },
    /// Confidence was missing or non-numeric; defaulted to 0.5
    ConfidenceDefaulted,
}

/// A parsed, ranked diagnosis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisResult {
    pub request_id: Uuid,
    pub primary_condition: String,
    pub secondary_conditions: Vec<String>,
    pub severity: Severity,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub findings: Vec<String>,
    pub recommendations: Recommendations,
    pub risk_factors: Vec<String>,
    pub prognosis: Option<String>,
    /// Reference-range commentary keyed by metric (heart_rate, rhythm, ...)
    pub normal_ranges: BTreeMap<String, String>,
    pub flags: Vec<ResultFlag>,
    /// Heart rate the request was built from
    pub heart_rate_bpm: Option<f64>,
    pub received_at: DateTime<Utc>,
}

impl DiagnosisResult {
    /// True when the parser had to correct the response
    pub fn is_flagged(&self) -> bool {
        !self.flags.is_empty()
    }

    /// Primary condition followed by distinct secondary conditions in response order
    pub fn ranked_conditions(&self) -> Vec<&str> {
        let mut ranked: Vec<&str> = vec![self.primary_condition.as_str()];
        for condition in &self.secondary_conditions {
            let condition = condition.trim();
            if condition.is_empty() {
                continue;
            }
            if ranked.iter().any(|c| c.eq_ignore_ascii_case(condition)) {
                continue;
            }
            ranked.push(condition);
        }
        ranked
    }
}
