//! Configuration
//!
//! Settings are layered: built-in defaults, then an optional file (any format
//! the `config` crate understands), then `ECG__<SECTION>__<KEY>` environment
//! variables. The inference credential is never part of the file; it is read
//! from the environment variable named by `diagnosis.api_key_env`.

use crate::error::ConfigError;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Default rolling buffer capacity (~8 s at 250 Hz)
pub const DEFAULT_BUFFER_CAPACITY: usize = 2000;

/// Environment variable holding the bearer credential by default
pub const DEFAULT_API_KEY_ENV: &str = "ECG_API_KEY";

/// Ingestion settings for one connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub buffer_capacity: usize,
    /// Lines observed before the format detector may commit
    pub probe_lines: usize,
    /// Hard cap after which the detector falls back to bare numeric
    pub probe_cap: usize,
    /// Rate used to timestamp bare-numeric samples
    pub nominal_sample_rate_hz: f64,
    /// Seconds per unit of the structured timestamp field
    pub timestamp_unit_s: f64,
    /// Longest accepted line in bytes; longer lines are skipped to the next newline
    pub max_line_len: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            probe_lines: 5,
            probe_cap: 50,
            nominal_sample_rate_hz: 250.0,
            timestamp_unit_s: 0.001,
            max_line_len: 4096,
        }
    }
}

/// Feature extraction tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Peak threshold in standard deviations above the mean
    pub threshold_k: f64,
    /// Minimum spacing between accepted peaks
    pub refractory_ms: f64,
    /// Minimum buffered duration before features are computed
    pub min_duration_s: f64,
    /// Standard deviation at which the variance score reaches 0.5
    pub noise_floor: f64,
    /// Fraction of samples on the min/max rails tolerated before penalizing
    pub clip_fraction: f64,
    /// RR coefficient of variation under which the rhythm counts as regular
    pub regular_rr_cv: f64,
    /// Leading ECG values copied into each snapshot as a raw excerpt
    pub raw_excerpt_len: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            threshold_k: 1.5,
            refractory_ms: 250.0,
            min_duration_s: 4.0,
            noise_floor: 1.0,
            clip_fraction: 0.25,
            regular_rr_cv: 0.15,
            raw_excerpt_len: 100,
        }
    }
}

/// Offline analysis of whole recordings in overlapping windows
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Samples per window (2500 is 10 s at 250 Hz)
    pub size: usize,
    /// Fraction of each window shared with the next, in [0, 1)
    pub overlap: f64,
    /// Most samples kept when a whole recording is loaded for windowing
    pub max_recording_samples: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: 2500,
            overlap: 0.5,
            max_recording_samples: 1_000_000,
        }
    }
}

impl WindowConfig {
    /// Samples between consecutive window starts (at least 1)
    pub fn step(&self) -> usize {
        ((self.size as f64 * (1.0 - self.overlap)) as usize).max(1)
    }
}

/// Wire protocol spoken by the inference endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointProtocol {
    /// POST the feature payload, receive the diagnosis JSON directly
    Direct,
    /// OpenAI-style chat completions; diagnosis JSON in the first choice
    ChatCompletions,
}

/// Diagnosis orchestration settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiagnosisConfig {
    pub endpoint: String,
    pub protocol: EndpointProtocol,
    /// Model name sent with chat-completions requests
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub auto_enabled: bool,
    pub auto_interval_secs: u64,
    pub history_len: usize,
    /// Name of the environment variable holding the bearer credential
    pub api_key_env: String,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.gptnb.ai/v1/chat/completions".to_string(),
            protocol: EndpointProtocol::ChatCompletions,
            model: "gemini-2.5-flash-preview-04-17".to_string(),
            temperature: 0.1,
            max_tokens: 2000,
            timeout_secs: 45,
            auto_enabled: false,
            auto_interval_secs: 30,
            history_len: 50,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
        }
    }
}

impl DiagnosisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn auto_interval(&self) -> Duration {
        Duration::from_secs(self.auto_interval_secs)
    }

    /// Read the bearer credential from the configured environment variable.
    pub fn api_key(&self) -> Result<ApiKey, ConfigError> {
        match std::env::var(&self.api_key_env) {
            Ok(value) if !value.trim().is_empty() => Ok(ApiKey::new(value.trim())),
            _ => Err(ConfigError::MissingApiKey(self.api_key_env.clone())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub save_logs: bool,
    pub log_file_path: String,
    pub rewrite_last_logs: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            save_logs: false,
            log_file_path: "logs/ecg-receiver.log".to_string(),
            rewrite_last_logs: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub features: FeatureConfig,
    pub diagnosis: DiagnosisConfig,
    pub window: WindowConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load defaults, the optional file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: AppConfig = builder
            .add_source(config::Environment::with_prefix("ECG").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let stream = &self.stream;
        if stream.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("stream.buffer_capacity must be > 0".into()));
        }
        if stream.probe_lines == 0 || stream.probe_cap < stream.probe_lines {
            return Err(ConfigError::Invalid(
                "stream.probe_cap must be >= stream.probe_lines > 0".into(),
            ));
        }
        if stream.nominal_sample_rate_hz <= 0.0 || stream.timestamp_unit_s <= 0.0 {
            return Err(ConfigError::Invalid(
                "stream sample rate and timestamp unit must be positive".into(),
            ));
        }
        if stream.max_line_len == 0 {
            return Err(ConfigError::Invalid("stream.max_line_len must be > 0".into()));
        }
        if self.window.size == 0 || !(0.0..1.0).contains(&self.window.overlap) {
            return Err(ConfigError::Invalid(
                "window.size must be > 0 and window.overlap in [0, 1)".into(),
            ));
        }
        if self.window.max_recording_samples < self.window.size {
            return Err(ConfigError::Invalid(
                "window.max_recording_samples must be >= window.size".into(),
            ));
        }
        if self.features.threshold_k < 0.0 || self.features.refractory_ms < 0.0 {
            return Err(ConfigError::Invalid(
                "features.threshold_k and features.refractory_ms must be >= 0".into(),
            ));
        }
        if self.features.noise_floor <= 0.0 {
            return Err(ConfigError::Invalid("features.noise_floor must be > 0".into()));
        }
        if self.diagnosis.history_len == 0 {
            return Err(ConfigError::Invalid("diagnosis.history_len must be > 0".into()));
        }
        if self.diagnosis.timeout_secs == 0 || self.diagnosis.auto_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "diagnosis timeout and auto interval must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Opaque bearer credential. Formatting never reveals the value.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}
