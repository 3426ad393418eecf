//! Line decoding
//!
//! Turns one raw serial line into a [`Sample`]. Two wire forms are understood:
//!
//! - structured: `DATA,<timestamp>,<ecg>,<resp>,<heart_rate>,<status>`
//! - bare numeric: one to five numbers separated by commas or whitespace,
//!   read as `ecg[, resp[, heart_rate]]`
//!
//! Decoding never panics on malformed input; it reports a [`DecodeError`] the
//! caller logs and discards.

use crate::config::StreamConfig;
use crate::error::DecodeError;
use crate::types::{DeviceLevel, DeviceMessage, Sample, SampleStatus, StreamFormat};

/// Literal marker opening a structured line
pub const STRUCTURED_MARKER: &str = "DATA";

/// Number of fields after the structured marker
pub const STRUCTURED_FIELDS: usize = 5;

/// Upper bound on numbers accepted on one bare-numeric line
pub const MAX_BARE_FIELDS: usize = 5;

const STRUCTURED_FIELD_NAMES: [&str; 4] = ["timestamp", "ecg_value", "resp_value", "heart_rate"];
const BARE_FIELD_NAMES: [&str; MAX_BARE_FIELDS] =
    ["ecg_value", "resp_value", "heart_rate", "field_4", "field_5"];

/// Shape of a line as seen by the format detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Empty,
    Structured,
    BareNumeric,
    Malformed,
}

/// Stateless per-line decoder.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    /// Seconds per unit of the structured timestamp field
    timestamp_unit_s: f64,
    /// Rate used to synthesize timestamps for bare-numeric samples
    nominal_sample_rate_hz: f64,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

impl LineDecoder {
    pub fn new(timestamp_unit_s: f64, nominal_sample_rate_hz: f64) -> Self {
        Self {
            timestamp_unit_s,
            nominal_sample_rate_hz,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.timestamp_unit_s, config.nominal_sample_rate_hz)
    }

    /// Decode one line under the given stream format.
    ///
    /// With `StreamFormat::Unknown` both forms are tried, structured first.
    /// A locked format only accepts its own form.
    pub fn decode(
        &self,
        line: &str,
        sequence_index: u64,
        format: StreamFormat,
    ) -> Result<Sample, DecodeError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(DecodeError::EmptyLine);
        }

        match format {
            StreamFormat::Structured => self.decode_structured(line, sequence_index),
            StreamFormat::BareNumeric => self.decode_bare(line, sequence_index),
            StreamFormat::Unknown => {
                if has_structured_marker(line) {
                    self.decode_structured(line, sequence_index)
                } else {
                    self.decode_bare(line, sequence_index)
                }
            }
        }
    }

    /// Classify a line without committing to a format.
    pub fn classify(&self, line: &str) -> LineKind {
        let line = line.trim();
        if line.is_empty() {
            return LineKind::Empty;
        }
        if self.decode_structured(line, 0).is_ok() {
            LineKind::Structured
        } else if self.decode_bare(line, 0).is_ok() {
            LineKind::BareNumeric
        } else {
            LineKind::Malformed
        }
    }

    fn decode_structured(&self, line: &str, sequence_index: u64) -> Result<Sample, DecodeError> {
        if !has_structured_marker(line) {
            return Err(DecodeError::UnrecognizedPrefix(prefix_of(line)));
        }

        let fields: Vec<&str> = line.split(',').skip(1).map(str::trim).collect();
        if fields.len() != STRUCTURED_FIELDS {
            return Err(DecodeError::WrongFieldCount {
                expected: STRUCTURED_FIELDS,
                found: fields.len(),
            });
        }

        let mut values = [0.0f64; 4];
        for (slot, (name, raw)) in values
            .iter_mut()
            .zip(STRUCTURED_FIELD_NAMES.iter().zip(fields.iter()))
        {
            *slot = parse_number(*name, raw)?;
        }
        let [timestamp, ecg_value, resp_value, heart_rate] = values;

        Ok(Sample {
            sequence_index,
            timestamp: timestamp * self.timestamp_unit_s,
            ecg_value,
            resp_value: Some(resp_value),
            heart_rate_hint: Some(heart_rate),
            status: SampleStatus::from_token(fields[4]),
        })
    }

    fn decode_bare(&self, line: &str, sequence_index: u64) -> Result<Sample, DecodeError> {
        let tokens: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .collect();

        if tokens.is_empty() {
            return Err(DecodeError::EmptyLine);
        }
        let first = tokens[0];
        if first.parse::<f64>().is_err() && first.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(DecodeError::UnrecognizedPrefix(prefix_of(line)));
        }
        if tokens.len() > MAX_BARE_FIELDS {
            return Err(DecodeError::WrongFieldCount {
                expected: MAX_BARE_FIELDS,
                found: tokens.len(),
            });
        }

        let mut values = Vec::with_capacity(tokens.len());
        for (name, raw) in BARE_FIELD_NAMES.iter().zip(tokens.iter()) {
            values.push(parse_number(*name, raw)?);
        }

        Ok(Sample {
            sequence_index,
            timestamp: self.synthetic_timestamp(sequence_index),
            ecg_value: values[0],
            resp_value: values.get(1).copied(),
            heart_rate_hint: values.get(2).copied(),
            status: None,
        })
    }

    fn synthetic_timestamp(&self, sequence_index: u64) -> f64 {
        if self.nominal_sample_rate_hz > 0.0 {
            sequence_index as f64 / self.nominal_sample_rate_hz
        } else {
            sequence_index as f64
        }
    }
}

/// Recognize firmware log output (`INFO,...` / `ERROR,...`).
pub fn device_message(line: &str) -> Option<DeviceMessage> {
    let line = line.trim();
    let (level, rest) = if let Some(rest) = line.strip_prefix("ERROR,") {
        (DeviceLevel::Error, rest)
    } else if let Some(rest) = line.strip_prefix("INFO,") {
        (DeviceLevel::Info, rest)
    } else {
        return None;
    };
    Some(DeviceMessage {
        level,
        text: rest.trim().to_string(),
    })
}

fn has_structured_marker(line: &str) -> bool {
    line.split_once(',')
        .map(|(marker, _)| marker.trim() == STRUCTURED_MARKER)
        .unwrap_or(false)
}

fn parse_number(field: &'static str, raw: &str) -> Result<f64, DecodeError> {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(DecodeError::NonNumericField {
            field,
            value: raw.to_string(),
        }),
    }
}

fn prefix_of(line: &str) -> String {
    line.split(|c: char| c == ',' || c.is_whitespace())
        .next()
        .unwrap_or_default()
        .chars()
        .take(16)
        .collect()
}
