//! Response parsing
//!
//! Turns the raw text returned by the endpoint into a [`DiagnosisResult`].
//! Parsing is best-effort: markdown fences and surrounding prose are
//! stripped, a few alternative key names are accepted, and out-of-range
//! values are corrected and flagged rather than rejected. A body with no JSON
//! object, no primary condition or no severity is refused.

use crate::error::ResultParseError;
use crate::types::{DiagnosisRequest, DiagnosisResult, Recommendations, ResultFlag, Severity};
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

const DEFAULT_CONFIDENCE: f64 = 0.5;

const PRIMARY_KEYS: &[&str] = &["primary_diagnosis", "primary_condition", "diagnosis"];
const SECONDARY_KEYS: &[&str] = &["secondary_diagnoses", "secondary_conditions"];
const FINDINGS_KEYS: &[&str] = &["findings", "key_findings"];
const RANGES_KEYS: &[&str] = &["normal_ranges_comparison", "normal_ranges"];

/// Parse a raw endpoint response for `request`.
pub fn parse_response(
    body: &str,
    request: &DiagnosisRequest,
) -> Result<DiagnosisResult, ResultParseError> {
    ResultParser::parse(body, request)
}

/// Parser for endpoint responses
pub struct ResultParser;

impl ResultParser {
    /// Parse a raw response body for the given request.
    pub fn parse(body: &str, request: &DiagnosisRequest) -> Result<DiagnosisResult, ResultParseError> {
        let object = Self::parse_object(body)?;
        let mut flags = Vec::new();

        let primary_condition = first_string(&object, PRIMARY_KEYS)
            .ok_or_else(|| malformed("missing primary diagnosis"))?;

        let severity = match object.get("severity") {
            None | Some(Value::Null) => return Err(malformed("missing severity")),
            Some(Value::String(token)) => match Severity::from_token(token) {
                Ok(severity) => severity,
                Err(_) => unrecognized_severity(token, &mut flags),
            },
            Some(other) => unrecognized_severity(&other.to_string(), &mut flags),
        };

        let confidence = match object.get("confidence").and_then(as_number) {
            Some(raw) if (0.0..=1.0).contains(&raw) => raw,
            Some(raw) => {
                flags.push(ResultFlag::ConfidenceClamped { raw });
                raw.clamp(0.0, 1.0)
            }
            None => {
                flags.push(ResultFlag::ConfidenceDefaulted);
                DEFAULT_CONFIDENCE
            }
        };

        Ok(DiagnosisResult {
            request_id: request.id,
            primary_condition,
            secondary_conditions: first_list(&object, SECONDARY_KEYS),
            severity,
            confidence,
            findings: first_list(&object, FINDINGS_KEYS),
            recommendations: parse_recommendations(object.get("recommendations")),
            risk_factors: first_list(&object, &["risk_factors"]),
            prognosis: first_string(&object, &["prognosis"]),
            normal_ranges: parse_ranges(&object),
            flags,
            heart_rate_bpm: request.features.heart_rate_bpm,
            received_at: Utc::now(),
        })
    }

    /// Locate and decode the JSON object in a response body.
    pub fn parse_object(body: &str) -> Result<Map<String, Value>, ResultParseError> {
        let text = strip_fences(body);
        let start = text
            .find('{')
            .ok_or_else(|| malformed("no JSON object in response"))?;
        // Only the first complete value counts; trailing prose is ignored
        let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(Value::Object(map))) => Ok(map),
            Some(Ok(_)) => Err(malformed("response is not a JSON object")),
            Some(Err(e)) => Err(malformed(&e.to_string())),
            None => Err(malformed("no JSON object in response")),
        }
    }
}

fn malformed(message: &str) -> ResultParseError {
    ResultParseError::MalformedResponse(message.to_string())
}

fn unrecognized_severity(raw: &str, flags: &mut Vec<ResultFlag>) -> Severity {
    warn!(severity = raw, "unrecognized severity, defaulting to moderate");
    flags.push(ResultFlag::SeverityUnrecognized {
        raw: raw.to_string(),
    });
    Severity::Moderate
}

/// Remove a surrounding markdown code fence, if any.
fn strip_fences(body: &str) -> &str {
    let mut text = body.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // Drop the info string ("json") on the opening fence line
        text = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest.trim_start_matches("json"),
        };
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn first_string(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn first_list(object: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .map(string_list)
        .find(|list| !list.is_empty())
        .unwrap_or_default()
}

/// Strings from an array (non-string items rendered as JSON) or a lone string
fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn parse_recommendations(value: Option<&Value>) -> Recommendations {
    let mut recommendations = Recommendations::default();
    match value {
        Some(Value::Object(groups)) => {
            for (key, items) in groups {
                let items = string_list(items);
                match key.as_str() {
                    "immediate_actions" | "immediate" => recommendations.immediate_actions.extend(items),
                    "follow_up" | "followup" => recommendations.follow_up.extend(items),
                    "lifestyle" => recommendations.lifestyle.extend(items),
                    _ => recommendations.general.extend(items),
                }
            }
        }
        Some(other) => recommendations.general = string_list(other),
        None => {}
    }
    recommendations
}

fn parse_ranges(object: &Map<String, Value>) -> BTreeMap<String, String> {
    let ranges = RANGES_KEYS
        .iter()
        .filter_map(|key| object.get(*key))
        .find_map(Value::as_object);
    let Some(ranges) = ranges else {
        return BTreeMap::new();
    };
    ranges
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Null => return None,
                other => other.to_string(),
            };
            (!text.is_empty()).then(|| (key.clone(), text))
        })
        .collect()
}
