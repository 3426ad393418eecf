//! Feature extraction
//!
//! This module derives clinical-style features from one buffer snapshot:
//! - R-peak detection with a dynamic threshold and refractory period
//! - RR intervals, heart rate and HRV metrics
//! - Voltage statistics
//! - A heuristic signal quality score
//!
//! Extraction is a pure function of the snapshot. Whole recordings can be
//! analysed in overlapping windows with [`FeatureExtractor::extract_windows`].

use crate::buffer::BufferSnapshot;
use crate::config::{FeatureConfig, WindowConfig};
use crate::error::FeatureError;
use crate::types::{FeatureSnapshot, HrvMetrics, QualityBreakdown, Sample, VoltageStats};
use std::sync::Arc;

/// Standard deviations below this are treated as a flat line
const FLAT_EPSILON: f64 = 1e-9;

/// Minimum number of samples for any analysis
const MIN_SAMPLES: usize = 3;

/// Features of one window of a longer recording
#[derive(Debug, Clone, PartialEq)]
pub struct WindowFeatures {
    /// 1-based window number
    pub window: usize,
    /// Offset of the first sample within the recording
    pub start_sample: usize,
    /// One past the last sample
    pub end_sample: usize,
    pub result: Result<FeatureSnapshot, FeatureError>,
}

/// Feature extractor for computing a [`FeatureSnapshot`]
#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    config: FeatureConfig,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Extract features from a snapshot.
    ///
    /// Fails with `InsufficientData` when the window is shorter than the
    /// configured minimum duration.
    pub fn extract(&self, snapshot: &BufferSnapshot) -> Result<FeatureSnapshot, FeatureError> {
        let sample_count = snapshot.len();
        let duration_s = snapshot.duration_s();

        if sample_count < MIN_SAMPLES || duration_s < self.config.min_duration_s {
            return Err(FeatureError::InsufficientData {
                duration_s,
                required_s: self.config.min_duration_s,
                samples: sample_count,
            });
        }

        let values = snapshot.ecg_values();
        let timestamps = snapshot.timestamps();

        let voltage = compute_voltage_stats(&values);
        let spacing = median_spacing(&timestamps);
        let sample_rate_hz = spacing.map(|dt| 1.0 / dt).unwrap_or(0.0);

        let threshold = voltage.mean + self.config.threshold_k * voltage.std_dev;
        let refractory_samples = refractory_samples(self.config.refractory_ms, sample_rate_hz);
        let peak_indices = if voltage.std_dev < FLAT_EPSILON {
            Vec::new()
        } else {
            detect_peaks(&values, threshold, refractory_samples)
        };

        let rr_intervals_ms = compute_rr_intervals_ms(&timestamps, &peak_indices);
        let heart_rate_bpm = compute_heart_rate(&rr_intervals_ms);
        let hrv = compute_hrv(&rr_intervals_ms, self.config.regular_rr_cv);
        let quality = self.quality_from_parts(&values, &voltage, spacing, duration_s);

        Ok(FeatureSnapshot {
            heart_rate_bpm,
            peak_indices,
            rr_intervals_ms,
            voltage,
            hrv,
            quality_score: quality.score,
            quality,
            sample_count,
            duration_s,
            sample_rate_hz,
            raw_excerpt: values.iter().take(self.config.raw_excerpt_len).copied().collect(),
        })
    }

    /// Extract features over successive overlapping windows of a recording.
    ///
    /// A recording shorter than one window is analysed as a single window.
    pub fn extract_windows(&self, samples: &[Arc<Sample>], window: &WindowConfig) -> Vec<WindowFeatures> {
        let size = window.size.max(1);
        let starts: Vec<usize> = if samples.is_empty() {
            Vec::new()
        } else if samples.len() < size {
            vec![0]
        } else {
            (0..=samples.len() - size).step_by(window.step()).collect()
        };

        starts
            .into_iter()
            .enumerate()
            .map(|(i, start)| {
                let end = (start + size).min(samples.len());
                let snapshot = BufferSnapshot::from_samples(samples[start..end].to_vec());
                WindowFeatures {
                    window: i + 1,
                    start_sample: start,
                    end_sample: end,
                    result: self.extract(&snapshot),
                }
            })
            .collect()
    }

    /// Signal quality of a snapshot, computed without the duration gate.
    pub fn quality(&self, snapshot: &BufferSnapshot) -> QualityBreakdown {
        let values = snapshot.ecg_values();
        if values.is_empty() {
            return QualityBreakdown::default();
        }
        let voltage = compute_voltage_stats(&values);
        let spacing = median_spacing(&snapshot.timestamps());
        self.quality_from_parts(&values, &voltage, spacing, snapshot.duration_s())
    }

    fn quality_from_parts(
        &self,
        values: &[f64],
        voltage: &VoltageStats,
        spacing: Option<f64>,
        duration_s: f64,
    ) -> QualityBreakdown {
        let n = values.len();

        // Received vs expected samples at the observed spacing
        let density = match spacing {
            Some(dt) if n >= 2 && duration_s > 0.0 => {
                let expected = (duration_s / dt).round() + 1.0;
                (n as f64 / expected).clamp(0.0, 1.0)
            }
            _ => 0.0,
        };

        let variance = if voltage.std_dev < FLAT_EPSILON {
            0.0
        } else {
            voltage.std_dev / (voltage.std_dev + self.config.noise_floor)
        };

        let clipping = if voltage.std_dev < FLAT_EPSILON {
            0.0
        } else {
            let on_rails = values
                .iter()
                .filter(|&&v| v == voltage.min || v == voltage.max)
                .count() as f64
                / n as f64;
            let tolerated = self.config.clip_fraction.clamp(0.0, 0.99);
            if on_rails > tolerated {
                (1.0 - (on_rails - tolerated) / (1.0 - tolerated)).clamp(0.0, 1.0)
            } else {
                1.0
            }
        };

        QualityBreakdown {
            density,
            variance,
            clipping,
            score: (density * variance * clipping).clamp(0.0, 1.0),
        }
    }
}

/// Mean, population standard deviation, range and RMS
pub fn compute_voltage_stats(values: &[f64]) -> VoltageStats {
    if values.is_empty() {
        return VoltageStats::default();
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let rms = (values.iter().map(|v| v * v).sum::<f64>() / n).sqrt();

    VoltageStats {
        mean,
        std_dev: variance.sqrt(),
        min,
        max,
        peak_to_peak: max - min,
        rms,
    }
}

/// Median of the positive gaps between consecutive timestamps
fn median_spacing(timestamps: &[f64]) -> Option<f64> {
    let mut gaps: Vec<f64> = timestamps
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|dt| *dt > 0.0)
        .collect();
    if gaps.is_empty() {
        return None;
    }
    gaps.sort_by(|a, b| a.total_cmp(b));
    let mid = gaps.len() / 2;
    Some(if gaps.len() % 2 == 0 {
        (gaps[mid - 1] + gaps[mid]) / 2.0
    } else {
        gaps[mid]
    })
}

fn refractory_samples(refractory_ms: f64, sample_rate_hz: f64) -> usize {
    if sample_rate_hz <= 0.0 {
        return 1;
    }
    ((refractory_ms / 1000.0) * sample_rate_hz).ceil().max(1.0) as usize
}

/// Local maxima above `threshold`, at least `refractory` samples apart.
///
/// When two candidates fall inside one refractory window the taller one is kept.
pub fn detect_peaks(values: &[f64], threshold: f64, refractory: usize) -> Vec<usize> {
    let mut peaks: Vec<usize> = Vec::new();
    if values.len() < MIN_SAMPLES {
        return peaks;
    }

    for i in 1..values.len() - 1 {
        let v = values[i];
        if v <= threshold || v <= values[i - 1] || v < values[i + 1] {
            continue;
        }
        match peaks.last_mut() {
            Some(last) if i - *last < refractory => {
                if v > values[*last] {
                    *last = i;
                }
            }
            _ => peaks.push(i),
        }
    }
    peaks
}

fn compute_rr_intervals_ms(timestamps: &[f64], peaks: &[usize]) -> Vec<f64> {
    peaks
        .windows(2)
        .map(|w| (timestamps[w[1]] - timestamps[w[0]]) * 1000.0)
        .collect()
}

/// 60 / mean RR (seconds); `None` without at least one interval
fn compute_heart_rate(rr_intervals_ms: &[f64]) -> Option<f64> {
    if rr_intervals_ms.is_empty() {
        return None;
    }
    let mean_rr_s = rr_intervals_ms.iter().sum::<f64>() / rr_intervals_ms.len() as f64 / 1000.0;
    if mean_rr_s > 0.0 {
        Some(60.0 / mean_rr_s)
    } else {
        None
    }
}

fn compute_hrv(rr_intervals_ms: &[f64], regular_rr_cv: f64) -> Option<HrvMetrics> {
    if rr_intervals_ms.len() < 2 {
        return None;
    }
    let n = rr_intervals_ms.len() as f64;
    let mean_rr_ms = rr_intervals_ms.iter().sum::<f64>() / n;
    if mean_rr_ms <= 0.0 {
        return None;
    }
    let sdnn_ms = (rr_intervals_ms
        .iter()
        .map(|rr| (rr - mean_rr_ms).powi(2))
        .sum::<f64>()
        / n)
        .sqrt();
    let successive: Vec<f64> = rr_intervals_ms.windows(2).map(|w| w[1] - w[0]).collect();
    let rmssd_ms =
        (successive.iter().map(|d| d * d).sum::<f64>() / successive.len() as f64).sqrt();
    let rr_cv = sdnn_ms / mean_rr_ms;

    Some(HrvMetrics {
        mean_rr_ms,
        sdnn_ms,
        rmssd_ms,
        rr_cv,
        rhythm_regular: rr_cv < regular_rr_cv,
    })
}
