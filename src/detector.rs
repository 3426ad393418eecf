//! Stream format detection
//!
//! The detector watches the first lines of a connection and commits to one
//! wire format so later lines are not re-guessed one by one. A single
//! structured line is enough to lock onto `Structured`. A full probe window of
//! bare numbers locks onto `BareNumeric`. Mixed noise keeps the detector
//! sampling until the hard cap, where it falls back to `BareNumeric`.

use crate::config::StreamConfig;
use crate::decoder::LineKind;
use crate::types::StreamFormat;
use tracing::{info, warn};

/// How a lock was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    /// A structured line was observed
    StructuredSeen,
    /// Every line in the probe window was bare numeric
    AllBareNumeric,
    /// The hard cap was reached without a clean window
    Fallback,
}

#[derive(Debug, Clone)]
pub struct FormatDetector {
    format: StreamFormat,
    probe_lines: usize,
    probe_cap: usize,
    observed: usize,
    /// Consecutive bare-numeric observations ending at the latest line
    bare_run: usize,
    lock_reason: Option<LockReason>,
}

impl Default for FormatDetector {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

impl FormatDetector {
    pub fn new(probe_lines: usize, probe_cap: usize) -> Self {
        let probe_lines = probe_lines.max(1);
        Self {
            format: StreamFormat::Unknown,
            probe_lines,
            probe_cap: probe_cap.max(probe_lines),
            observed: 0,
            bare_run: 0,
            lock_reason: None,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.probe_lines, config.probe_cap)
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn is_locked(&self) -> bool {
        self.format != StreamFormat::Unknown
    }

    pub fn lock_reason(&self) -> Option<LockReason> {
        self.lock_reason
    }

    /// Lines counted towards the probe window so far
    pub fn observed(&self) -> usize {
        self.observed
    }

    /// Feed one classified line.
    ///
    /// Returns the newly locked format on the observation that locks, `None`
    /// otherwise. Observations after the lock are ignored.
    pub fn observe(&mut self, kind: LineKind) -> Option<StreamFormat> {
        if self.is_locked() || kind == LineKind::Empty {
            return None;
        }

        self.observed += 1;
        match kind {
            LineKind::Structured => {
                return Some(self.lock(StreamFormat::Structured, LockReason::StructuredSeen));
            }
            LineKind::BareNumeric => self.bare_run += 1,
            LineKind::Malformed | LineKind::Empty => self.bare_run = 0,
        }

        if self.observed >= self.probe_lines && self.bare_run >= self.probe_lines {
            return Some(self.lock(StreamFormat::BareNumeric, LockReason::AllBareNumeric));
        }

        if self.observed >= self.probe_cap {
            warn!(
                observed = self.observed,
                "format lock failed, falling back to bare numeric"
            );
            return Some(self.lock(StreamFormat::BareNumeric, LockReason::Fallback));
        }

        None
    }

    /// Forget the lock; used when the connection is re-established.
    pub fn reset(&mut self) {
        self.format = StreamFormat::Unknown;
        self.observed = 0;
        self.bare_run = 0;
        self.lock_reason = None;
    }

    fn lock(&mut self, format: StreamFormat, reason: LockReason) -> StreamFormat {
        self.format = format;
        self.lock_reason = Some(reason);
        info!(%format, ?reason, observed = self.observed, "stream format locked");
        format
    }
}
