//! Per-connection ingestion
//!
//! A [`StreamSession`] owns everything that belongs to one connection: the
//! format lock, the sequence counter and the ingestion statistics. It writes
//! decoded samples into the shared buffer and publishes them on the event
//! bus. A reconnect creates a fresh session; nothing carries over.

use crate::buffer::SharedBuffer;
use crate::config::StreamConfig;
use crate::decoder::{device_message, LineDecoder, LineKind};
use crate::detector::FormatDetector;
use crate::error::DecodeError;
use crate::events::{EventBus, PipelineEvent};
use crate::types::{DeviceLevel, DeviceMessage, Sample, StreamFormat};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

/// Counters for one connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Raw lines read, including empty and device lines
    pub lines: u64,
    /// Samples accepted into the buffer
    pub samples: u64,
    pub device_messages: u64,
    /// Times the structured timestamp went backwards and was rebased
    pub clock_resets: u64,
    /// Rejected lines by decode error reason
    pub rejected: BTreeMap<String, u64>,
}

impl IngestStats {
    pub fn rejected_total(&self) -> u64 {
        self.rejected.values().sum()
    }
}

/// What happened to one line
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Sample(Arc<Sample>),
    Device(DeviceMessage),
    Rejected(DecodeError),
}

#[derive(Debug)]
pub struct StreamSession {
    decoder: LineDecoder,
    detector: FormatDetector,
    buffer: SharedBuffer,
    events: EventBus,
    next_sequence: u64,
    sample_period_s: f64,
    max_line_len: usize,
    /// Added to decoded timestamps so they never run backwards
    timestamp_offset: f64,
    last_timestamp: Option<f64>,
    stats: IngestStats,
}

/// Result of one bounded line read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawLine {
    Eof,
    Line,
    TooLong,
}

impl StreamSession {
    pub fn new(config: &StreamConfig, buffer: SharedBuffer, events: EventBus) -> Self {
        Self {
            decoder: LineDecoder::from_config(config),
            detector: FormatDetector::from_config(config),
            buffer,
            events,
            next_sequence: 0,
            sample_period_s: 1.0 / config.nominal_sample_rate_hz.max(f64::MIN_POSITIVE),
            max_line_len: config.max_line_len.max(1),
            timestamp_offset: 0.0,
            last_timestamp: None,
            stats: IngestStats::default(),
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.detector.format()
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Process one raw line.
    pub fn ingest_line(&mut self, line: &str) -> LineOutcome {
        self.stats.lines += 1;

        if let Some(message) = device_message(line) {
            self.stats.device_messages += 1;
            match message.level {
                DeviceLevel::Error => warn!(text = %message.text, "device error"),
                DeviceLevel::Info => debug!(text = %message.text, "device info"),
            }
            self.events.publish(PipelineEvent::Device(message.clone()));
            return LineOutcome::Device(message);
        }

        if !self.detector.is_locked() {
            let kind = self.decoder.classify(line);
            if let Some(format) = self.detector.observe(kind) {
                self.events.publish(PipelineEvent::FormatLocked(format));
            }
        }

        // Empty lines do not consume a sequence number; rejected lines do,
        // so a garbled sample shows up as a gap.
        if line.trim().is_empty() {
            return self.reject(DecodeError::EmptyLine, line);
        }
        let sequence_index = self.next_sequence;
        self.next_sequence += 1;

        match self.decoder.decode(line, sequence_index, self.detector.format()) {
            Ok(mut sample) => {
                sample.timestamp = self.monotonic_timestamp(sample.timestamp);
                let sample = Arc::new(sample);
                self.buffer.push(Arc::clone(&sample));
                self.stats.samples += 1;
                self.events.publish(PipelineEvent::Sample(Arc::clone(&sample)));
                LineOutcome::Sample(sample)
            }
            Err(e) => self.reject(e, line),
        }
    }

    /// Account for a line that was skipped for exceeding `max_line_len`.
    pub fn ingest_oversized_line(&mut self) -> LineOutcome {
        self.stats.lines += 1;
        if !self.detector.is_locked() {
            if let Some(format) = self.detector.observe(LineKind::Malformed) {
                self.events.publish(PipelineEvent::FormatLocked(format));
            }
        }
        self.next_sequence += 1;
        let error = DecodeError::LineTooLong {
            limit: self.max_line_len,
        };
        debug!(reason = error.reason(), limit = self.max_line_len, "line rejected");
        *self
            .stats
            .rejected
            .entry(error.reason().to_string())
            .or_default() += 1;
        LineOutcome::Rejected(error)
    }

    /// Shift a decoded timestamp past a device clock reset.
    ///
    /// A timestamp earlier than the previous sample is rebased to one nominal
    /// sample period after it, and the same shift applies to what follows.
    fn monotonic_timestamp(&mut self, decoded: f64) -> f64 {
        let mut timestamp = decoded + self.timestamp_offset;
        if let Some(last) = self.last_timestamp {
            if timestamp < last {
                let rebased = last + self.sample_period_s;
                self.timestamp_offset += rebased - timestamp;
                self.stats.clock_resets += 1;
                warn!(
                    decoded,
                    previous = last,
                    rebased,
                    "device timestamp went backwards, rebasing"
                );
                timestamp = rebased;
            }
        }
        self.last_timestamp = Some(timestamp);
        timestamp
    }

    fn reject(&mut self, error: DecodeError, line: &str) -> LineOutcome {
        debug!(reason = error.reason(), line = %line.trim(), "line rejected");
        *self
            .stats
            .rejected
            .entry(error.reason().to_string())
            .or_default() += 1;
        LineOutcome::Rejected(error)
    }

    /// Forget the format lock and counters, as on reconnect.
    pub fn reset(&mut self) {
        self.detector.reset();
        self.next_sequence = 0;
        self.timestamp_offset = 0.0;
        self.last_timestamp = None;
        self.stats = IngestStats::default();
    }

    /// Read lines until EOF and return the final statistics.
    ///
    /// Invalid UTF-8 is replaced rather than treated as an error. Lines
    /// longer than `max_line_len` are dropped without being held in memory.
    pub async fn run<R>(mut self, mut reader: R) -> io::Result<IngestStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut raw = Vec::with_capacity(128);
        loop {
            raw.clear();
            match read_bounded_line(&mut reader, &mut raw, self.max_line_len).await? {
                RawLine::Eof => break,
                RawLine::TooLong => {
                    self.ingest_oversized_line();
                }
                RawLine::Line => {
                    let line = String::from_utf8_lossy(&raw);
                    self.ingest_line(&line);
                }
            }
        }
        info!(
            lines = self.stats.lines,
            samples = self.stats.samples,
            rejected = self.stats.rejected_total(),
            format = %self.detector.format(),
            "stream ended"
        );
        Ok(self.stats)
    }
}

/// Read one `\n`-terminated line into `raw`, keeping at most `max_len`
/// content bytes. An overlong line is consumed up to its newline and dropped.
async fn read_bounded_line<R>(reader: &mut R, raw: &mut Vec<u8>, max_len: usize) -> io::Result<RawLine>
where
    R: AsyncBufRead + Unpin,
{
    let mut read_any = false;
    let mut too_long = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (read_any, too_long) {
                (false, _) => RawLine::Eof,
                (true, true) => RawLine::TooLong,
                (true, false) => RawLine::Line,
            });
        }
        read_any = true;

        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        if !too_long {
            let content = used - usize::from(done);
            if raw.len() + content > max_len {
                too_long = true;
                raw.clear();
            } else {
                raw.extend_from_slice(&available[..used]);
            }
        }
        reader.consume(used);

        if done {
            return Ok(if too_long { RawLine::TooLong } else { RawLine::Line });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session(buffer: &SharedBuffer) -> StreamSession {
        StreamSession::new(&StreamConfig::default(), buffer.clone(), EventBus::new(64))
    }

    #[test]
    fn test_structured_lines_fill_buffer() {
        let buffer = SharedBuffer::new(100);
        let mut session = session(&buffer);
        for i in 1..=3 {
            session.ingest_line(&format!("DATA,{},{},50,70,OK\n", i * 4, 100 + i));
        }
        assert_eq!(session.format(), StreamFormat::Structured);
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.samples()[2].ecg_value, 103.0);
        assert_eq!(snapshot.samples()[2].sequence_index, 2);
    }

    #[test]
    fn test_device_messages_are_not_samples() {
        let buffer = SharedBuffer::new(100);
        let mut session = session(&buffer);
        let outcome = session.ingest_line("ERROR,Lead off detected");
        assert_eq!(
            outcome,
            LineOutcome::Device(DeviceMessage {
                level: DeviceLevel::Error,
                text: "Lead off detected".to_string()
            })
        );
        assert!(buffer.is_empty());
        assert_eq!(session.stats().device_messages, 1);
        assert!(!session.detector.is_locked());
        assert_eq!(session.detector.observed(), 0);
    }

    #[test]
    fn test_rejects_are_counted() {
        let buffer = SharedBuffer::new(100);
        let mut session = session(&buffer);
        session.ingest_line("DATA,1,100,50,70,OK");
        session.ingest_line("DATA,2,abc,50,70,OK");
        session.ingest_line("");
        session.ingest_line("DATA,3,100");
        session.ingest_line("DATA,4,101,50,70,OK");

        let stats = session.stats();
        assert_eq!(stats.lines, 5);
        assert_eq!(stats.samples, 2);
        assert_eq!(stats.rejected["non_numeric_field"], 1);
        assert_eq!(stats.rejected["wrong_field_count"], 1);
        assert_eq!(stats.rejected["empty_line"], 1);

        // Rejected lines consume sequence numbers
        let indices: Vec<u64> = buffer
            .snapshot()
            .samples()
            .iter()
            .map(|s| s.sequence_index)
            .collect();
        assert_eq!(indices, vec![0, 3]);
    }

    #[test]
    fn test_reset_clears_lock_and_counters() {
        let buffer = SharedBuffer::new(100);
        let mut session = session(&buffer);
        session.ingest_line("DATA,1,100,50,70,OK");
        session.reset();
        assert_eq!(session.format(), StreamFormat::Unknown);
        assert_eq!(session.stats(), &IngestStats::default());
    }

    #[tokio::test]
    async fn test_run_reads_to_eof() {
        let buffer = SharedBuffer::new(100);
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let session = StreamSession::new(&StreamConfig::default(), buffer.clone(), events);

        // Invalid UTF-8 breaks the bare run; five clean lines after it lock
        let input: &[u8] = b"12\r\n-3\n\xff\xfe\n7\n8\n9\n10\n11";
        let stats = session.run(input).await.unwrap();

        assert_eq!(stats.lines, 8);
        assert_eq!(stats.samples, 7);
        assert_eq!(stats.rejected_total(), 1);
        assert_eq!(buffer.len(), 7);

        let mut locked = None;
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::FormatLocked(format) = event {
                locked = Some(format);
            }
        }
        assert_eq!(locked, Some(StreamFormat::BareNumeric));
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped() {
        let buffer = SharedBuffer::new(100);
        let config = StreamConfig {
            max_line_len: 64,
            ..Default::default()
        };
        let session = StreamSession::new(&config, buffer.clone(), EventBus::new(64));

        let mut input = vec![b'x'; 64 * 1024];
        input.extend_from_slice(b"\n-5\n");
        let reader = tokio::io::BufReader::with_capacity(16, &input[..]);
        let stats = session.run(reader).await.unwrap();

        assert_eq!(stats.lines, 2);
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.rejected.get("line_too_long"), Some(&1));
        assert_eq!(stats.rejected_total(), 1);
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.samples()[0].ecg_value, -5.0);
        // The skipped line still took a sequence number
        assert_eq!(snapshot.samples()[0].sequence_index, 1);
    }

    #[tokio::test]
    async fn test_line_at_limit_and_unterminated_tail() {
        let mut raw = Vec::new();
        let mut reader = &b"1234\n12345\n123"[..];
        assert_eq!(read_bounded_line(&mut reader, &mut raw, 4).await.unwrap(), RawLine::Line);
        assert_eq!(raw, b"1234\n");
        raw.clear();
        assert_eq!(read_bounded_line(&mut reader, &mut raw, 4).await.unwrap(), RawLine::TooLong);
        assert!(raw.is_empty());
        assert_eq!(read_bounded_line(&mut reader, &mut raw, 4).await.unwrap(), RawLine::Line);
        assert_eq!(raw, b"123");
        raw.clear();
        assert_eq!(read_bounded_line(&mut reader, &mut raw, 4).await.unwrap(), RawLine::Eof);
    }

    #[test]
    fn test_clock_reset_is_rebased() {
        let buffer = SharedBuffer::new(100);
        let mut session = session(&buffer);
        for t in [100_000, 100_004, 100_008] {
            session.ingest_line(&format!("DATA,{t},500,0,60,OK"));
        }
        session.ingest_line("INFO,device restarted");
        for t in [0, 4, 8] {
            session.ingest_line(&format!("DATA,{t},500,0,60,OK"));
        }

        let timestamps = buffer.snapshot().timestamps();
        assert_eq!(timestamps.len(), 6);
        let expected = [100.0, 100.004, 100.008, 100.012, 100.016, 100.020];
        for (got, want) in timestamps.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{timestamps:?}");
        }
        assert_eq!(session.stats().clock_resets, 1);
    }
}
