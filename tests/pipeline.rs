//! End-to-end ingestion scenarios

use ecg_receiver::config::StreamConfig;
use ecg_receiver::events::PipelineEvent;
use ecg_receiver::session::LineOutcome;
use ecg_receiver::types::{DeviceLevel, SampleStatus};
use ecg_receiver::{
    AppConfig, EventBus, FeatureExtractor, SharedBuffer, StreamFormat, StreamSession,
};
use pretty_assertions::assert_eq;

fn structured_lines() -> Vec<String> {
    (1..=20u32)
        .map(|i| {
            let step = i - 1;
            format!(
                "DATA,{},{},{},{},OK",
                i,
                100 + step * 5 / 19,
                50 + step * 2 / 19,
                70 + step * 2 / 19
            )
        })
        .collect()
}

#[test]
fn test_twenty_structured_lines_fill_buffer_at_full_density() {
    let lines = structured_lines();
    assert_eq!(lines[0], "DATA,1,100,50,70,OK");
    assert_eq!(lines[19], "DATA,20,105,52,72,OK");

    let buffer = SharedBuffer::new(2000);
    let mut session = StreamSession::new(&StreamConfig::default(), buffer.clone(), EventBus::new(64));
    for line in &lines {
        assert!(matches!(session.ingest_line(line), LineOutcome::Sample(_)));
    }

    assert_eq!(session.format(), StreamFormat::Structured);
    assert_eq!(session.stats().rejected_total(), 0);

    let snapshot = buffer.snapshot();
    assert_eq!(snapshot.len(), 20);
    let first = &snapshot.samples()[0];
    assert_eq!(first.ecg_value, 100.0);
    assert_eq!(first.resp_value, Some(50.0));
    assert_eq!(first.heart_rate_hint, Some(70.0));
    assert_eq!(first.status, Some(SampleStatus::Ok));
    assert_eq!(snapshot.samples()[19].ecg_value, 105.0);

    let quality = FeatureExtractor::default().quality(&snapshot);
    assert!((quality.density - 1.0).abs() < 1e-9, "density {}", quality.density);
    assert!(quality.score > 0.0);
}

#[test]
fn test_bare_numeric_lines_lock_and_decode() {
    let buffer = SharedBuffer::new(2000);
    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let mut session = StreamSession::new(&StreamConfig::default(), buffer.clone(), events);

    for line in ["-7", "-6", "-5", "1024", "1050"] {
        assert!(matches!(session.ingest_line(line), LineOutcome::Sample(_)));
    }

    assert_eq!(session.format(), StreamFormat::BareNumeric);
    assert_eq!(session.stats().rejected_total(), 0);
    let values: Vec<f64> = buffer.snapshot().ecg_values();
    assert_eq!(values, vec![-7.0, -6.0, -5.0, 1024.0, 1050.0]);

    let mut locks = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::FormatLocked(format) = event {
            locks.push(format);
        }
    }
    assert_eq!(locks, vec![StreamFormat::BareNumeric]);
}

#[test]
fn test_capacity_keeps_most_recent_samples() {
    let config = StreamConfig {
        buffer_capacity: 50,
        ..Default::default()
    };
    let buffer = SharedBuffer::new(config.buffer_capacity);
    let mut session = StreamSession::new(&config, buffer.clone(), EventBus::new(8));
    for i in 0..180 {
        session.ingest_line(&format!("DATA,{},{},0,60,OK", i * 4, i));
    }

    let snapshot = buffer.snapshot();
    assert_eq!(snapshot.len(), 50);
    let indices: Vec<u64> = snapshot.samples().iter().map(|s| s.sequence_index).collect();
    assert_eq!(indices, (130..180).collect::<Vec<u64>>());
}

#[test]
fn test_mixed_stream_with_device_messages_and_noise() {
    let buffer = SharedBuffer::new(2000);
    let mut session = StreamSession::new(&StreamConfig::default(), buffer.clone(), EventBus::new(64));
    let input = [
        "INFO,ECG monitor ready",
        "",
        "DATA,0,512,300,72,OK",
        "DATA,4,530,301,72,OK",
        "512",
        "ERROR,Lead off",
        "DATA,8,nan,302,72,OK",
        "DATA,12,540,303,72,WARN",
    ];
    let outcomes: Vec<LineOutcome> = input.iter().map(|line| session.ingest_line(line)).collect();

    assert!(matches!(&outcomes[0], LineOutcome::Device(m) if m.level == DeviceLevel::Info));
    assert!(matches!(&outcomes[5], LineOutcome::Device(m) if m.level == DeviceLevel::Error));
    // Locked to structured: bare numbers are rejected
    assert!(matches!(outcomes[4], LineOutcome::Rejected(_)));
    assert!(matches!(outcomes[6], LineOutcome::Rejected(_)));

    let stats = session.stats();
    assert_eq!(stats.lines, 8);
    assert_eq!(stats.samples, 3);
    assert_eq!(stats.device_messages, 2);
    assert_eq!(stats.rejected_total(), 3);

    let last = buffer.snapshot().samples()[2].clone();
    assert_eq!(last.status, Some(SampleStatus::Warn));
    assert!((last.timestamp - 0.012).abs() < 1e-12);
}

#[test]
fn test_device_clock_reset_keeps_window_usable() {
    let buffer = SharedBuffer::new(2000);
    let mut session = StreamSession::new(&StreamConfig::default(), buffer.clone(), EventBus::new(8));
    let line = |t: u32, i: u32| {
        let ecg = if i % 200 == 100 { 1200 } else { 500 + i % 9 };
        format!("DATA,{t},{ecg},410,75,OK")
    };

    for i in 0..1500u32 {
        session.ingest_line(&line(100_000 + i * 4, i));
    }
    session.ingest_line("INFO,device restarted");
    for i in 1500..2000u32 {
        session.ingest_line(&line((i - 1500) * 4, i));
    }
    assert_eq!(session.stats().clock_resets, 1);

    let snapshot = buffer.snapshot();
    assert_eq!(snapshot.len(), 2000);
    assert!((snapshot.duration_s() - 7.996).abs() < 1e-6, "duration {}", snapshot.duration_s());

    let features = FeatureExtractor::default().extract(&snapshot).unwrap();
    assert!(features.rr_intervals_ms.iter().all(|rr| *rr > 0.0));
    assert!((features.heart_rate_bpm.unwrap() - 75.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_recording_through_monitor_yields_features() {
    use ecg_receiver::diagnosis::DiagnosisBackend;
    use ecg_receiver::{DiagnosisError, DiagnosisRequest, EcgMonitor};
    use std::sync::Arc;

    struct Unused;

    #[async_trait::async_trait]
    impl DiagnosisBackend for Unused {
        async fn submit(&self, _request: &DiagnosisRequest) -> Result<String, DiagnosisError> {
            Err(DiagnosisError::Network("unused".to_string()))
        }
    }

    // 8 s at 250 Hz with an R wave every 0.8 s (75 bpm)
    let recording: String = (0..2000u32)
        .map(|i| {
            let ecg = match i % 200 {
                99 | 101 => 600,
                100 => 1200,
                n => 500 + (n % 9) as i32,
            };
            format!("DATA,{},{},410,75,OK\n", i * 4, ecg)
        })
        .collect();

    let mut monitor = EcgMonitor::new(AppConfig::default(), Arc::new(Unused));
    monitor.connect(std::io::Cursor::new(recording.into_bytes()));
    let stats = monitor.wait().await.unwrap().unwrap();
    assert_eq!(stats.samples, 2000);

    let features = monitor.features().unwrap();
    assert_eq!(features.peak_count(), 10);
    assert!((features.heart_rate_bpm.unwrap() - 75.0).abs() < 1e-6);
    assert!(features.hrv.unwrap().rhythm_regular);
    assert!((features.sample_rate_hz - 250.0).abs() < 1e-6);
    assert!(features.quality_score > 0.5);
    monitor.shutdown();
}
