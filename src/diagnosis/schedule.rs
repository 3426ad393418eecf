//! Periodic diagnosis
//!
//! A background task ticks at a fixed interval and fires
//! `trigger(TriggerSource::Timer)` while enabled. Ticks that land while a
//! request is in flight, or before enough signal is buffered, are dropped;
//! the next tick tries again.

use crate::diagnosis::orchestrator::{DiagnosisOrchestrator, TriggerError};
use crate::types::TriggerSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Shortest accepted tick interval
const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct AutoDiagnosis {
    enabled: Arc<AtomicBool>,
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl AutoDiagnosis {
    /// Spawn the scheduler task. The first tick happens one interval from now.
    ///
    /// Intervals shorter than one second are raised to one second.
    pub fn spawn(orchestrator: DiagnosisOrchestrator, interval: Duration, enabled: bool) -> Self {
        if interval < MIN_INTERVAL {
            warn!(requested = ?interval, "auto diagnosis interval too short, using 1 s");
        }
        let interval = interval.max(MIN_INTERVAL);
        let enabled = Arc::new(AtomicBool::new(enabled));
        let flag = Arc::clone(&enabled);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !flag.load(Ordering::Relaxed) {
                    continue;
                }
                match orchestrator.trigger(TriggerSource::Timer) {
                    Ok(request_id) => debug!(%request_id, "timer triggered diagnosis"),
                    Err(TriggerError::Busy { in_flight }) => {
                        debug!(%in_flight, "timer tick dropped, request in flight")
                    }
                    Err(TriggerError::InsufficientData(e)) => {
                        debug!(error = %e, "timer tick dropped")
                    }
                }
            }
        });

        Self {
            enabled,
            interval,
            handle: Some(handle),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, interval_s = self.interval.as_secs(), "auto diagnosis toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop the scheduler task. An in-flight request is left alone.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for AutoDiagnosis {
    fn drop(&mut self) {
        self.stop();
    }
}
