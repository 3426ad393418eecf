//! Rolling sample buffer
//!
//! A fixed-capacity ring of samples in arrival order. The ingestion path is
//! the only writer; readers take a [`BufferSnapshot`], a point-in-time copy of
//! the sample handles taken under one lock, so they never see a half-evicted
//! window.

use crate::types::Sample;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Upper bound on up-front allocation; larger buffers grow on demand
const PREALLOC_LIMIT: usize = 1 << 16;

/// Ring buffer of the most recent samples
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    samples: VecDeque<Arc<Sample>>,
    capacity: usize,
}

impl RollingBuffer {
    /// Create a buffer holding at most `capacity` samples (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity.min(PREALLOC_LIMIT)),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest one first when full.
    ///
    /// Returns the evicted sample, if any.
    pub fn push(&mut self, sample: Arc<Sample>) -> Option<Arc<Sample>> {
        debug_assert!(
            self.samples
                .back()
                .map_or(true, |last| last.sequence_index <= sample.sequence_index),
            "samples must arrive in sequence order"
        );
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn latest(&self) -> Option<&Arc<Sample>> {
        self.samples.back()
    }

    /// Read-only copy of the current contents, oldest first
    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            samples: self.samples.iter().cloned().collect(),
        }
    }
}

/// Immutable view of the buffer at one instant
#[derive(Debug, Clone, Default)]
pub struct BufferSnapshot {
    samples: Vec<Arc<Sample>>,
}

impl BufferSnapshot {
    pub fn from_samples(samples: Vec<Arc<Sample>>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[Arc<Sample>] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time covered by the window in seconds
    pub fn duration_s(&self) -> f64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).max(0.0),
            _ => 0.0,
        }
    }

    pub fn ecg_values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.ecg_value).collect()
    }

    pub fn timestamps(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.timestamp).collect()
    }
}

/// Buffer handle shared between the ingestion task and readers
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    inner: Arc<Mutex<RollingBuffer>>,
}

impl SharedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RollingBuffer::new(capacity))),
        }
    }

    pub fn push(&self, sample: Arc<Sample>) -> Option<Arc<Sample>> {
        self.inner.lock().push(sample)
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        self.inner.lock().snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
