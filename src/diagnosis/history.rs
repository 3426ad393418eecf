//! Bounded diagnosis history, newest last

use crate::types::DiagnosisResult;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DiagnosisHistory {
    entries: VecDeque<Arc<DiagnosisResult>>,
    max_len: usize,
}

impl DiagnosisHistory {
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.max(1);
        Self {
            entries: VecDeque::with_capacity(max_len),
            max_len,
        }
    }

    /// Append a result, dropping the oldest entry when full.
    pub fn push(&mut self, result: Arc<DiagnosisResult>) {
        if self.entries.len() == self.max_len {
            self.entries.pop_front();
        }
        self.entries.push_back(result);
    }

    pub fn latest(&self) -> Option<&Arc<DiagnosisResult>> {
        self.entries.back()
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DiagnosisResult>> {
        self.entries.iter()
    }

    /// The `n` most recent entries, newest first
    pub fn recent(&self, n: usize) -> Vec<Arc<DiagnosisResult>> {
        self.entries.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Owned copy of every entry, oldest first, for serialization
    pub fn export(&self) -> Vec<DiagnosisResult> {
        self.entries.iter().map(|r| (**r).clone()).collect()
    }
}
