//! Bounded in-memory ring of recent routing decisions. Deliberately not
//! persisted anywhere; the ring is the whole history.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

const DEFAULT_CAPACITY: usize = 256;

/// One routing decision as recorded for observability.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedDecision {
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    pub model: String,
    pub backend_id: String,
    pub reason: String,
    pub score: f64,
    pub queue_depth: u32,
    pub alternatives: Vec<String>,
    pub mode: String,
}

#[derive(Debug, Clone)]
pub struct DecisionRing {
    inner: Arc<Mutex<VecDeque<RecordedDecision>>>,
    capacity: usize,
}

impl Default for DecisionRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DecisionRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, decision: RecordedDecision) {
        let mut ring = self.inner.lock().expect("ring lock poisoned");
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(decision);
    }

    /// Most recent decisions, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RecordedDecision> {
        let ring = self.inner.lock().expect("ring lock poisoned");
        ring.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ring lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
