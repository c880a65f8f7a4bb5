//! Per-backend in-flight accounting, weighted by priority.
//!
//! Every routed request holds an [`InFlightGuard`] for its lifetime; the
//! guard's `Drop` is the only `mark_end` path, so start/end pairing holds on
//! success, failure, timeout and cancellation alike. Counters are plain
//! integers behind a sync lock — the mark paths never await.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use super::annotations::Priority;

/// Queues idle longer than this with non-zero counts are reported by the
/// auditor as probable guard leaks.
const AUDIT_IDLE_AFTER: Duration = Duration::from_secs(600);

/// Auditor cadence.
const AUDIT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct BackendQueue {
    pending: u32,
    counts: [u32; Priority::COUNT],
    last_transition: Instant,
}

impl BackendQueue {
    fn new() -> Self {
        Self {
            pending: 0,
            counts: [0; Priority::COUNT],
            last_transition: Instant::now(),
        }
    }
}

/// Point-in-time view of one backend's queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub pending: u32,
    pub counts: [u32; Priority::COUNT],
}

/// Cloning is cheap — clones share the same underlying data via Arc.
#[derive(Debug, Clone, Default)]
pub struct QueueManager {
    inner: Arc<RwLock<HashMap<String, BackendQueue>>>,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request in. The returned guard counts it back out on drop.
    pub fn mark_start(&self, backend_id: &str, priority: Priority) -> InFlightGuard {
        {
            let mut inner = self.inner.write().expect("queue lock poisoned");
            let queue = inner
                .entry(backend_id.to_string())
                .or_insert_with(BackendQueue::new);
            queue.counts[priority.index()] += 1;
            queue.pending += 1;
            queue.last_transition = Instant::now();
        }
        InFlightGuard {
            inner: Arc::clone(&self.inner),
            backend_id: backend_id.to_string(),
            priority,
        }
    }

    /// Depth the scorer penalizes: `Σ counts[q] * (q+1)` over buckets at or
    /// below the requesting priority.
    pub fn weighted_depth(&self, backend_id: &str, at_or_below: Priority) -> u32 {
        let inner = self.inner.read().expect("queue lock poisoned");
        inner.get(backend_id).map_or(0, |q| {
            q.counts[..=at_or_below.index()]
                .iter()
                .enumerate()
                .map(|(i, &count)| count * (i as u32 + 1))
                .sum()
        })
    }

    /// Total pending requests for one backend.
    pub fn depth(&self, backend_id: &str) -> u32 {
        let inner = self.inner.read().expect("queue lock poisoned");
        inner.get(backend_id).map_or(0, |q| q.pending)
    }

    /// Total in-flight requests across all backends (admission cap input).
    pub fn total_in_flight(&self) -> u32 {
        let inner = self.inner.read().expect("queue lock poisoned");
        inner.values().map(|q| q.pending).sum()
    }

    pub fn snapshot(&self) -> HashMap<String, QueueSnapshot> {
        let inner = self.inner.read().expect("queue lock poisoned");
        inner
            .iter()
            .map(|(id, q)| {
                (
                    id.clone(),
                    QueueSnapshot {
                        pending: q.pending,
                        counts: q.counts,
                    },
                )
            })
            .collect()
    }

    /// Queues with counts but no transitions for ten minutes indicate a
    /// leaked guard somewhere; log them so the leak is visible.
    fn audit(&self) {
        let inner = self.inner.read().expect("queue lock poisoned");
        for (id, queue) in inner.iter() {
            if queue.pending > 0 && queue.last_transition.elapsed() > AUDIT_IDLE_AFTER {
                warn!(
                    backend = %id,
                    pending = queue.pending,
                    idle_secs = queue.last_transition.elapsed().as_secs(),
                    "Queue idle with non-zero counts"
                );
            }
        }
    }

    pub fn spawn_auditor(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(AUDIT_INTERVAL);
            interval.tick().await; // first tick is immediate — skip it
            loop {
                interval.tick().await;
                manager.audit();
            }
        });
    }
}

/// RAII token for one in-flight request. Dropping it is `mark_end`.
pub struct InFlightGuard {
    inner: Arc<RwLock<HashMap<String, BackendQueue>>>,
    backend_id: String,
    priority: Priority,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.write().expect("queue lock poisoned");
        if let Some(queue) = inner.get_mut(&self.backend_id) {
            let bucket = &mut queue.counts[self.priority.index()];
            if *bucket == 0 || queue.pending == 0 {
                warn!(backend = %self.backend_id, "Queue underflow on mark_end");
                return;
            }
            *bucket -= 1;
            queue.pending -= 1;
            queue.last_transition = Instant::now();
        }
    }
}
