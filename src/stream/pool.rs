//! Reusable frame buffers for the token hot path. One buffer per in-flight
//! frame serialization instead of one allocation per token; oversized
//! buffers are dropped on recycle so a single huge chunk cannot pin memory
//! for the life of the pool.

use std::sync::{Arc, Mutex};

/// Idle buffers kept at most.
const DEFAULT_MAX_IDLE: usize = 64;

/// Buffers that grew beyond this are not recycled.
const DEFAULT_MAX_ENTRY_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct FramePool {
    idle: Arc<Mutex<Vec<Vec<u8>>>>,
    max_idle: usize,
    max_entry_bytes: usize,
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE, DEFAULT_MAX_ENTRY_BYTES)
    }
}

impl FramePool {
    pub fn new(max_idle: usize, max_entry_bytes: usize) -> Self {
        Self {
            idle: Arc::new(Mutex::new(Vec::new())),
            max_idle,
            max_entry_bytes,
        }
    }

    /// Take a cleared buffer, reusing an idle one when available.
    pub fn acquire(&self) -> Vec<u8> {
        let mut idle = self.idle.lock().expect("pool lock poisoned");
        idle.pop().unwrap_or_default()
    }

    /// Return a buffer. Oversized or surplus buffers are dropped.
    pub fn recycle(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.max_entry_bytes {
            return;
        }
        buf.clear();
        let mut idle = self.idle.lock().expect("pool lock poisoned");
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_buffer_is_reused() {
        let pool = FramePool::new(4, 1024);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"hello");
        let cap = buf.capacity();
        pool.recycle(buf);

        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn oversized_buffers_are_discarded() {
        let pool = FramePool::new(4, 64);
        let mut buf = pool.acquire();
        buf.reserve(1024);
        pool.recycle(buf);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn idle_count_is_capped() {
        let pool = FramePool::new(2, 1024);
        for _ in 0..5 {
            pool.recycle(Vec::with_capacity(16));
        }
        assert_eq!(pool.idle_count(), 2);
    }
}
