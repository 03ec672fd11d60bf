//! In-memory durable buffer with a hybrid size/time flush policy.
//!
//! Events wait here between ingestion and persistence. A flush is due when
//! the buffer reaches the size threshold or the oldest buffered event has
//! waited past the flush interval, so low-traffic periods still flush
//! promptly. A failed flush pushes its snapshot back to the front; growth
//! past `size_threshold × overflow_factor` is evicted to backup files
//! instead of growing without bound.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::event::IngestedEvent;

/// Outcome of appending one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Buffered; no flush due yet.
    Buffered,
    /// Buffered, and a flush is now due.
    FlushDue,
}

#[derive(Debug)]
struct BufferInner {
    events: VecDeque<IngestedEvent>,
    last_flush: Instant,
}

/// Ordered buffer of events awaiting flush, single-lock guarded.
///
/// Flush order is FIFO. A flush either removes exactly the snapshot taken
/// under the lock, or the snapshot is returned to the front on total
/// failure; events are never silently discarded.
#[derive(Debug)]
pub struct DurableBuffer {
    inner: Mutex<BufferInner>,
    size_threshold: usize,
    flush_interval: Duration,
    overflow_factor: usize,
}

impl DurableBuffer {
    pub fn new(size_threshold: usize, flush_interval: Duration, overflow_factor: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                events: VecDeque::with_capacity(size_threshold),
                last_flush: Instant::now(),
            }),
            size_threshold,
            flush_interval,
            overflow_factor,
        }
    }

    /// Append one event; the lock is held only for the push.
    pub fn append(&self, event: IngestedEvent) -> AppendOutcome {
        let mut inner = self.inner.lock();
        inner.events.push_back(event);
        if inner.events.len() >= self.size_threshold
            || inner.last_flush.elapsed() >= self.flush_interval
        {
            AppendOutcome::FlushDue
        } else {
            AppendOutcome::Buffered
        }
    }

    /// Whether a flush is due by size or by time.
    pub fn flush_due(&self) -> bool {
        let inner = self.inner.lock();
        !inner.events.is_empty()
            && (inner.events.len() >= self.size_threshold
                || inner.last_flush.elapsed() >= self.flush_interval)
    }

    /// Atomically swap the buffer for an empty one and return the snapshot.
    ///
    /// Producers are never blocked during flush I/O: the swap is the only
    /// part that takes the lock.
    pub fn take_snapshot(&self) -> Vec<IngestedEvent> {
        let mut inner = self.inner.lock();
        inner.last_flush = Instant::now();
        std::mem::take(&mut inner.events).into()
    }

    /// Return a failed snapshot to the front of the buffer, preserving FIFO
    /// order. If the result exceeds `size_threshold × overflow_factor`, the
    /// oldest excess is evicted and returned so the caller can spill it to a
    /// backup file.
    pub fn requeue_front(&self, snapshot: Vec<IngestedEvent>) -> Vec<IngestedEvent> {
        let cap = self.size_threshold.saturating_mul(self.overflow_factor);
        let mut inner = self.inner.lock();
        for event in snapshot.into_iter().rev() {
            inner.events.push_front(event);
        }
        let excess = inner.events.len().saturating_sub(cap);
        inner.events.drain(..excess).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }
}
