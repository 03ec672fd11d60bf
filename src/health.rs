//! Collector liveness tracking.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Last-activity heartbeat for a collector.
///
/// Written by the owning collector on every observed unit of work (one chat
/// item, one stats poll); read by the watchdogs to detect staleness.
#[derive(Debug)]
pub struct CollectorHealth {
    last_beat: Mutex<Instant>,
}

impl CollectorHealth {
    pub fn new() -> Self {
        Self {
            last_beat: Mutex::new(Instant::now()),
        }
    }

    /// Record one unit of work.
    pub fn beat(&self) {
        *self.last_beat.lock() = Instant::now();
    }

    /// Time since the last recorded unit of work.
    pub fn idle_for(&self) -> Duration {
        self.last_beat.lock().elapsed()
    }

    /// Whether the collector has been idle longer than `timeout`.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }
}

impl Default for CollectorHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beat_resets_idle() {
        let health = CollectorHealth::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(health.is_stale(Duration::from_millis(10)));

        health.beat();
        assert!(!health.is_stale(Duration::from_millis(10)));
    }
}
