use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Tracks the last terminal activity (PTY output or input) of a session.
///
/// Each activity event increments a monotonic generation counter, so a
/// caller can tell whether anything happened between two observations.
#[derive(Clone)]
pub struct ActivityTracker {
    last: Arc<Mutex<(Instant, DateTime<Utc>)>>,
    generation: Arc<AtomicU64>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    /// Create a new tracker seeded with the current instant.
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new((Instant::now(), Utc::now()))),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record activity. Safe to call from blocking threads.
    pub fn touch(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        *self.last.lock() = (Instant::now(), Utc::now());
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Milliseconds since the last activity.
    pub fn last_activity_ms(&self) -> u64 {
        self.last.lock().0.elapsed().as_millis() as u64
    }

    /// Wall-clock time of the last activity, for display.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last.lock().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn touch_bumps_generation() {
        let tracker = ActivityTracker::new();
        assert_eq!(tracker.generation(), 0);
        tracker.touch();
        tracker.touch();
        assert_eq!(tracker.generation(), 2);
    }

    #[test]
    fn touch_resets_elapsed_time() {
        let tracker = ActivityTracker::new();
        std::thread::sleep(Duration::from_millis(30));
        assert!(tracker.last_activity_ms() >= 30);
        let before = tracker.last_activity_at();
        tracker.touch();
        assert!(tracker.last_activity_ms() < 30);
        assert!(tracker.last_activity_at() >= before);
    }

    #[test]
    fn clones_share_state() {
        let tracker = ActivityTracker::new();
        let clone = tracker.clone();
        clone.touch();
        assert_eq!(tracker.generation(), 1);
    }
}
