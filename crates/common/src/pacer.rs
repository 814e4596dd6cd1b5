//! Frame rate pacing for preview fetches
//!
//! The pacer gates the rate-limited frame-fetch entry point: a fetch is
//! only admitted to the queue when the minimum inter-frame interval has
//! elapsed since the last *delivered* frame. Skipped fetches cost nothing,
//! which keeps a fast polling caller from flooding the queue.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum inter-frame interval enforcer
#[derive(Debug)]
pub struct FramePacer {
    min_interval: Duration,
    last_delivery: Mutex<Option<Instant>>,
}

impl FramePacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_delivery: Mutex::new(None),
        }
    }

    /// Pacer for a frame-rate cap in frames per second
    pub fn from_rate(frames_per_second: u32) -> Self {
        let fps = frames_per_second.max(1);
        Self::new(Duration::from_secs_f64(1.0 / fps as f64))
    }

    /// Whether a fetch may be admitted right now
    ///
    /// Does not consume anything; the pacer is only marked when a frame
    /// is actually delivered.
    pub fn try_admit(&self) -> bool {
        match self.last_delivery.lock() {
            Ok(last) => last.is_none_or(|t| t.elapsed() >= self.min_interval),
            Err(_) => true,
        }
    }

    /// Record a delivered frame, starting a new interval
    pub fn mark_delivered(&self) {
        if let Ok(mut last) = self.last_delivery.lock() {
            *last = Some(Instant::now());
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fetch_admitted() {
        let pacer = FramePacer::new(Duration::from_millis(50));
        assert!(pacer.try_admit());
    }

    #[test]
    fn test_blocks_within_interval() {
        let pacer = FramePacer::new(Duration::from_secs(10));
        pacer.mark_delivered();
        assert!(!pacer.try_admit());
    }

    #[test]
    fn test_admits_after_interval() {
        let pacer = FramePacer::new(Duration::from_millis(10));
        pacer.mark_delivered();
        std::thread::sleep(Duration::from_millis(20));
        assert!(pacer.try_admit());
    }

    #[test]
    fn test_admit_does_not_consume() {
        let pacer = FramePacer::new(Duration::from_secs(10));
        // Repeated checks without a delivery all pass
        assert!(pacer.try_admit());
        assert!(pacer.try_admit());
    }

    #[test]
    fn test_rate_to_interval() {
        let pacer = FramePacer::from_rate(20);
        assert_eq!(pacer.min_interval(), Duration::from_millis(50));

        // Zero rate is clamped rather than dividing by zero
        let pacer = FramePacer::from_rate(0);
        assert_eq!(pacer.min_interval(), Duration::from_secs(1));
    }
}
