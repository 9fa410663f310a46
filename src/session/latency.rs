//! Latency tracking
//!
//! One-way latency is `now - tag` for timestamp-tagged envelopes. Both ends'
//! wall clocks are assumed to be reasonably in sync; skew shows up directly
//! in the figure and is not corrected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::protocol::Tag;

/// Wall clock used for timestamp tags
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;
}

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Latency figures for the last successfully decoded envelope
#[derive(Debug, Default, Clone)]
pub struct LatencyTracker {
    last_latency_ms: i64,
    samples: u64,
    last_probe_rtt: Option<Duration>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the tag of a freshly decoded envelope.
    ///
    /// Counter tags carry no time and leave the figure untouched.
    pub fn observe(&mut self, tag: Tag, now_ms: u64) -> Option<i64> {
        let sent_ms = tag.timestamp_ms()?;
        // Tags are peer-supplied and may sit anywhere in u64
        let latency = (now_ms as i128 - sent_ms as i128)
            .clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        self.last_latency_ms = latency;
        self.samples += 1;
        Some(latency)
    }

    /// Record the round trip of a successful probe
    pub fn observe_probe(&mut self, rtt: Duration) {
        self.last_probe_rtt = Some(rtt);
    }

    /// Latency of the last timestamp-tagged envelope, 0 before any sample
    pub fn last_latency_ms(&self) -> i64 {
        self.last_latency_ms
    }

    /// Number of timestamp samples seen
    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn last_probe_rtt(&self) -> Option<Duration> {
        self.last_probe_rtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay() {
        let mut tracker = LatencyTracker::new();
        assert_eq!(tracker.last_latency_ms(), 0);

        assert_eq!(tracker.observe(Tag::Timestamp(10_000), 10_025), Some(25));
        assert_eq!(tracker.last_latency_ms(), 25);
        assert_eq!(tracker.samples(), 1);
    }

    #[test]
    fn test_skew_is_not_corrected() {
        let mut tracker = LatencyTracker::new();
        // Sender clock ahead of ours
        assert_eq!(tracker.observe(Tag::Timestamp(10_050), 10_000), Some(-50));
        assert_eq!(tracker.last_latency_ms(), -50);
    }

    #[test]
    fn test_far_future_tags_saturate() {
        let mut tracker = LatencyTracker::new();
        let now = 1_715_400_000_000;
        let expected = now as i64 - (1i64 << 62) - (1i64 << 62);
        assert_eq!(tracker.observe(Tag::Timestamp(1 << 63), now), Some(expected));
        assert_eq!(tracker.observe(Tag::Timestamp(u64::MAX), now), Some(i64::MIN));
        assert_eq!(tracker.observe(Tag::Timestamp(0), u64::MAX), Some(i64::MAX));
        assert_eq!(tracker.last_latency_ms(), i64::MAX);
    }

    #[test]
    fn test_counter_tags_ignored() {
        let mut tracker = LatencyTracker::new();
        tracker.observe(Tag::Timestamp(100), 110);
        assert_eq!(tracker.observe(Tag::Counter(5), 500), None);
        assert_eq!(tracker.last_latency_ms(), 10);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_millis(15));
        assert_eq!(clock.now_ms(), 1_015);
        clock.set(5);
        assert_eq!(clock.now_ms(), 5);
        assert!(SystemClock.now_ms() > 1_600_000_000_000);
    }
}
