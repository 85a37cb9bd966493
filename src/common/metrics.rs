//! Writer statistics
//!
//! # Design Principles (KISS)
//! - Lock-free atomic counters for the hot path
//! - Simple snapshot mechanism for reporting
//! - Producers touch `published` only; everything else belongs to the consumer

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared between producers, the consumer and reporters
///
/// All operations use Relaxed ordering. Statistics are eventually
/// consistent, which is acceptable for monitoring.
#[derive(Debug, Default)]
pub struct WriterStats {
    /// Records accepted by `publish`
    pub published: AtomicU64,
    /// Records written to a file
    pub written: AtomicU64,
    /// Records dropped by the fault policy
    pub dropped: AtomicU64,
    /// Encoded bytes written (length prefixes included)
    pub bytes: AtomicU64,
    /// Files finalized and closed
    pub files_closed: AtomicU64,
    /// Rolls performed
    pub rolls: AtomicU64,
}

impl WriterStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_written(&self, bytes: u64) {
        self.written.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_files_closed(&self) {
        self.files_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rolls(&self) {
        self.rolls.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of current values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            files_closed: self.files_closed.load(Ordering::Relaxed),
            rolls: self.rolls.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `WriterStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub published: u64,
    pub written: u64,
    pub dropped: u64,
    pub bytes: u64,
    pub files_closed: u64,
    pub rolls: u64,
}

impl StatsSnapshot {
    /// Records published but neither written nor dropped yet
    pub fn pending(&self) -> u64 {
        self.published
            .saturating_sub(self.written)
            .saturating_sub(self.dropped)
    }

    /// Throughput in records per second over `elapsed_secs`
    pub fn write_rate(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs > 0.0 {
            self.written as f64 / elapsed_secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = WriterStats::new();
        stats.inc_published();
        stats.inc_published();
        stats.inc_published();
        stats.record_written(154);
        stats.inc_dropped();
        stats.inc_rolls();
        stats.inc_files_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.published, 3);
        assert_eq!(snap.written, 1);
        assert_eq!(snap.bytes, 154);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.rolls, 1);
        assert_eq!(snap.files_closed, 1);
        assert_eq!(snap.pending(), 1);
    }

    #[test]
    fn test_write_rate() {
        let snap = StatsSnapshot {
            written: 1000,
            ..Default::default()
        };
        assert!((snap.write_rate(2.0) - 500.0).abs() < f64::EPSILON);
        assert_eq!(snap.write_rate(0.0), 0.0);
    }
}
