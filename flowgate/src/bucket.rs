//! Per-bucket event counters.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::ring::RingBucket;

/// Kinds of events recorded for an entry over its lifetime.
///
/// `Rt` is special: it accumulates response-time milliseconds rather than an
/// occurrence count, so averages can be derived per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    /// Entry passed all rule checks.
    Pass = 0,
    /// Entry was rejected by a rule check.
    Block = 1,
    /// A passed entry finished and exited.
    Complete = 2,
    /// A passed entry finished with a traced error.
    Error = 3,
    /// Cumulative response time of completed entries, in milliseconds.
    Rt = 4,
}

pub(crate) const METRIC_EVENT_COUNT: usize = 5;

/// Counters for a single fixed-duration window of time.
///
/// Every counter is an independent atomic; within one bucket lifetime they
/// only grow. Resetting the bucket (on ring advancement) zeroes them all.
#[derive(Debug)]
pub struct MetricBucket {
    counters: [AtomicU64; METRIC_EVENT_COUNT],
}

impl MetricBucket {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn add(&self, event: MetricEvent, count: u64) {
        self.counters[event as usize].fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, event: MetricEvent) -> u64 {
        self.counters[event as usize].load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for MetricBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBucket for MetricBucket {
    fn new_empty() -> Self {
        Self::new()
    }

    fn reset(&self) {
        self.reset_counters();
    }
}
