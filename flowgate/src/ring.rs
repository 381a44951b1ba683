//! Circular array of timestamped statistic buckets covering a sliding window.
//!
//! The ring is sized so that `sample_count` buckets of `bucket_length_ms`
//! each cover `interval_ms` of history. For example, with `sample_count = 5`
//! and `interval_ms = 1000` the bucket length is 200ms:
//!
//! ```text
//!   B0       B1      B2      B3      B4
//!   |_______|_______|_______|_______|_______|
//!  1000    1200    1400    1600    1800   (2000) ms
//!         ^
//!      time=1188
//! ```
//!
//! The hot path (locating the bucket for `now`) is a single atomic load and
//! compare. Only ring advancement, where a slot a full lap behind is
//! refreshed in place, takes the update mutex, and only via `try_lock`;
//! losers yield and retry rather than blocking.

use std::sync::Mutex;
use std::sync::TryLockError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;

use crate::clock;

/// Errors produced when constructing or advancing a ring.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// `interval_ms` must divide evenly into `sample_count` buckets.
    #[error("invalid ring parameters: interval {interval_ms}ms, sample count {sample_count}")]
    InvalidParameters { sample_count: u32, interval_ms: u32 },

    /// The queried time is older than the bucket the slot already holds.
    #[error("provided time {now} is behind the held bucket start {held_start}")]
    TimePast { now: u64, held_start: u64 },
}

/// Payload stored in a ring slot. Construction and in-place refresh must be
/// possible behind a shared reference, so counters use interior mutability.
pub trait RingBucket: Send + Sync + 'static {
    fn new_empty() -> Self;

    /// Zero all counters. Called under the ring's update lock right before
    /// the new start timestamp is published.
    fn reset(&self);
}

/// A ring slot: a bucket plus the start timestamp of the window it covers.
///
/// The start is published with `Release` ordering after a reset so readers
/// that observe the new start see zeroed counters. A reader racing the reset
/// can observe zeroed counters under the old start; that window is tolerated
/// and bounded by a single reset.
#[derive(Debug)]
pub struct BucketWrap<B> {
    start: AtomicU64,
    bucket: B,
}

impl<B> BucketWrap<B> {
    /// Start timestamp (ms) of the window `[start, start + bucket_length)`.
    #[inline]
    pub fn start(&self) -> u64 {
        self.start.load(Ordering::Acquire)
    }

    #[inline]
    pub fn bucket(&self) -> &B {
        &self.bucket
    }
}

/// Lock-free sliding window over `sample_count` buckets of equal length.
#[derive(Debug)]
pub struct BucketRing<B> {
    bucket_length_ms: u32,
    sample_count: u32,
    interval_ms: u32,
    slots: Box<[BucketWrap<B>]>,
    update_lock: Mutex<()>,
}

impl<B: RingBucket> BucketRing<B> {
    pub fn new(sample_count: u32, interval_ms: u32) -> Result<Self, RingError> {
        Self::new_at(sample_count, interval_ms, clock::now_millis())
    }

    /// Construct with an explicit "now", pre-filling every slot with the
    /// start time it will cover on its next turn. Slots ahead of the current
    /// index receive future starts, so the first visit to each slot hits the
    /// lock-free fast path.
    pub(crate) fn new_at(sample_count: u32, interval_ms: u32, now: u64) -> Result<Self, RingError> {
        if sample_count == 0 || interval_ms % sample_count != 0 {
            return Err(RingError::InvalidParameters {
                sample_count,
                interval_ms,
            });
        }
        let bucket_length_ms = interval_ms / sample_count;
        let len = sample_count as usize;
        let idx = ((now / bucket_length_ms as u64) % sample_count as u64) as usize;

        let mut starts = vec![0u64; len];
        let mut start = now - now % bucket_length_ms as u64;
        for slot in starts.iter_mut().skip(idx) {
            *slot = start;
            start += bucket_length_ms as u64;
        }
        for slot in starts.iter_mut().take(idx) {
            *slot = start;
            start += bucket_length_ms as u64;
        }

        let slots = starts
            .into_iter()
            .map(|s| BucketWrap {
                start: AtomicU64::new(s),
                bucket: B::new_empty(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            bucket_length_ms,
            sample_count,
            interval_ms,
            slots,
            update_lock: Mutex::new(()),
        })
    }

    #[inline]
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    #[inline]
    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    #[inline]
    pub fn bucket_length_ms(&self) -> u32 {
        self.bucket_length_ms
    }

    #[inline]
    fn index_of(&self, now: u64) -> usize {
        ((now / self.bucket_length_ms as u64) % self.sample_count as u64) as usize
    }

    /// The bucket whose window contains the current wall time.
    pub fn current_bucket(&self) -> Result<&BucketWrap<B>, RingError> {
        self.bucket_of_time(clock::now_millis())
    }

    /// The bucket whose window contains `now`, advancing the ring if the
    /// slot still holds a start a full lap behind.
    pub fn bucket_of_time(&self, now: u64) -> Result<&BucketWrap<B>, RingError> {
        let idx = self.index_of(now);
        let target_start = now - now % self.bucket_length_ms as u64;

        loop {
            let wrap = &self.slots[idx];
            let held = wrap.start.load(Ordering::Acquire);

            if held == target_start {
                return Ok(wrap);
            }

            if held < target_start {
                // Stale slot from a previous lap. Refresh it in place under
                // the update lock; contenders yield and re-check.
                match self.update_lock.try_lock() {
                    Ok(_guard) => {
                        wrap.bucket.reset();
                        wrap.start.store(target_start, Ordering::Release);
                        return Ok(wrap);
                    }
                    Err(TryLockError::WouldBlock) => {
                        thread::yield_now();
                        continue;
                    }
                    Err(TryLockError::Poisoned(poison)) => {
                        let _guard = poison.into_inner();
                        wrap.bucket.reset();
                        wrap.start.store(target_start, Ordering::Release);
                        return Ok(wrap);
                    }
                }
            }

            // held > target_start: the caller's time is older than what the
            // ring already holds. With a single slot this is an expected
            // race; otherwise it is an input error.
            if self.sample_count == 1 {
                return Ok(wrap);
            }
            return Err(RingError::TimePast {
                now,
                held_start: held,
            });
        }
    }

    /// All buckets that are not expired relative to the current wall time.
    pub fn values(&self) -> Vec<&BucketWrap<B>> {
        self.values_with_time(clock::now_millis())
    }

    pub fn values_with_time(&self, now: u64) -> Vec<&BucketWrap<B>> {
        self.slots
            .iter()
            .filter(|w| !self.is_deprecated(now, w))
            .collect()
    }

    /// Non-expired buckets whose start timestamp satisfies `predicate`.
    pub fn values_conditional(
        &self,
        now: u64,
        predicate: impl Fn(u64) -> bool,
    ) -> Vec<&BucketWrap<B>> {
        self.slots
            .iter()
            .filter(|w| !self.is_deprecated(now, w) && predicate(w.start()))
            .collect()
    }

    /// A bucket is expired once its start has fallen out of the window.
    /// Future starts (from ring pre-fill) wrap the subtraction and are
    /// excluded the same way.
    #[inline]
    fn is_deprecated(&self, now: u64, wrap: &BucketWrap<B>) -> bool {
        now.wrapping_sub(wrap.start()) > self.interval_ms as u64
    }
}
