//! Bandwidth throttling for object storage I/O.
//!
//! Every storage instance owns a read and a write [`Throttler`] through [`RemoteThrottlers`].
//! Throttlers bound the aggregate bytes per second of all concurrent operations on the instance.
//! Callers that exceed the budget are delayed, never rejected.
//!
//! Throttlers are immutable once built. Applying new settings builds fresh throttlers and swaps
//! them in atomically, so operations holding the previous handle finish against the old limits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Bandwidth limits applied to a storage instance.
///
/// These are server-wide settings passed in through the
/// [`StorageContext`](crate::config::StorageContext).
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ThrottlingSettings {
    /// The maximum read bandwidth in bytes per second.
    ///
    /// Defaults to `None`, meaning reads are not throttled. `0` also disables throttling.
    pub max_read_bandwidth: Option<u64>,

    /// The maximum write bandwidth in bytes per second.
    ///
    /// Defaults to `None`, meaning writes are not throttled. `0` also disables throttling.
    pub max_write_bandwidth: Option<u64>,

    /// The number of bytes that may be transferred at once before throttling kicks in.
    ///
    /// Defaults to `None`, which allows a burst of one second worth of bandwidth.
    pub max_burst: Option<u64>,
}

/// A token bucket limiting throughput in bytes per second.
///
/// Tokens refill at `max_speed` per second up to `max_burst`. Consuming more tokens than are
/// available drives the bucket into debt, and the caller sleeps until the debt is repaid.
#[derive(Debug)]
pub struct Throttler {
    max_speed: f64,
    max_burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

impl Throttler {
    /// Creates a full throttler with the given sustained speed and burst size in bytes.
    ///
    /// A `max_burst` of `0` uses one second worth of `max_speed`.
    pub fn new(max_speed: u64, max_burst: u64) -> Self {
        let max_speed = max_speed.max(1) as f64;
        let max_burst = if max_burst == 0 {
            max_speed
        } else {
            max_burst as f64
        };

        Self {
            max_speed,
            max_burst,
            bucket: Mutex::new(Bucket {
                tokens: max_burst,
                last_update: Instant::now(),
            }),
        }
    }

    /// Returns the sustained speed in bytes per second.
    pub fn max_speed(&self) -> u64 {
        self.max_speed as u64
    }

    /// Consumes `amount` bytes and returns how long the caller has to wait.
    ///
    /// The bucket lock is only held for the arithmetic.
    pub fn reserve(&self, amount: u64) -> Duration {
        // NB: We intentionally use unwrap and crash if the mutex is poisoned.
        let mut bucket = self.bucket.lock().unwrap();

        let now = Instant::now();
        let refill = now.duration_since(bucket.last_update).as_secs_f64() * self.max_speed;
        bucket.tokens = (bucket.tokens + refill).min(self.max_burst);
        bucket.last_update = now;

        bucket.tokens -= amount as f64;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.max_speed)
        }
    }

    /// Consumes `amount` bytes, sleeping as long as the budget is exceeded.
    pub async fn throttle(&self, amount: u64) {
        let delay = self.reserve(amount);
        if !delay.is_zero() {
            tracing::trace!(amount, ?delay, "Throttling transfer");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Consumes `amount` bytes from an optional throttler.
pub(crate) async fn throttle(throttler: Option<&Arc<Throttler>>, amount: u64) {
    if let Some(throttler) = throttler {
        throttler.throttle(amount).await;
    }
}

/// The read and write throttlers of one storage instance.
///
/// Both handles start out empty, meaning unlimited. [`apply`](Self::apply) builds throttlers for
/// configured limits and swaps them in.
#[derive(Debug, Default)]
pub struct RemoteThrottlers {
    read: ArcSwapOption<Throttler>,
    write: ArcSwapOption<Throttler>,
}

impl RemoteThrottlers {
    /// Creates unlimited throttlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-derives both throttlers from the given settings.
    ///
    /// Operations that already loaded a throttler keep using it until they finish.
    pub fn apply(&self, settings: &ThrottlingSettings) {
        let burst = settings.max_burst.unwrap_or_default();
        let build = |limit: Option<u64>| {
            limit
                .filter(|bps| *bps > 0)
                .map(|bps| Arc::new(Throttler::new(bps, burst)))
        };

        self.read.store(build(settings.max_read_bandwidth));
        self.write.store(build(settings.max_write_bandwidth));
    }

    /// Returns the current read throttler, if reads are limited.
    pub fn read(&self) -> Option<Arc<Throttler>> {
        self.read.load_full()
    }

    /// Returns the current write throttler, if writes are limited.
    pub fn write(&self) -> Option<Arc<Throttler>> {
        self.write.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_free_then_delays() {
        let throttler = Throttler::new(100, 100);

        assert_eq!(throttler.reserve(100), Duration::ZERO);
        assert_eq!(throttler.reserve(100), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time() {
        let throttler = Throttler::new(100, 100);
        assert_eq!(throttler.reserve(100), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(throttler.reserve(100), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_sleeps_instead_of_rejecting() {
        let throttler = Throttler::new(1000, 1000);
        let start = Instant::now();

        throttler.throttle(1000).await;
        throttler.throttle(2000).await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2100), "{elapsed:?}");
    }

    #[test]
    fn zero_limits_are_unlimited() {
        let throttlers = RemoteThrottlers::new();
        throttlers.apply(&ThrottlingSettings {
            max_read_bandwidth: Some(0),
            max_write_bandwidth: None,
            max_burst: None,
        });

        assert!(throttlers.read().is_none());
        assert!(throttlers.write().is_none());
    }

    #[test]
    fn apply_swaps_instead_of_mutating() {
        let throttlers = RemoteThrottlers::new();
        throttlers.apply(&ThrottlingSettings {
            max_read_bandwidth: Some(1024),
            max_write_bandwidth: Some(2048),
            max_burst: None,
        });

        let old_read = throttlers.read().unwrap();
        assert_eq!(old_read.max_speed(), 1024);
        assert_eq!(throttlers.write().unwrap().max_speed(), 2048);

        throttlers.apply(&ThrottlingSettings {
            max_read_bandwidth: Some(4096),
            ..Default::default()
        });

        // The handle loaded before the swap still works against the old limit.
        assert_eq!(old_read.max_speed(), 1024);
        assert_eq!(throttlers.read().unwrap().max_speed(), 4096);
        assert!(throttlers.write().is_none());
    }
}
