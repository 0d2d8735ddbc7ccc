// Token bucket guarding every outbound call to the official API.
//
// Tokens are semaphore permits that are forgotten on acquire, so the only way
// the supply grows is the refill task. The refill task is the single producer:
// acquirers only ever lower the count, which makes "check then add" safe.

use std::sync::Arc;
use std::time::Duration;

use prometheus::IntGauge;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{BucketError, DispatchError};
use crate::metrics;

/// Highest sustained request rate the official API tolerates.
pub const MAX_RATE_PER_MINUTE: u32 = 180;

/// Extra slack added to each refill interval, as a fraction (1/20 = 5%) of it.
/// Scales with the rate so fast buckets are not slowed by a fixed constant.
const REFILL_MARGIN_DIVISOR: u32 = 20;

/// Largest burst the API tolerates: one second's worth of requests.
pub const MAX_CAPACITY: usize = (MAX_RATE_PER_MINUTE / 60) as usize;

/// Bounded, periodically refilled supply of request permits.
///
/// Must be constructed inside a tokio runtime (the refill task is spawned on
/// construction). Dropping the bucket stops the refill task and wakes any
/// waiters with [`DispatchError::Closed`].
pub struct TokenBucket {
    permits: Arc<Semaphore>,
    capacity: usize,
    interval: Duration,
    gauge: IntGauge,
    refill: JoinHandle<()>,
}

impl TokenBucket {
    /// Build a bucket for a requests-per-minute budget.
    ///
    /// The rate is clamped to [`MAX_RATE_PER_MINUTE`]. Capacity is the
    /// truncated per-second rate, and one token is refilled every
    /// `1s / per_second` plus a proportional safety margin.
    pub fn new(rate_per_minute: u32) -> Result<Self, BucketError> {
        let rate = clamp_rate(rate_per_minute);
        let per_second = rate / 60;
        if per_second == 0 {
            return Err(BucketError::ZeroRate(rate_per_minute));
        }

        let base = Duration::from_secs(1) / per_second;
        Self::with_interval(per_second as usize, base + base / REFILL_MARGIN_DIVISOR)
    }

    /// Build a bucket with an explicit capacity and refill interval.
    /// The bucket starts full.
    ///
    /// Capacity is clamped to [`MAX_CAPACITY`] and the interval is raised to
    /// [`min_refill_interval`], so no bucket outruns [`MAX_RATE_PER_MINUTE`].
    pub fn with_interval(capacity: usize, interval: Duration) -> Result<Self, BucketError> {
        if capacity == 0 {
            return Err(BucketError::ZeroCapacity);
        }
        if interval.is_zero() {
            return Err(BucketError::ZeroInterval);
        }

        let floor = min_refill_interval();
        if capacity > MAX_CAPACITY || interval < floor {
            tracing::warn!(
                capacity,
                ?interval,
                max_capacity = MAX_CAPACITY,
                min_interval = ?floor,
                "bucket exceeds the API ceiling, clamping"
            );
        }
        Ok(Self::start(
            capacity.min(MAX_CAPACITY),
            interval.max(floor),
            metrics::TOKENS_AVAILABLE.clone(),
        ))
    }

    /// Bucket without the API ceiling, for tests that need many tokens fast.
    #[cfg(test)]
    pub(crate) fn unclamped(capacity: usize, interval: Duration) -> Self {
        Self::start(capacity, interval, metrics::TOKENS_AVAILABLE.clone())
    }

    fn start(capacity: usize, interval: Duration, gauge: IntGauge) -> Self {
        let permits = Arc::new(Semaphore::new(capacity));
        let refill = tokio::spawn(refill_loop(
            permits.clone(),
            capacity,
            interval,
            gauge.clone(),
        ));
        gauge.set(capacity as i64);

        tracing::debug!(capacity, ?interval, "token bucket started");
        Self {
            permits,
            capacity,
            interval,
            gauge,
            refill,
        }
    }

    /// Wait until a token is available and consume it.
    pub async fn acquire(&self) -> Result<(), DispatchError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DispatchError::Closed)?;
        permit.forget();
        self.record_acquire("wait");
        Ok(())
    }

    /// Consume a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.record_acquire("immediate");
                true
            }
            Err(_) => false,
        }
    }

    /// Tokens currently available.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn refill_interval(&self) -> Duration {
        self.interval
    }

    /// Stop refilling and fail every current and future waiter.
    pub fn close(&self) {
        self.refill.abort();
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    fn record_acquire(&self, mode: &str) {
        metrics::TOKENS_ACQUIRED_TOTAL.with_label_values(&[mode]).inc();
        self.gauge.set(self.permits.available_permits() as i64);
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("interval", &self.interval)
            .field("available", &self.available())
            .finish()
    }
}

/// Shortest refill interval allowed: one token per `60s / MAX_RATE_PER_MINUTE`
/// plus the safety margin. Matches what [`TokenBucket::new`] derives at the
/// ceiling.
pub fn min_refill_interval() -> Duration {
    let base = Duration::from_secs(60) / MAX_RATE_PER_MINUTE;
    base + base / REFILL_MARGIN_DIVISOR
}

fn clamp_rate(requested: u32) -> u32 {
    if requested > MAX_RATE_PER_MINUTE {
        tracing::warn!(
            requested,
            max = MAX_RATE_PER_MINUTE,
            "requested rate exceeds the API ceiling, clamping"
        );
        MAX_RATE_PER_MINUTE
    } else {
        requested
    }
}

async fn refill_loop(
    permits: Arc<Semaphore>,
    capacity: usize,
    interval: Duration,
    gauge: IntGauge,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if permits.is_closed() {
            break;
        }
        // A full bucket drops the refill instead of queueing it.
        if permits.available_permits() < capacity {
            permits.add_permits(1);
        } else {
            metrics::TOKENS_DROPPED_TOTAL.inc();
        }
        gauge.set(permits.available_permits() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_new_computes_capacity_and_interval() {
        let bucket = TokenBucket::new(180).unwrap();
        assert_eq!(bucket.capacity(), 3);
        assert_eq!(bucket.available(), 3);

        // 1s / 3 plus 5% margin
        let base = Duration::from_secs(1) / 3;
        assert_eq!(bucket.refill_interval(), base + base / 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_is_clamped_to_ceiling() {
        let bucket = TokenBucket::new(6000).unwrap();
        assert_eq!(bucket.capacity(), (MAX_RATE_PER_MINUTE / 60) as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_is_a_construction_error() {
        assert_eq!(TokenBucket::new(0).unwrap_err(), BucketError::ZeroRate(0));
        assert_eq!(TokenBucket::new(59).unwrap_err(), BucketError::ZeroRate(59));
        assert_eq!(
            TokenBucket::with_interval(0, Duration::from_millis(10)).unwrap_err(),
            BucketError::ZeroCapacity
        );
        assert_eq!(
            TokenBucket::with_interval(1, Duration::ZERO).unwrap_err(),
            BucketError::ZeroInterval
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_drains_then_fails() {
        let bucket = TokenBucket::with_interval(2, Duration::from_secs(60)).unwrap();
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_never_exceeded() {
        let bucket = TokenBucket::unclamped(3, Duration::from_millis(10));

        // Many refill ticks on a full bucket
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(bucket.available(), 3);

        // Drain partially, then let it overfill again
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(7)).await;
            assert!(bucket.available() <= bucket.capacity());
        }
        assert_eq!(bucket.available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_adds_one_token_per_interval() {
        let bucket = TokenBucket::unclamped(3, Duration::from_millis(100));
        for _ in 0..3 {
            assert!(bucket.try_acquire());
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(bucket.available(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bucket.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_average_rate_respects_ceiling() {
        let bucket = TokenBucket::new(180).unwrap();
        let start = Instant::now();

        let acquired = 303u32;
        for _ in 0..acquired {
            bucket.acquire().await.unwrap();
        }

        let per_minute = acquired as f64 / start.elapsed().as_secs_f64() * 60.0;
        assert!(per_minute <= 180.0, "observed {per_minute:.1} requests/minute");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_waiters() {
        let bucket = Arc::new(TokenBucket::with_interval(1, Duration::from_secs(3600)).unwrap());
        assert!(bucket.try_acquire());

        let waiter = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.acquire().await })
        };
        tokio::task::yield_now().await;

        bucket.close();
        assert!(bucket.is_closed());
        assert_eq!(waiter.await.unwrap(), Err(DispatchError::Closed));
        assert_eq!(bucket.acquire().await, Err(DispatchError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_interval_is_clamped_to_ceiling() {
        let bucket = TokenBucket::with_interval(1000, Duration::from_millis(1)).unwrap();
        assert_eq!(bucket.capacity(), MAX_CAPACITY);
        assert_eq!(bucket.refill_interval(), min_refill_interval());

        let start = Instant::now();
        let acquired = 2000u32;
        for _ in 0..acquired {
            bucket.acquire().await.unwrap();
        }

        let per_minute = acquired as f64 / start.elapsed().as_secs_f64() * 60.0;
        assert!(
            per_minute <= MAX_RATE_PER_MINUTE as f64,
            "observed {per_minute:.1} requests/minute"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_interval_within_ceiling_is_kept() {
        let bucket = TokenBucket::with_interval(2, Duration::from_secs(1)).unwrap();
        assert_eq!(bucket.capacity(), 2);
        assert_eq!(bucket.refill_interval(), Duration::from_secs(1));
        assert_eq!(min_refill_interval(), TokenBucket::new(180).unwrap().refill_interval());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gauge_tracks_acquires_and_refills() {
        let gauge = IntGauge::new("test_tokens_available", "bucket under test").unwrap();
        let bucket = TokenBucket::start(2, Duration::from_secs(60), gauge.clone());
        assert_eq!(gauge.get(), 2);

        assert!(bucket.try_acquire());
        assert_eq!(gauge.get(), 1);
        bucket.acquire().await.unwrap();
        assert_eq!(gauge.get(), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(gauge.get(), 1);
    }
}
