//! Delay policies for re-queueing failed items.

use std::hash::Hash;
use std::num::NonZeroU32;
use std::time::Duration;

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use thiserror::Error;

/// Default per-item base delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default per-item delay cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Default overall re-queue rate, per second.
pub const DEFAULT_QPS: NonZeroU32 = match NonZeroU32::new(10) {
    Some(qps) => qps,
    None => panic!("default qps is zero"),
};

/// Default overall burst size.
pub const DEFAULT_BURST: NonZeroU32 = match NonZeroU32::new(100) {
    Some(burst) => burst,
    None => panic!("default burst is zero"),
};

/// Decides how long a failed item waits before it is queued again.
pub trait RateLimiter<K>: Send + Sync {
    /// Returns the delay for the next retry of `item` and records the failure.
    fn when(&self, item: &K) -> Duration;

    /// Clears all failure history for `item`.
    fn forget(&self, item: &K);

    /// Number of failures recorded for `item` since the last `forget`.
    fn num_requeues(&self, item: &K) -> u32;
}

impl<K, R> RateLimiter<K> for Box<R>
where
    R: RateLimiter<K> + ?Sized,
{
    fn when(&self, item: &K) -> Duration {
        (**self).when(item)
    }

    fn forget(&self, item: &K) {
        (**self).forget(item)
    }

    fn num_requeues(&self, item: &K) -> u32 {
        (**self).num_requeues(item)
    }
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialRateLimiter<K: Eq + Hash> {
    base: Duration,
    max: Duration,
    failures: DashMap<K, u32>,
}

impl<K: Eq + Hash> ItemExponentialRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: DashMap::new(),
        }
    }
}

impl<K> RateLimiter<K> for ItemExponentialRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    fn when(&self, item: &K) -> Duration {
        let exponent = {
            let mut failures = self.failures.entry(item.clone()).or_insert(0);
            let exponent = *failures;
            *failures = failures.saturating_add(1);
            exponent
        };

        match 1u32.checked_shl(exponent) {
            Some(factor) => self.base.saturating_mul(factor).min(self.max),
            None => self.max,
        }
    }

    fn forget(&self, item: &K) {
        self.failures.remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures.get(item).map(|entry| *entry).unwrap_or(0)
    }
}

/// Rejected `qps`/`burst` pair for a [`BucketRateLimiter`].
#[derive(Debug, Clone, PartialEq, Error)]
#[error("rate limit needs a positive finite qps and a non-zero burst (qps={qps}, burst={burst})")]
pub struct InvalidRateLimit {
    pub qps: f64,
    pub burst: u32,
}

/// Overall token bucket shared by every item, backed by a GCRA limiter.
///
/// A call that finds a free token takes it and returns zero. Otherwise the
/// delay is the time until the next token frees up.
pub struct BucketRateLimiter {
    quota: Quota,
    limiter: DefaultDirectRateLimiter,
    clock: DefaultClock,
}

impl BucketRateLimiter {
    /// Bucket refilled at `qps` tokens per second holding up to `burst`.
    pub fn new(qps: f64, burst: u32) -> Result<Self, InvalidRateLimit> {
        let invalid = || InvalidRateLimit { qps, burst };
        if !(qps.is_finite() && qps > 0.0) {
            return Err(invalid());
        }
        let period = Duration::try_from_secs_f64(qps.recip()).map_err(|_| invalid())?;
        let burst_size = NonZeroU32::new(burst).ok_or_else(invalid)?;
        let quota = Quota::with_period(period)
            .ok_or_else(invalid)?
            .allow_burst(burst_size);
        Ok(Self::from_quota(quota))
    }

    pub fn from_quota(quota: Quota) -> Self {
        Self {
            quota,
            limiter: GovernorRateLimiter::direct(quota),
            clock: DefaultClock::default(),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        match self.limiter.check() {
            Ok(()) => Duration::ZERO,
            Err(not_until) => not_until.wait_time_from(self.clock.now()),
        }
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

impl std::fmt::Debug for BucketRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketRateLimiter")
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

/// Combines limiters by taking the longest delay any of them asks for.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

impl<K> std::fmt::Debug for MaxOfRateLimiter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaxOfRateLimiter")
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

/// Per-item exponential backoff combined with an overall token bucket.
pub fn controller_rate_limiter<K>(
    base_delay: Duration,
    max_delay: Duration,
    qps: f64,
    burst: u32,
) -> Result<MaxOfRateLimiter<K>, InvalidRateLimit>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    let bucket = BucketRateLimiter::new(qps, burst)?;
    Ok(combine(base_delay, max_delay, bucket))
}

fn combine<K>(
    base_delay: Duration,
    max_delay: Duration,
    bucket: BucketRateLimiter,
) -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialRateLimiter::new(base_delay, max_delay)),
        Box::new(bucket),
    ])
}

/// [`controller_rate_limiter`] with the default settings.
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    let quota = Quota::per_second(DEFAULT_QPS).allow_burst(DEFAULT_BURST);
    combine(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, BucketRateLimiter::from_quota(quota))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_grows_and_caps() {
        let limiter =
            ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_millis(40));
        let item = "shop/orders".to_string();

        let delays: Vec<_> = (0..6).map(|_| limiter.when(&item)).collect();
        assert_eq!(
            delays,
            [5, 10, 20, 40, 40, 40].map(Duration::from_millis).to_vec()
        );
        assert_eq!(limiter.num_requeues(&item), 6);
    }

    #[test]
    fn test_exponential_backoff_is_per_item() {
        let limiter =
            ItemExponentialRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1));
        let a = "a".to_string();
        let b = "b".to_string();

        limiter.when(&a);
        limiter.when(&a);
        assert_eq!(limiter.when(&b), Duration::from_millis(1));
        assert_eq!(limiter.num_requeues(&a), 2);
    }

    #[test]
    fn test_forget_resets_backoff() {
        let limiter =
            ItemExponentialRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1));
        let item = "a".to_string();

        limiter.when(&item);
        limiter.when(&item);
        limiter.forget(&item);

        assert_eq!(limiter.num_requeues(&item), 0);
        assert_eq!(limiter.when(&item), Duration::from_millis(1));
    }

    #[test]
    fn test_exponential_backoff_does_not_overflow() {
        let limiter = ItemExponentialRateLimiter::new(Duration::from_secs(1), DEFAULT_MAX_DELAY);
        let item = "a".to_string();
        for _ in 0..5000 {
            assert!(limiter.when(&item) <= DEFAULT_MAX_DELAY);
        }
    }

    #[test]
    fn test_bucket_allows_burst_then_delays() {
        let limiter = BucketRateLimiter::new(1.0, 3).unwrap();

        for _ in 0..3 {
            assert_eq!(RateLimiter::<String>::when(&limiter, &"a".to_string()), Duration::ZERO);
        }
        let delay = RateLimiter::<String>::when(&limiter, &"a".to_string());
        assert!(delay > Duration::from_millis(900), "delay was {delay:?}");
        assert!(delay <= Duration::from_secs(1));
    }

    #[test]
    fn test_bucket_supports_fractional_qps() {
        let limiter = BucketRateLimiter::new(0.5, 1).unwrap();
        let item = "a".to_string();

        assert_eq!(limiter.when(&item), Duration::ZERO);
        let delay = limiter.when(&item);
        assert!(delay > Duration::from_millis(1900), "delay was {delay:?}");
        assert!(delay <= Duration::from_secs(2));
    }

    #[test]
    fn test_bucket_rejects_unusable_rates() {
        for qps in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = BucketRateLimiter::new(qps, 1).unwrap_err();
            assert_eq!(err.burst, 1);
        }
        assert!(BucketRateLimiter::new(1.0, 0).is_err());
        assert!(
            controller_rate_limiter::<String>(
                Duration::from_millis(5),
                Duration::from_secs(1),
                0.0,
                1,
            )
            .is_err()
        );
    }

    #[test]
    fn test_default_limiter_starts_with_base_delay() {
        let limiter = default_controller_rate_limiter::<String>();
        assert_eq!(limiter.when(&"a".to_string()), DEFAULT_BASE_DELAY);
    }

    #[test]
    fn test_max_of_picks_longest_delay() {
        let limiter: MaxOfRateLimiter<String> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialRateLimiter::new(
                Duration::from_millis(50),
                Duration::from_secs(1),
            )),
            Box::new(BucketRateLimiter::new(1000.0, 100).unwrap()),
        ]);
        let item = "a".to_string();

        assert_eq!(limiter.when(&item), Duration::from_millis(50));
        assert_eq!(limiter.when(&item), Duration::from_millis(100));
        assert_eq!(limiter.num_requeues(&item), 2);

        limiter.forget(&item);
        assert_eq!(limiter.num_requeues(&item), 0);
    }
}
