//! Rate limiters deciding how long a failed item waits before redelivery
//!
//! The default controller policy is the maximum of a per-item exponential
//! backoff and an overall token bucket: a single hot key backs off on its
//! own, while a burst of failures across many keys is smoothed globally.

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use parking_lot::Mutex;

/// Base delay of the per-item exponential backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Upper bound of the per-item exponential backoff
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
/// Sustained rate of the overall token bucket
pub const DEFAULT_QPS: u32 = 10;
/// Burst size of the overall token bucket
pub const DEFAULT_BURST: u32 = 100;

/// Decides the redelivery delay for failed items and tracks retry counts
pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` may be delivered again; records one more failure
    fn when(&self, item: &T) -> Duration;
    /// Reset the failure history of `item`
    fn forget(&self, item: &T);
    /// Number of failures recorded for `item` since it was last forgotten
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialFailureRateLimiter<T> {
    /// Create a limiter with the given base and cap
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> RateLimiter<T> for ItemExponentialFailureRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + Sync,
{
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        1u32.checked_shl(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

type DirectLimiter<C> =
    governor::RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Overall token bucket shared by all items
///
/// Calls to `when` draw from a GCRA bucket; once the burst is spent, the
/// returned delay is the time until the bucket admits another item.
pub struct BucketRateLimiter<C: Clock = DefaultClock> {
    clock: C,
    limiter: DirectLimiter<C>,
}

fn quota(qps: u32, burst: u32) -> Quota {
    let rate = NonZeroU32::new(qps.max(1)).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
    Quota::per_second(rate).allow_burst(burst)
}

impl BucketRateLimiter {
    /// Create a bucket with the given sustained rate and burst
    pub fn new(qps: u32, burst: u32) -> Self {
        Self::with_clock(qps, burst, DefaultClock::default())
    }
}

impl<C: Clock> BucketRateLimiter<C> {
    /// Create a bucket driven by `clock`
    pub fn with_clock(qps: u32, burst: u32, clock: C) -> Self {
        let limiter = governor::RateLimiter::direct_with_clock(quota(qps, burst), &clock);
        Self { clock, limiter }
    }
}

impl<T, C> RateLimiter<T> for BucketRateLimiter<C>
where
    C: Clock + Send + Sync,
{
    fn when(&self, _item: &T) -> Duration {
        match self.limiter.check() {
            Ok(()) => Duration::ZERO,
            Err(not_until) => not_until.wait_time_from(self.clock.now()),
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Combines limiters: the longest delay and highest retry count win
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    /// Combine the given limiters
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// The default controller policy: per-item backoff combined with a global bucket
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
        )),
        Box::new(BucketRateLimiter::new(DEFAULT_QPS, DEFAULT_BURST)),
    ])
}
