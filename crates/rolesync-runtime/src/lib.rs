//! Controller runtime primitives
//!
//! - [`workqueue`]: deduplicating, rate-limited queue of reconciliation keys
//! - [`rate_limiter`]: redelivery delay policies for failed keys
//! - [`cache`]: watch-fed local mirrors of API resources

#![deny(missing_docs)]

pub mod cache;
pub mod rate_limiter;
pub mod workqueue;

pub use cache::{
    object_key, wait_for_cache_sync, EventHandlerFns, HasSynced, ResourceEventHandler, WatchCache,
};
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};
pub use workqueue::{InFlight, WorkQueue};
