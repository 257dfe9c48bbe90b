//! Per-client rate limiting.

pub mod bucket;
pub mod limiter;

pub use bucket::TokenBucket;
pub use limiter::RateLimiter;
