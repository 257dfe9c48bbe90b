//! Per-key rate limiter with idle-bucket cleanup.

use super::bucket::TokenBucket;
use crate::config::RateLimitConfig;
use crate::error::ServerError;
use crate::utils::tick_period;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Token-bucket rate limiter keyed by client (typically the remote IP).
///
/// Buckets are created on first use and dropped by a background sweep once
/// idle for [`RateLimitConfig::max_age`]. A bucket being consulted holds its
/// map shard, so the sweep can never remove it mid-check.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    config: RateLimitConfig,
    closed: AtomicBool,
    stop: watch::Sender<bool>,
}

impl RateLimiter {
    /// Creates the limiter and starts its cleanup task on the current tokio
    /// runtime. Outside a runtime the limiter still works but idle buckets are
    /// only dropped by explicit [`sweep`](Self::sweep) calls.
    pub fn new(config: RateLimitConfig) -> Arc<Self> {
        let (stop, stop_rx) = watch::channel(false);
        let limiter = Arc::new(Self {
            buckets: DashMap::new(),
            config,
            closed: AtomicBool::new(false),
            stop,
        });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(Self::cleanup_loop(Arc::downgrade(&limiter), stop_rx));
            }
            Err(_) => warn!("No tokio runtime, rate limiter cleanup task not started"),
        }
        limiter
    }

    async fn cleanup_loop(limiter: Weak<Self>, mut stop: watch::Receiver<bool>) {
        let period = match limiter.upgrade() {
            Some(limiter) => tick_period("Rate limiter cleanup", limiter.config.cleanup_interval),
            None => return,
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing can be idle yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(limiter) = limiter.upgrade() else { break };
                    limiter.sweep();
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Rate limiter cleanup task stopped");
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Whether a request from `key` may proceed right now.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return bucket.try_acquire(now);
        }

        let mut bucket = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| TokenBucket::new(self.config.burst, self.config.requests_per_second, now));
        bucket.try_acquire(now)
    }

    /// [`allow`](Self::allow) as a `Result` carrying the retry hint.
    pub fn check(&self, key: &str) -> Result<(), ServerError> {
        if self.allow(key) {
            Ok(())
        } else {
            debug!(key, "Rate limit exceeded");
            Err(ServerError::RateLimited {
                retry_after: self.config.retry_after,
            })
        }
    }

    /// Drops every bucket idle longer than the max age. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let max_age = self.config.max_age();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.idle_for(now) <= max_age);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Swept idle rate limit buckets");
        }
        removed
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Stops the cleanup task. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.send_replace(true);
        info!("Rate limiter closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
