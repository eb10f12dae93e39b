//! Per-principal token bucket rate limiter.
//!
//! Capacity and refill both equal `requests_per_interval`: a full bucket is
//! one interval's worth of requests. Each bucket keeps its state in a single
//! `AtomicU64` holding the theoretical arrival time (TAT) in nanoseconds since
//! the limiter's epoch: every admitted request pushes the TAT forward by one
//! emission interval (`interval / capacity`), and a request is admitted while
//! the pushed TAT stays within one interval of now. That is the token bucket
//! with `tokens = (now + interval - tat) / emission`, updated with CAS.
//!
//! The bucket table is a `DashMap`. Lookups of existing buckets take a shard
//! read lock only; creation goes through `entry`, which is exclusive.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

struct Bucket {
    tat: AtomicU64,
    last_seen: AtomicU64,
}

impl Bucket {
    /// A fresh bucket is full: its TAT is already in the past
    fn new(now: u64) -> Self {
        Self {
            tat: AtomicU64::new(0),
            last_seen: AtomicU64::new(now),
        }
    }

    fn try_acquire(&self, now: u64, emission: u64, interval: u64) -> bool {
        let mut current = self.tat.load(Ordering::Acquire);
        loop {
            let next = current.max(now).saturating_add(emission);
            if next.saturating_sub(now) > interval {
                return false;
            }
            match self
                .tat
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Rate limiter service, owned by the application state
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    epoch: Instant,
    capacity: u32,
    interval: Duration,
    idle_window: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, interval: Duration, idle_window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            epoch: Instant::now(),
            capacity: capacity.max(1),
            interval,
            idle_window,
            sweeper: Mutex::new(None),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity(), config.interval(), config.idle_window())
    }

    fn now_nanos(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.epoch)
            .as_nanos()
            .min(u64::MAX as u128) as u64
    }

    fn interval_nanos(&self) -> u64 {
        self.interval.as_nanos().min(u64::MAX as u128) as u64
    }

    /// Admit or reject one request for `principal_id`
    pub fn allow(&self, principal_id: &str) -> bool {
        let now = self.now_nanos();
        let bucket = match self.buckets.get(principal_id) {
            Some(bucket) => Arc::clone(bucket.value()),
            None => Arc::clone(
                self.buckets
                    .entry(principal_id.to_string())
                    .or_insert_with(|| Arc::new(Bucket::new(now)))
                    .value(),
            ),
        };

        bucket.last_seen.fetch_max(now, Ordering::AcqRel);

        let interval = self.interval_nanos();
        let emission = (interval / self.capacity as u64).max(1);
        let allowed = bucket.try_acquire(now, emission, interval);
        if !allowed {
            tracing::warn!(principal = %principal_id, "Rate limit hit");
        }
        allowed
    }

    /// Drop buckets idle for longer than the idle window
    pub fn evict_idle(&self) -> usize {
        let now = self.now_nanos();
        let window = self.idle_window.as_nanos().min(u64::MAX as u128) as u64;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            now.saturating_sub(bucket.last_seen.load(Ordering::Acquire)) <= window
        });
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            tracing::debug!("Evicted {} idle rate limiter entries", evicted);
        }
        evicted
    }

    /// Start the periodic sweep; its period equals the idle window.
    /// The task ends on `stop` or once the limiter is dropped.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let limiter: Weak<Self> = Arc::downgrade(self);
        let period = self.idle_window;
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match limiter.upgrade() {
                    Some(limiter) => {
                        limiter.evict_idle();
                    }
                    None => break,
                }
            }
        }));
        tracing::info!("Rate limiter sweep started, period {:?}", period);
    }

    /// Stop the periodic sweep
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            tracing::info!("Rate limiter sweep stopped");
        }
    }
}

#[cfg(test)]
impl RateLimiter {
    fn contains(&self, principal_id: &str) -> bool {
        self.buckets.contains_key(principal_id)
    }

    fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
