//! Keyed cooldown and sliding-window limiters.
//!
//! Neither type locks internally; owners keep them inside whatever lock
//! already serializes the state they guard, so the check and the state
//! transition it gates happen atomically.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Minimum interval between successful actions per key.
#[derive(Debug)]
pub struct Cooldowns<K> {
    interval: Duration,
    last: HashMap<K, Instant>,
}

impl<K: Eq + Hash> Cooldowns<K> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
        }
    }

    /// Returns the remaining wait if the key is still cooling down.
    pub fn check(&self, key: &K, now: Instant) -> Result<(), Duration> {
        match self.last.get(key) {
            Some(last) => {
                let ready_at = *last + self.interval;
                if now < ready_at {
                    Err(ready_at - now)
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    /// Start the cooldown for a key. Call only after the action succeeded.
    pub fn record(&mut self, key: K, now: Instant) {
        self.last.insert(key, now);
    }

    /// Forget a key once its cooldown can no longer matter.
    pub fn prune(&mut self, now: Instant) {
        let interval = self.interval;
        self.last.retain(|_, last| now < *last + interval);
    }
}

/// At most `max` hits per key within any `window`.
#[derive(Debug)]
pub struct SlidingWindowLimiter<K> {
    max: u32,
    window: Duration,
    hits: HashMap<K, VecDeque<Instant>>,
}

impl<K: Eq + Hash> SlidingWindowLimiter<K> {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: HashMap::new(),
        }
    }

    /// Record a hit if the key is under its limit; returns whether it was allowed.
    ///
    /// Rejected hits are not recorded.
    pub fn try_acquire(&mut self, key: K, now: Instant) -> bool {
        let window = self.window;
        let hits = self.hits.entry(key).or_default();
        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= self.max as usize {
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Drop all history for a key.
    pub fn clear(&mut self, key: &K) {
        self.hits.remove(key);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_until_interval_elapses() {
        let mut cooldowns = Cooldowns::new(Duration::from_millis(100));
        let start = Instant::now();

        assert!(cooldowns.check(&"join", start).is_ok());
        cooldowns.record("join", start);

        let remaining = cooldowns
            .check(&"join", start + Duration::from_millis(40))
            .unwrap_err();
        assert_eq!(remaining, Duration::from_millis(60));

        assert!(cooldowns
            .check(&"join", start + Duration::from_millis(100))
            .is_ok());
        // Keys are independent
        assert!(cooldowns.check(&"mute", start).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_prune() {
        let mut cooldowns = Cooldowns::new(Duration::from_millis(10));
        let start = Instant::now();
        cooldowns.record(1u8, start);
        cooldowns.prune(start + Duration::from_millis(20));
        assert!(cooldowns.last.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window() {
        let mut limiter = SlidingWindowLimiter::new(3, Duration::from_secs(1));
        let start = Instant::now();

        for i in 0..3 {
            assert!(limiter.try_acquire("a", start + Duration::from_millis(i * 10)));
        }
        assert!(!limiter.try_acquire("a", start + Duration::from_millis(500)));
        assert!(limiter.try_acquire("b", start + Duration::from_millis(500)));

        // First hit slides out of the window
        assert!(limiter.try_acquire("a", start + Duration::from_millis(1000)));
        assert!(!limiter.try_acquire("a", start + Duration::from_millis(1005)));

        limiter.clear(&"a");
        assert!(limiter.try_acquire("a", start + Duration::from_millis(1005)));
    }
}
