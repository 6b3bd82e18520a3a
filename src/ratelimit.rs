//! Fixed-window rate limiting
//!
//! A counter per `bucket:identity` key that resets at fixed intervals.
//! Bursts straddling a window boundary are accepted as the cost of O(1)
//! bookkeeping. The window store is injected so single-process deployments
//! use the in-memory map while multi-process ones can plug in an external
//! key-value store.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Counter state for one key's current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

/// Storage for window state, keyed by `bucket:identity` strings.
///
/// Entries whose `reset_at` has passed are dead weight and may be deleted
/// at any time without affecting correctness.
pub trait WindowStore: Send {
    fn get(&self, key: &str) -> Option<Window>;
    fn set(&mut self, key: &str, window: Window);
    fn delete(&mut self, key: &str);
    fn keys(&self) -> Vec<String>;
}

/// In-memory window store for single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<String, Window>,
}

impl WindowStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Window> {
        self.entries.get(key).copied()
    }

    fn set(&mut self, key: &str, window: Window) {
        self.entries.insert(key.to_string(), window);
    }

    fn delete(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Limit and window size for one bucket.
#[derive(Debug, Clone, Copy)]
pub struct Quota {
    pub limit: u32,
    pub window: Duration,
}

impl Quota {
    pub fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            window: Duration::minutes(1),
        }
    }
}

/// Outcome of a rate-limit hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { retry_after_secs: i64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Fixed-window limiter over an injected store.
///
/// The check-and-increment runs under one mutex so two requests racing in
/// the same window never lose an increment. Different keys never contend
/// logically, and the windows are short-lived, so the single lock is fine.
pub struct FixedWindowLimiter {
    store: Mutex<Box<dyn WindowStore>>,
}

impl FixedWindowLimiter {
    pub fn new(store: Box<dyn WindowStore>) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::default()))
    }

    /// Record a hit against `bucket` for `identity` at `now`.
    ///
    /// A missing or expired window starts fresh at count 1. Within a live
    /// window, hits below the limit increment and report the remaining
    /// allowance; at the limit the hit is denied with the whole seconds
    /// (rounded up) until the window resets.
    pub fn hit(&self, bucket: &str, identity: &str, quota: Quota, now: DateTime<Utc>) -> RateDecision {
        let key = format!("{bucket}:{identity}");
        let mut store = self.store.lock().unwrap();

        match store.get(&key) {
            Some(window) if window.reset_at > now => {
                if window.count < quota.limit {
                    let count = window.count + 1;
                    store.set(
                        &key,
                        Window {
                            count,
                            reset_at: window.reset_at,
                        },
                    );
                    RateDecision::Allowed {
                        remaining: quota.limit - count,
                    }
                } else {
                    let millis = (window.reset_at - now).num_milliseconds().max(0);
                    tracing::warn!(bucket, identity, "rate limit exceeded");
                    RateDecision::Denied {
                        retry_after_secs: (millis as u64).div_ceil(1000) as i64,
                    }
                }
            }
            _ => {
                store.set(
                    &key,
                    Window {
                        count: 1,
                        reset_at: now + quota.window,
                    },
                );
                RateDecision::Allowed {
                    remaining: quota.limit.saturating_sub(1),
                }
            }
        }
    }

    /// Drop every window whose reset time has passed. Callers run this
    /// opportunistically; it is not synchronized with the hit path.
    pub fn prune(&self, now: DateTime<Utc>) {
        let mut store = self.store.lock().unwrap();
        for key in store.keys() {
            if let Some(window) = store.get(&key)
                && window.reset_at <= now
            {
                store.delete(&key);
            }
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.store.lock().unwrap().keys().len()
    }
}
