//! Fast lock cache: TTL key-value entries plus windowed counters.
//!
//! This is the cross-process mirror of the authoritative lock state (the
//! original deployment kept it in Redis; here it is a DashMap in front of the
//! sled store, the same hot-cache arrangement the memory layer uses). It is
//! NOT authoritative: entries self-expire, so the cache can never report
//! "locked" past the true expiry, and every consumer treats it as best-effort.
//!
//! All operations return `Err(CacheUnavailable)` when the cache is offline.
//! Callers log and degrade — a cache outage must never surface as a
//! user-facing error or make the gate fail closed.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cache key gating all accounts at once. Checked by the gate before any
/// per-account key.
pub const GLOBAL_LOCK_KEY: &str = "global:locked";

/// Per-account lock mirror key.
pub fn account_lock_key(roll: &str) -> String {
    format!("account-lock:{}", roll)
}

/// Per-account appeal rate-limit counter key.
pub fn appeal_rate_key(roll: &str) -> String {
    format!("appeal-rate:{}", roll)
}

/// The cache layer could not be reached. Never propagated to end callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheUnavailable;

impl std::fmt::Display for CacheUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lock cache unavailable")
    }
}

impl std::error::Error for CacheUnavailable {}

struct TtlEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

struct WindowCounter {
    count: u64,
    window_ends: DateTime<Utc>,
}

/// Result of one windowed-counter increment.
#[derive(Debug, Clone, Copy)]
pub struct WindowCount {
    /// Count within the current window, including this increment.
    pub count: u64,
    /// Seconds until the window rolls over.
    pub retry_after_secs: u64,
}

/// TTL key-value cache with fixed-window counters.
pub struct LockCache {
    entries: DashMap<String, TtlEntry>,
    counters: DashMap<String, WindowCounter>,
    online: AtomicBool,
}

impl LockCache {
    /// Creates an online cache.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            counters: DashMap::new(),
            online: AtomicBool::new(true),
        }
    }

    /// Creates a cache that reports every operation as unavailable. Used to
    /// exercise the degraded (authoritative-store-only) paths.
    pub fn offline() -> Self {
        let cache = Self::new();
        cache.online.store(false, Ordering::SeqCst);
        cache
    }

    /// Flips availability at runtime (ops drills and tests).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), CacheUnavailable> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheUnavailable)
        }
    }

    /// Sets `key` to `value` for `ttl`. A non-positive TTL removes the key.
    pub fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheUnavailable> {
        self.check_online()?;
        if ttl <= Duration::zero() {
            self.entries.remove(key);
            return Ok(());
        }
        self.entries.insert(
            key.to_string(),
            TtlEntry {
                value: value.to_string(),
                expires_at: Utc::now() + ttl,
            },
        );
        Ok(())
    }

    /// Reads `key`. Expired entries read as absent and are dropped.
    pub fn get(&self, key: &str) -> Result<Option<String>, CacheUnavailable> {
        self.check_online()?;
        let now = Utc::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        // Entry existed but is stale; take it out.
        self.entries.remove(key);
        Ok(None)
    }

    /// Deletes `key` if present.
    pub fn delete(&self, key: &str) -> Result<(), CacheUnavailable> {
        self.check_online()?;
        self.entries.remove(key);
        Ok(())
    }

    /// Increments a fixed-window counter, starting a new window when the
    /// previous one has rolled over. Returns the count within the current
    /// window and the seconds remaining until it resets.
    pub fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, CacheUnavailable> {
        self.check_online()?;
        let now = Utc::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter {
                count: 0,
                window_ends: now + window,
            });
        if entry.window_ends <= now {
            entry.count = 0;
            entry.window_ends = now + window;
        }
        entry.count += 1;
        let retry_after_secs = (entry.window_ends - now).num_seconds().max(0) as u64;
        Ok(WindowCount {
            count: entry.count,
            retry_after_secs,
        })
    }
}

impl Default for LockCache {
    fn default() -> Self {
        Self::new()
    }
}
