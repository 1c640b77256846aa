//! Fixed-window request rate limiting.
//!
//! One counter per client identifier, reset at discrete window boundaries.
//! A burst straddling a rollover can therefore admit up to 2×max requests;
//! that is documented fixed-window behavior, not a defect. Cleanup is
//! deterministic: a full sweep once the cleanup interval has elapsed, plus
//! lazy eviction of the specific key being checked.
//!
//! Construct one per process and inject it; there is no global instance,
//! and tests build fresh limiters to avoid cross-test leakage.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of a single `check` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window after this one.
    pub remaining: u32,
    /// Seconds until the window resets; only set when blocked, never 0.
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug)]
struct Entry {
    count: u32,
    window_reset_at: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    entries: Mutex<HashMap<String, Entry>>,
    max_requests: u32,
    window: Duration,
    cleanup_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self::with_cleanup_interval(max_requests, window, Duration::from_secs(60))
    }

    pub fn with_cleanup_interval(
        max_requests: u32,
        window: Duration,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_requests,
            window,
            cleanup_interval,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn check(&self, identifier: &str) -> RateLimitDecision {
        let now = Instant::now();
        self.maybe_sweep(now);

        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Lazy eviction: an elapsed window is replaced, not incremented.
        if entries
            .get(identifier)
            .is_some_and(|e| e.window_reset_at <= now)
        {
            entries.remove(identifier);
        }

        match entries.get_mut(identifier) {
            None => {
                entries.insert(
                    identifier.to_string(),
                    Entry {
                        count: 1,
                        window_reset_at: now + self.window,
                    },
                );
                RateLimitDecision {
                    allowed: true,
                    remaining: self.max_requests.saturating_sub(1),
                    retry_after_secs: None,
                }
            }
            Some(entry) if entry.count >= self.max_requests => {
                let remaining_window = entry.window_reset_at.saturating_duration_since(now);
                let retry_after = remaining_window.as_millis().div_ceil(1000).max(1) as u64;
                tracing::debug!(identifier, retry_after, "rate limit exceeded");
                RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    retry_after_secs: Some(retry_after),
                }
            }
            Some(entry) => {
                entry.count += 1;
                RateLimitDecision {
                    allowed: true,
                    remaining: self.max_requests - entry.count,
                    retry_after_secs: None,
                }
            }
        }
    }

    /// One full pass over all entries, at most once per cleanup interval.
    fn maybe_sweep(&self, now: Instant) {
        {
            let mut last = match self.last_sweep.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if now.duration_since(*last) < self.cleanup_interval {
                return;
            }
            *last = now;
        }
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.retain(|_, entry| entry.window_reset_at > now);
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
