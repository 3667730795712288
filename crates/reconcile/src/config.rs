//! Engine knobs, read from the environment at construction time.
//!
//! - `KEEL_CONFLICT_RETRIES`: total update attempts on optimistic-concurrency conflicts (default 5)
//! - `KEEL_CONFLICT_BACKOFF_MS`: pause between conflict retries (default 10)
//! - `KEEL_WAIT_TIMEOUT_SECS`: wait-for-apply deadline (default 120)

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_CONFLICT_ATTEMPTS: u32 = 5;
const DEFAULT_CONFLICT_BACKOFF_MS: u64 = 10;
const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 120;

/// Bounded retry for update conflicts. Only conflicts are retried.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total update attempts, first one included. Never less than 1.
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts: attempts.max(1), backoff }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CONFLICT_ATTEMPTS, Duration::from_millis(DEFAULT_CONFLICT_BACKOFF_MS))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub wait_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { retry: RetryPolicy::default(), wait_timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS) }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<u64>().ok())
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let base = Self::default();
        let attempts = env_u64("KEEL_CONFLICT_RETRIES")
            .map(|v| v.min(u32::MAX as u64) as u32)
            .unwrap_or(base.retry.attempts);
        let backoff = env_u64("KEEL_CONFLICT_BACKOFF_MS").map(Duration::from_millis).unwrap_or(base.retry.backoff);
        let wait_timeout = env_u64("KEEL_WAIT_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(base.wait_timeout);
        Self { retry: RetryPolicy::new(attempts, backoff), wait_timeout }
    }
}
