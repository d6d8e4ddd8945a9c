//! Requeue backoff for failed reconciliations
//!
//! The schedule is a [`BackoffPolicy`] so it can be swapped without touching
//! the reconciler. [`FailureTracker`] keeps consecutive failure counts per
//! claim and resets them on success.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::adapters::ClaimKey;

/// Delay schedule for consecutive failures
pub trait BackoffPolicy: Send + Sync {
    /// Delay before the next attempt, given how many attempts failed in a row
    /// before this one (0 for the first failure)
    fn delay(&self, consecutive_failures: u32) -> Duration;
}

/// Exponential backoff with jitter: `base * 2^n` capped at `max`, then a
/// random point in the upper half of that interval
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

impl ExponentialBackoff {
    /// Upper bound of the delay after `consecutive_failures`
    pub fn ceiling(&self, consecutive_failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(consecutive_failures.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, consecutive_failures: u32) -> Duration {
        let ceiling = self.ceiling(consecutive_failures);
        let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        if millis < 2 {
            return ceiling;
        }
        Duration::from_millis(thread_rng().gen_range((millis / 2)..=millis))
    }
}

/// Consecutive failure bookkeeping per claim
pub struct FailureTracker {
    policy: Box<dyn BackoffPolicy>,
    failures: Mutex<HashMap<ClaimKey, u32>>,
}

impl FailureTracker {
    pub fn new(policy: impl BackoffPolicy + 'static) -> Self {
        Self {
            policy: Box::new(policy),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &ClaimKey) -> Duration {
        let consecutive = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            let count = failures.entry(key.clone()).or_default();
            let consecutive = *count;
            *count = count.saturating_add(1);
            consecutive
        };
        self.policy.delay(consecutive)
    }

    /// Forget failures for `key` after it reconciled or was dropped
    pub fn reset(&self, key: &ClaimKey) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Consecutive failures currently recorded for `key`
    pub fn failures(&self, key: &ClaimKey) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// Number of claims with failures on record
    pub fn len(&self) -> usize {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}
