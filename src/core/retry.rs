//! Retry policy configuration for tasks.
//!
//! Supports a fixed delay between attempts and a bound on the total
//! number of attempts a task may make within one run.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default total attempts per task (the initial attempt included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay between two attempts of the same task.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Retry policy for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    ///
    /// `max_attempts = 3` means a task that keeps failing is attempted
    /// exactly three times. Zero is treated like one.
    pub max_attempts: u32,

    /// Fixed delay between attempts.
    #[serde(with = "serde_duration")]
    pub delay: Duration,
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// A policy with a fixed delay between attempts.
    ///
    /// # Arguments
    /// * `max_attempts` - Total attempts, the first one included
    /// * `delay` - Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Check if more than one attempt is allowed.
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 1
    }

    /// Check if another attempt may be made after `attempts` have failed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }

    /// Get the delay before the next attempt.
    pub fn get_delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as whole seconds (matching the YAML config format).
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
