//! Exponential backoff with symmetric jitter.
//!
//! One policy serves every retry site (connection cycles and publish
//! retries alike).

use std::time::Duration;

use rand::Rng;

/// `base * 2^attempt`, capped at `max_delay`, then shifted up or down by a
/// random amount of at most half the capped value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self { base, max_delay }
    }

    /// Delay before retrying after `attempt` (0-based) failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Same as [`delay`](Self::delay) with a caller-supplied RNG.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let capped = self.capped(attempt);
        let jitter = capped.mul_f64(rng.gen_range(0.0..=0.5));
        if rng.gen_bool(0.5) {
            capped + jitter
        } else {
            capped.saturating_sub(jitter)
        }
    }

    /// The un-jittered delay: `min(base * 2^attempt, max_delay)`.
    pub fn capped(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(31);
        self.base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }
}
