//! Reconnection backoff policy

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with full jitter
///
/// Delay grows as `base * 2^attempt`, capped, then a uniformly random value
/// in `[0, capped]` is used so a fleet of upstreams does not reconnect in
/// lockstep. Attempts are unbounded; terminal auth failures hold the session
/// instead of consulting this policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First retry delay
    pub base: Duration,

    /// Upper bound for any delay
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Deterministic capped delay for an attempt (0-indexed), before jitter
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        // Cap the exponent so the shift cannot overflow
        let exp = attempt.min(25);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.max)
    }

    /// Delay with full jitter applied
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if capped.is_zero() {
            return self.base;
        }
        let nanos = capped.as_nanos() as u64;
        let jittered = rand::thread_rng().gen_range(0..=nanos);
        Duration::from_nanos(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_delay_growth() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.capped_delay(0), Duration::from_secs(1));
        assert_eq!(policy.capped_delay(1), Duration::from_secs(2));
        assert_eq!(policy.capped_delay(5), Duration::from_secs(32));
        assert_eq!(policy.capped_delay(6), Duration::from_secs(60)); // Capped
        assert_eq!(policy.capped_delay(100), Duration::from_secs(60)); // Exponent clamped
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = ReconnectPolicy::default();
        for attempt in 0..20 {
            let delay = policy.next_delay(attempt);
            assert!(delay <= policy.capped_delay(attempt));
        }
    }

    #[test]
    fn test_huge_attempt_counts_never_zero_the_cap() {
        let policy = ReconnectPolicy::default();
        for attempt in [64, 128, 23_158_728u32, u32::MAX] {
            assert_eq!(policy.capped_delay(attempt), Duration::from_secs(60));
        }
    }
}
