//! ---
//! mh_section: "01-core-functionality"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Bounded exponential backoff used by session connect retries."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

/// Bounded exponential backoff policy.
///
/// Connection setup against remote infrastructure is retried a fixed number
/// of times with exponentially growing, jittered delays before the failure
/// is surfaced to the caller.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub initial_delay: Duration,
    #[serde(default = "default_max_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Policy with a single attempt and no waiting, for tests and probes.
    pub fn immediate() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to sleep before retry number `attempt` (1-based, i.e. the
    /// delay after the `attempt`-th failure). Doubles per attempt, capped
    /// at `max_delay`, with up to 20% random jitter added to avoid retry
    /// stampedes when several hosts come up simultaneously.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..0.2);
        base.mul_f64(1.0 + jitter).min(self.max_delay)
    }

    /// Iterator over the delays separating consecutive attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(|attempt| self.delay_for(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(delays.len(), 5);
        assert!(delays[0] >= Duration::from_millis(100));
        assert!(delays[0] <= Duration::from_millis(120));
        for delay in &delays {
            assert!(*delay <= Duration::from_millis(500));
        }
        // The fourth delay would be 800ms unjittered, so the cap must bind.
        assert_eq!(delays[4], Duration::from_millis(500));
    }

    #[test]
    fn immediate_policy_never_sleeps() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delays().count(), 0);
        assert_eq!(policy.delay_for(3), Duration::ZERO);
    }

    #[test]
    fn defaults_deserialize_from_empty_mapping() {
        let policy: RetryPolicy = serde_yaml::from_str("{}").expect("defaults apply");
        assert_eq!(policy, RetryPolicy::default());
    }
}
