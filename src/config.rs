use std::time::Duration;

use crate::store::Durability;

/// Number of tiles fetched and committed together.
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Retry behavior for tiles that fail within a batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// How many failed rounds a single tile may go through before the run is
    /// aborted. Zero retries forever.
    ///
    /// Rounds that end with a credential switch don't count.
    pub max_attempts: u32,

    /// Delay before the n-th retry round is `backoff * n`.
    pub backoff: Duration,

    /// Upper bound for the delay between two rounds.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Retries forever, without any delay between rounds.
    pub const UNBOUNDED: RetryPolicy = RetryPolicy {
        max_attempts: 0,
        backoff: Duration::from_secs(0),
        max_backoff: Duration::from_secs(0),
    };

    /// Whether a tile that failed `attempts` rounds may still be retried.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    /// Delay before retry round `round` (starting at 1).
    pub fn delay(&self, round: u32) -> Duration {
        self.backoff.saturating_mul(round).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 20,
            backoff: Duration::from_secs(0),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Tile download configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Maximum number of tiles per batch. Every tile of a batch is requested
    /// in parallel.
    pub batch_size: usize,

    pub retry: RetryPolicy,

    /// Timeout for fetching a single tile.
    ///
    /// Pass the zero duration to disable the timeout.
    pub timeout: Duration,

    pub durability: Durability,

    /// Whether to draw a progress bar per zoom level.
    pub show_progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            durability: Durability::default(),
            show_progress: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(RetryPolicy::UNBOUNDED.allows(u32::MAX));
    }

    #[test]
    fn backoff_escalates_up_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 0,
            backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(5),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(5));
        assert_eq!(RetryPolicy::default().delay(7), Duration::ZERO);
    }
}
