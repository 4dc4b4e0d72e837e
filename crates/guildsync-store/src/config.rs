use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for a [`crate::Store`].
///
/// The defaults are the constants the system was operated with: debounce
/// windows sized to stay under the content API's rate limits, conflict
/// retries spread over 500–1500 ms so two colliding writers de-synchronize.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path prefix for every remote blob (one scope per mirrored server).
    pub server_scope: String,
    /// Debounce base delay for singleton blobs.
    pub debounce_base: Duration,
    /// Random extra delay added on top of the base.
    pub debounce_jitter: Duration,
    /// Debounce base delay for ledger blobs (longer: ledgers batch whole
    /// backfill pages, not single field updates).
    pub ledger_debounce_base: Duration,
    /// Total put attempts per commit (the initial try counts as one) before
    /// giving up and leaving the entry dirty. The default of 3 means one try
    /// plus two retries; a failed commit is retried anyway on the next
    /// scheduled write or flush, so the budget bounds latency, not durability.
    pub max_commit_attempts: u32,
    /// Bounds of the randomized backoff between commit retries.
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
    /// Records per append page during backfill scans.
    pub ledger_page_size: usize,
}

impl StoreConfig {
    pub fn new(server_scope: impl Into<String>) -> Self {
        Self {
            server_scope: server_scope.into(),
            ..Self::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            server_scope: "default".into(),
            debounce_base: Duration::from_secs(3),
            debounce_jitter: Duration::from_secs(2),
            ledger_debounce_base: Duration::from_secs(5),
            max_commit_attempts: 3,
            retry_backoff_min: Duration::from_millis(500),
            retry_backoff_max: Duration::from_millis(1500),
            ledger_page_size: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = StoreConfig::default();
        assert_eq!(c.debounce_base, Duration::from_secs(3));
        assert_eq!(c.debounce_jitter, Duration::from_secs(2));
        assert_eq!(c.ledger_debounce_base, Duration::from_secs(5));
        assert_eq!(c.max_commit_attempts, 3);
        assert_eq!(c.ledger_page_size, 100);
        assert!(c.retry_backoff_min < c.retry_backoff_max);
    }

    #[test]
    fn scoped_config() {
        let c = StoreConfig::new("guild-42");
        assert_eq!(c.server_scope, "guild-42");
        assert_eq!(c.max_commit_attempts, StoreConfig::default().max_commit_attempts);
    }
}
