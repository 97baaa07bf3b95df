//! Configuration for the offline sync context.
//!
//! # Example
//!
//! ```
//! use medsync::SyncConfig;
//!
//! // Minimal config (uses defaults, memory-only store)
//! let config = SyncConfig::default();
//! assert_eq!(config.max_attempts, 3);
//!
//! // Full config
//! let config = SyncConfig {
//!     db_path: Some("./medsync.db".into()),
//!     max_attempts: 5,
//!     drain_batch_size: 50,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Configuration for the sync context.
///
/// All fields have sensible defaults. Without a `db_path` the context runs
/// memory-only, which loses the durability guarantees of the sync queue.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Path to the SQLite file backing the local store.
    /// `None` means memory-only operation (no crash durability).
    #[serde(default)]
    pub db_path: Option<String>,

    /// Passphrase for at-rest encryption of the local store.
    /// `None` disables the encryption layer.
    #[serde(default)]
    pub encryption_passphrase: Option<String>,

    /// Maximum delivery attempts before a queue item is abandoned.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential retry backoff, in milliseconds.
    /// `next_attempt_at = now + base * 2^attempts`, capped at `backoff_cap_ms`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on the retry backoff delay, in milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Maximum queue items taken per drain batch.
    #[serde(default = "default_drain_batch_size")]
    pub drain_batch_size: usize,

    /// Grace period after connectivity returns before a drain is triggered,
    /// in milliseconds. Smooths over flapping links.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Periodic drain interval while online, in seconds.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Pull server-authoritative records after each successful drain.
    #[serde(default = "default_pull_after_drain")]
    pub pull_after_drain: bool,
}

fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 1_000 }
fn default_backoff_cap_ms() -> u64 { 300_000 } // 5 minutes
fn default_drain_batch_size() -> usize { 25 }
fn default_debounce_ms() -> u64 { 2_000 }
fn default_sync_interval_secs() -> u64 { 300 } // 5 minutes
fn default_pull_after_drain() -> bool { true }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            encryption_passphrase: None,
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            drain_batch_size: default_drain_batch_size(),
            debounce_ms: default_debounce_ms(),
            sync_interval_secs: default_sync_interval_secs(),
            pull_after_drain: default_pull_after_drain(),
        }
    }
}

impl SyncConfig {
    /// Compute the backoff delay for a given attempt count, in milliseconds.
    #[must_use]
    pub fn backoff_delay_ms(&self, attempts: u32) -> u64 {
        let shift = attempts.min(20); // avoid overflow on absurd attempt counts
        self.backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_cap_ms)
    }

    /// Fast settings for tests (tiny delays, no debounce).
    #[cfg(test)]
    pub(crate) fn test() -> Self {
        Self {
            backoff_base_ms: 1,
            backoff_cap_ms: 10,
            debounce_ms: 0,
            sync_interval_secs: 1,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert!(config.db_path.is_none());
        assert!(config.encryption_passphrase.is_none());
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base_ms, 1_000);
        assert_eq!(config.sync_interval_secs, 300);
        assert!(config.pull_after_drain);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SyncConfig = serde_json::from_str(r#"{"max_attempts": 7}"#).unwrap();
        assert_eq!(config.max_attempts, 7);
        // Everything else falls back to defaults
        assert_eq!(config.drain_batch_size, 25);
        assert_eq!(config.debounce_ms, 2_000);
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let config = SyncConfig::default();
        assert_eq!(config.backoff_delay_ms(0), 1_000);
        assert_eq!(config.backoff_delay_ms(1), 2_000);
        assert_eq!(config.backoff_delay_ms(2), 4_000);
        assert_eq!(config.backoff_delay_ms(3), 8_000);
    }

    #[test]
    fn test_backoff_delay_caps() {
        let config = SyncConfig::default();
        // 2^10 seconds is way past the 5 minute cap
        assert_eq!(config.backoff_delay_ms(10), 300_000);
        // Huge attempt counts must not overflow
        assert_eq!(config.backoff_delay_ms(u32::MAX), 300_000);
    }
}
