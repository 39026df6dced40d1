//! Engine policy, loadable from TOML. Every field has a default, so an empty
//! file (or no file) yields the stock policy.
//!
//! ```toml
//! [dedup]
//! match_memory_ttl_ms = 10000
//!
//! [fallback]
//! delay_ms = 2000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EventKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub dedup: DedupConfig,
    pub router: RouterConfig,
    pub fallback: FallbackConfig,
    pub listener: ListenerConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// In-process window for rapid duplicate match firings.
    pub match_memory_ttl_ms: u64,
    /// Cross-restart window for the same match pair.
    pub match_persist_ttl_ms: u64,
    pub message_memory_ttl_ms: u64,
    /// Messages are only deduplicated in memory unless this is set.
    pub message_persist_ttl_ms: Option<u64>,
    /// Pause between marking an event shown and re-checking for a racing writer.
    pub race_recheck_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            match_memory_ttl_ms: 10_000,
            match_persist_ttl_ms: 3_600_000,
            message_memory_ttl_ms: 30_000,
            message_persist_ttl_ms: None,
            race_recheck_ms: 50,
        }
    }
}

impl DedupConfig {
    pub fn memory_ttl_ms(&self, kind: EventKind) -> i64 {
        let ms = match kind {
            EventKind::Match => self.match_memory_ttl_ms,
            EventKind::Message => self.message_memory_ttl_ms,
        };
        ms as i64
    }

    /// `None` means the kind is not written to the persistent store.
    pub fn persist_ttl_ms(&self, kind: EventKind) -> Option<i64> {
        match kind {
            EventKind::Match => Some(self.match_persist_ttl_ms as i64),
            EventKind::Message => self.message_persist_ttl_ms.map(|ms| ms as i64),
        }
    }

    pub fn race_recheck(&self) -> Duration {
        Duration::from_millis(self.race_recheck_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Capacity of the listener → router queue.
    pub queue_capacity: usize,
    /// Gap between events replayed after `init`.
    pub replay_spacing_ms: u64,
    pub session_retry_interval_ms: u64,
    /// Attempts to wait for a session before an event is dropped.
    pub session_retry_budget: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            replay_spacing_ms: 150,
            session_retry_interval_ms: 500,
            session_retry_budget: 10,
        }
    }
}

impl RouterConfig {
    pub fn replay_spacing(&self) -> Duration {
        Duration::from_millis(self.replay_spacing_ms)
    }

    pub fn session_retry_interval(&self) -> Duration {
        Duration::from_millis(self.session_retry_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Head start given to the managed push transport.
    pub delay_ms: u64,
    /// Entries older than this are swept even if never cancelled.
    pub stale_after_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            delay_ms: 2_000,
            stale_after_ms: 300_000,
            sweep_interval_ms: 60_000,
        }
    }
}

impl FallbackConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Records older than this when first observed are treated as history.
    pub freshness_grace_ms: u64,
    /// Per-subscription memory of already-forwarded document ids.
    pub seen_ids_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            freshness_grace_ms: 30_000,
            seen_ids_capacity: 256,
        }
    }
}

impl ListenerConfig {
    pub fn freshness_grace(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.freshness_grace_ms as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// A store call slower than this counts as failed.
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { timeout_ms: 1_500 }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl NotifyConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: NotifyConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listener.freshness_grace_ms == 0 {
            return Err(ConfigError::Invalid(
                "listener.freshness_grace_ms must be positive".into(),
            ));
        }
        if self.router.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "router.queue_capacity must be positive".into(),
            ));
        }
        if self.dedup.match_persist_ttl_ms < self.dedup.match_memory_ttl_ms {
            return Err(ConfigError::Invalid(
                "dedup.match_persist_ttl_ms is shorter than match_memory_ttl_ms".into(),
            ));
        }
        if let Some(ttl) = self.dedup.message_persist_ttl_ms {
            if ttl < self.dedup.message_memory_ttl_ms {
                return Err(ConfigError::Invalid(
                    "dedup.message_persist_ttl_ms is shorter than message_memory_ttl_ms".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = NotifyConfig::from_toml_str("").unwrap();
        assert_eq!(config, NotifyConfig::default());
        assert_eq!(config.dedup.memory_ttl_ms(EventKind::Match), 10_000);
        assert_eq!(config.dedup.memory_ttl_ms(EventKind::Message), 30_000);
        assert_eq!(config.dedup.persist_ttl_ms(EventKind::Match), Some(3_600_000));
        assert_eq!(config.dedup.persist_ttl_ms(EventKind::Message), None);
        assert_eq!(config.fallback.delay(), Duration::from_secs(2));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = NotifyConfig::from_toml_str(
            r#"
            [dedup]
            match_memory_ttl_ms = 5000

            [fallback]
            delay_ms = 3000
            "#,
        )
        .unwrap();
        assert_eq!(config.dedup.match_memory_ttl_ms, 5_000);
        assert_eq!(config.dedup.message_memory_ttl_ms, 30_000);
        assert_eq!(config.fallback.delay_ms, 3_000);
        assert_eq!(config.fallback.stale_after_ms, 300_000);
    }

    #[test]
    fn zero_grace_is_rejected() {
        let err = NotifyConfig::from_toml_str("[listener]\nfreshness_grace_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn persist_shorter_than_memory_is_rejected() {
        let err = NotifyConfig::from_toml_str(
            "[dedup]\nmatch_memory_ttl_ms = 20000\nmatch_persist_ttl_ms = 1000",
        )
        .unwrap_err();
        assert!(err.to_string().contains("match_persist_ttl_ms"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = NotifyConfig::from_toml_str("[dedup\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = NotifyConfig::load(Path::new("/nonexistent/rendezvous.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
