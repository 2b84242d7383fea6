/// Engine configuration, loadable from a JSON file
use crate::tally::aggregator::ClassificationMode;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// How a change-feed listener retries its subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Fixed delay before re-subscribing.
    pub backoff_ms: u64,
    /// Consecutive failed attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Consecutive failures after which the dashboard shows a warning.
    pub warn_after: u32,
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Bounded policy used by the score tally path.
    pub fn bounded(backoff_ms: u64, max_attempts: u32) -> Self {
        Self {
            backoff_ms,
            max_attempts: Some(max_attempts),
            warn_after: 3.min(max_attempts),
        }
    }

    /// Unbounded policy used by the list and statistics paths.
    pub fn unbounded(backoff_ms: u64) -> Self {
        Self {
            backoff_ms,
            max_attempts: None,
            warn_after: 3,
        }
    }
}

/// Keys given for a retry policy in a config file. Missing keys fall back
/// to the preset of the path being configured, not to one shared default.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RetryOverrides {
    backoff_ms: Option<u64>,
    max_attempts: Option<u32>,
    warn_after: Option<u32>,
}

impl RetryOverrides {
    fn apply(self, preset: RetryPolicy) -> RetryPolicy {
        let max_attempts = self.max_attempts.or(preset.max_attempts);
        let warn_after = self.warn_after.unwrap_or(match max_attempts {
            Some(max) => preset.warn_after.min(max),
            None => preset.warn_after,
        });
        RetryPolicy {
            backoff_ms: self.backoff_ms.unwrap_or(preset.backoff_ms),
            max_attempts,
            warn_after,
        }
    }
}

fn score_feed_policy() -> RetryPolicy {
    RetryPolicy::bounded(1000, 5)
}

fn stats_feed_policy() -> RetryPolicy {
    RetryPolicy::unbounded(2000)
}

fn deserialize_score_feed<'de, D: Deserializer<'de>>(de: D) -> Result<RetryPolicy, D::Error> {
    Ok(RetryOverrides::deserialize(de)?.apply(score_feed_policy()))
}

fn deserialize_stats_feed<'de, D: Deserializer<'de>>(de: D) -> Result<RetryPolicy, D::Error> {
    Ok(RetryOverrides::deserialize(de)?.apply(stats_feed_policy()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pending marks that trigger an automatic flush for one candidate.
    pub batch_size: u32,
    pub classification: ClassificationMode,
    /// Conditional-update retries when a score changed between read and write.
    pub flush_conflict_retries: u32,
    /// Score tally path; always bounded.
    #[serde(deserialize_with = "deserialize_score_feed")]
    pub score_feed: RetryPolicy,
    #[serde(deserialize_with = "deserialize_stats_feed")]
    pub stats_feed: RetryPolicy,
    /// Polling period of the change-log feed.
    pub poll_interval_ms: u64,
    pub command_queue_depth: usize,
    pub metrics_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            classification: ClassificationMode::Stored,
            flush_conflict_retries: 3,
            score_feed: score_feed_policy(),
            stats_feed: stats_feed_policy(),
            poll_interval_ms: 500,
            command_queue_depth: 64,
            metrics_history: 256,
        }
    }
}

impl EngineConfig {
    /// Load a config file; missing keys take their default values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".to_string()));
        }
        if self.command_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "command_queue_depth must be > 0".to_string(),
            ));
        }
        if self.score_feed.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "score_feed.max_attempts must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
