//! Configuration types for the engine

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Feed refresh settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Number of feeds fetched in parallel (default: 4)
    #[serde(default = "default_sync_workers")]
    pub workers: usize,

    /// Give up on a single feed fetch after this long (default: 30 seconds)
    #[serde(default = "default_fetch_timeout", with = "duration_secs")]
    pub fetch_timeout: Duration,

    /// Deadline for a whole `refresh_all` batch (default: 120 seconds)
    #[serde(default = "default_refresh_timeout", with = "duration_secs")]
    pub refresh_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_sync_workers(),
            fetch_timeout: default_fetch_timeout(),
            refresh_timeout: default_refresh_timeout(),
        }
    }
}

/// Retry behavior for transient download failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_secs")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_secs")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Download worker pool settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory downloaded audio is written to (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Number of parallel transfers (default: 2)
    #[serde(default = "default_download_workers")]
    pub workers: usize,

    /// Abandon a transfer when no bytes arrive for this long (default: 60 seconds)
    #[serde(default = "default_inactivity_timeout", with = "duration_secs")]
    pub inactivity_timeout: Duration,

    /// Remove played downloads this long after playback (default: 24 hours)
    #[serde(default = "default_retention", with = "duration_secs")]
    pub retention: Duration,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            workers: default_download_workers(),
            inactivity_timeout: default_inactivity_timeout(),
            retention: default_retention(),
            retry: RetryConfig::default(),
        }
    }
}

/// Playback coordinator settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Start the next queued episode when one finishes (default: true)
    #[serde(default = "default_true")]
    pub autoplay_next: bool,

    /// How often the play position is written to the store (default: 5 seconds)
    #[serde(default = "default_progress_interval", with = "duration_secs")]
    pub progress_interval: Duration,

    /// Default skip-forward step in seconds (default: 30)
    #[serde(default = "default_skip_forward")]
    pub skip_forward_secs: f64,

    /// Default skip-backward step in seconds (default: 15)
    #[serde(default = "default_skip_backward")]
    pub skip_backward_secs: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            autoplay_next: true,
            progress_interval: default_progress_interval(),
            skip_forward_secs: default_skip_forward(),
            skip_backward_secs: default_skip_backward(),
        }
    }
}

/// Main configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// JSON file backing the store (None = in-memory only)
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,
}

impl Config {
    /// Load configuration from a JSON file, filling in defaults for missing fields
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::JsonParseFailed {
                path: path.to_path_buf(),
                source: e,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "sync.workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.download.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "download.workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.download.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "download.retry.backoff_multiplier",
                reason: format!("{} is below 1.0", self.download.retry.backoff_multiplier),
            });
        }
        if self.playback.progress_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "playback.progress_interval",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_sync_workers() -> usize {
    4
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_refresh_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_download_workers() -> usize {
    2
}

fn default_inactivity_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_skip_forward() -> f64 {
    30.0
}

fn default_skip_backward() -> f64 {
    15.0
}

// Durations are stored as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
