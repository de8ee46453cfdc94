//! Records shared by the queue, playback and download subsystems.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// Stable identity of an episode across refresh cycles.
///
/// Built from the source feed URL and the item's guid, falling back to the
/// enclosure URL when the feed provides no guid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EpisodeId {
    pub feed_url: String,
    pub key: String,
}

impl EpisodeId {
    pub fn new(feed_url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            feed_url: feed_url.into(),
            key: key.into(),
        }
    }

    /// Derive the identity key for a feed item
    pub fn derive(feed_url: &str, guid: Option<&str>, enclosure_url: &str) -> Self {
        let key = guid
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .unwrap_or(enclosure_url);
        Self::new(feed_url, key)
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.feed_url, self.key)
    }
}

/// Lifecycle of a download record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Queued,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    /// States in which a new request is ignored
    pub fn is_active_or_done(self) -> bool {
        matches!(
            self,
            DownloadState::Queued | DownloadState::Downloading | DownloadState::Completed
        )
    }
}

/// A podcast subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub feed_url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subscribed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

impl Source {
    pub fn subscribed(feed_url: impl Into<String>) -> Self {
        Self {
            feed_url: feed_url.into(),
            title: None,
            subscribed: true,
            image_url: None,
            last_refreshed_at: None,
        }
    }
}

/// A single episode as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub title: String,
    pub audio_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub air_date: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclosure_length: Option<u64>,
    #[serde(default)]
    pub played: bool,
    #[serde(default)]
    pub play_progress_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub played_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_queued: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_state: Option<DownloadState>,
}

impl Episode {
    /// A fresh, unplayed and unqueued episode
    pub fn new(id: EpisodeId, title: impl Into<String>, audio_url: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            audio_url: audio_url.into(),
            air_date: None,
            duration_secs: None,
            description: None,
            image_url: None,
            mime_type: None,
            enclosure_length: None,
            played: false,
            play_progress_secs: 0.0,
            played_at: None,
            is_queued: false,
            queue_position: None,
            is_favorite: false,
            download_state: None,
        }
    }
}

/// Local download bookkeeping for one episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub episode_id: EpisodeId,
    pub local_path: PathBuf,
    pub state: DownloadState,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub bytes_downloaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub played_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    /// Set on `Failed` records the user may retry
    #[serde(default)]
    pub retriable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadRecord {
    pub fn queued(episode_id: EpisodeId, local_path: PathBuf) -> Self {
        Self {
            episode_id,
            local_path,
            state: DownloadState::Queued,
            progress: 0.0,
            bytes_downloaded: 0,
            total_bytes: None,
            content_hash: None,
            played_at: None,
            attempts: 0,
            retriable: false,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Path of the in-progress file for this record
    pub fn partial_path(&self) -> PathBuf {
        partial_path_for(&self.local_path)
    }
}

/// `<path>.partial`, the name a file has while it is being written
pub fn partial_path_for(path: &std::path::Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}
