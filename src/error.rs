use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::EpisodeId;

/// Errors that can occur when fetching or parsing RSS/Atom feeds
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch feed from {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Timed out fetching feed from {url} after {timeout:?}")]
    FetchTimedOut { url: String, timeout: Duration },

    #[error("Failed to read feed file {path}: {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse feed: {0}")]
    ParseFailed(String),

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Episode '{title}' has no enclosure (audio file)")]
    MissingEnclosure { title: String },

    #[error("Feed {url} contains no playable episodes")]
    Empty { url: String },
}

/// Errors that can occur during episode downloads
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to create file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {from} into place: {source}")]
    FinalizeFailed {
        from: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Download of {url} stalled: no data for {timeout:?}")]
    Stalled { url: String, timeout: Duration },

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Episode {0} is not in the store")]
    UnknownEpisode(EpisodeId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors raised by the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read store file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write store file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse store JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize store: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),

    #[error("Queue ordering references unknown episode {0}")]
    UnknownEpisode(EpisodeId),
}

/// Errors returned by the queue writer
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to persist queue: {0}")]
    Store(#[from] StoreError),

    #[error("Queue manager has shut down")]
    Shutdown,
}

/// Errors surfaced by the playback coordinator and audio sessions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("Episode {0} is not in the store")]
    UnknownEpisode(EpisodeId),

    #[error("Failed to open audio for {episode}: {reason}")]
    OpenFailed { episode: EpisodeId, reason: String },

    #[error("Audio session failed: {0}")]
    SessionFailed(String),

    #[error("Playback coordinator has shut down")]
    Shutdown,
}

/// Errors for a single feed refresh
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Refresh timed out")]
    TimedOut,

    #[error("Refresh task failed: {0}")]
    TaskFailed(String),
}

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}
