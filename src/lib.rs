pub mod config;
pub mod download;
pub mod error;
pub mod feed;
pub mod http;
pub mod model;
pub mod playback;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod store;
pub mod sync;

// Re-export main types for convenience
pub use config::{Config, DownloadConfig, PlaybackConfig, RetryConfig, SyncConfig};
pub use download::DownloadManager;
pub use error::{
    ConfigError, DownloadError, FeedError, PlaybackError, QueueError, StoreError, SyncError,
};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use model::{DownloadRecord, DownloadState, Episode, EpisodeId, Source};
pub use playback::{
    AudioBackend, AudioSession, MediaSource, PlaybackCoordinator, PlaybackState, PlaybackStatus,
    SessionEvent, format_remaining,
};
pub use progress::{
    BroadcastReporter, NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter,
};
pub use queue::{ArchiveOutcome, QueueEvent, QueueManager, QueueSnapshot};
pub use store::{JsonStore, Repository, SharedRepository};
pub use sync::{AggregateReport, FeedSyncEngine, SourceReport, SourceStatus, SyncOutcome};
