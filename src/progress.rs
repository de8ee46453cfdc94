use std::sync::Arc;

use tokio::sync::broadcast;

use crate::model::EpisodeId;

/// Events emitted by feed refreshes and the download pool
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Feed is being fetched from URL
    FetchingFeed { url: String },

    /// Feed bytes arrived and are being parsed
    ParsingFeed { url: String },

    /// New episodes from a feed were written to the store
    FeedMerged {
        url: String,
        podcast_title: String,
        inserted: usize,
        skipped: usize,
        auto_enqueued: Option<EpisodeId>,
    },

    /// A feed could not be refreshed
    FeedFailed { url: String, error: String },

    /// A `refresh_all` batch resolved
    RefreshCompleted {
        succeeded: usize,
        failed: usize,
        timed_out: usize,
    },

    /// An episode entered the download admission queue
    DownloadQueued { episode_id: EpisodeId },

    /// A worker picked up a download
    DownloadStarting {
        /// Worker slot (0 to workers-1)
        worker: usize,
        episode_id: EpisodeId,
        episode_title: String,
        /// Expected content length in bytes, if known
        content_length: Option<u64>,
    },

    /// Download progress update
    DownloadProgress {
        episode_id: EpisodeId,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
        /// Fraction in [0, 1]; 0 while the total is unknown
        progress: f64,
    },

    /// A transient failure is being retried
    DownloadRetrying {
        episode_id: EpisodeId,
        attempt: u32,
        error: String,
    },

    /// A download completed successfully
    DownloadCompleted {
        episode_id: EpisodeId,
        bytes_downloaded: u64,
        content_hash: String,
    },

    /// A download failed
    DownloadFailed {
        episode_id: EpisodeId,
        error: String,
        retriable: bool,
    },

    /// A queued or running download was cancelled
    DownloadCancelled { episode_id: EpisodeId },

    /// A downloaded file and its record were deleted
    DownloadRemoved { episode_id: EpisodeId },

    /// Retention sweep finished
    RetentionSwept { removed: usize },

    /// Partial files were cleaned up during startup
    PartialFilesCleanedUp { count: usize },
}

/// Trait for reporting progress events.
///
/// Implementations can use this to display progress bars, log messages,
/// or forward events to UI subscribers.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {
        // Intentionally empty
    }
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

/// Forwards every event to a broadcast channel.
///
/// Slow subscribers lag and skip events; the reporter never blocks.
#[derive(Debug, Clone)]
pub struct BroadcastReporter {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn shared(self) -> SharedProgressReporter {
        Arc::new(self)
    }
}

impl ProgressReporter for BroadcastReporter {
    fn report(&self, event: ProgressEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_reporter_handles_all_events() {
        let reporter = NoopReporter;
        let id = EpisodeId::new("https://example.com/feed.xml", "ep1");

        reporter.report(ProgressEvent::FetchingFeed {
            url: "https://example.com/feed.xml".to_string(),
        });
        reporter.report(ProgressEvent::DownloadStarting {
            worker: 0,
            episode_id: id.clone(),
            episode_title: "Episode 1".to_string(),
            content_length: Some(1024),
        });
        reporter.report(ProgressEvent::DownloadFailed {
            episode_id: id,
            error: "Connection timeout".to_string(),
            retriable: true,
        });
        reporter.report(ProgressEvent::RetentionSwept { removed: 2 });
    }

    #[tokio::test]
    async fn broadcast_reporter_forwards_events() {
        let reporter = BroadcastReporter::new(8);
        let mut rx = reporter.subscribe();

        reporter.report(ProgressEvent::PartialFilesCleanedUp { count: 3 });

        assert_eq!(
            rx.recv().await.unwrap(),
            ProgressEvent::PartialFilesCleanedUp { count: 3 }
        );
    }

    #[test]
    fn broadcast_reporter_without_subscribers_does_not_fail() {
        let reporter = BroadcastReporter::new(1).shared();
        reporter.report(ProgressEvent::RetentionSwept { removed: 0 });
    }
}
