use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::PlaybackError;

/// Where a session reads its audio from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// A completed download on disk
    File(PathBuf),
    /// The episode's enclosure URL
    Url(String),
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::File(path) => write!(f, "{}", path.display()),
            MediaSource::Url(url) => f.write_str(url),
        }
    }
}

/// Things a session reports on its own
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Playback reached the natural end of the media
    Ended,
    /// The session broke and can no longer play
    Failed(String),
}

/// Sender handed to a session when it is opened.
///
/// Every event is tagged with the session's generation so the coordinator
/// can drop events from sessions it has already released.
#[derive(Debug, Clone)]
pub struct SessionEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, SessionEvent)>,
}

impl SessionEventSender {
    pub(super) fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, SessionEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Report an event. Returns `false` once the coordinator is gone.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Opens audio sessions. Decoding and output live behind this trait.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Prepare `source` for playback. The returned session starts paused at
    /// position zero.
    async fn open(
        &self,
        source: MediaSource,
        events: SessionEventSender,
    ) -> Result<Box<dyn AudioSession>, PlaybackError>;
}

/// One loaded piece of media
pub trait AudioSession: Send {
    fn play(&mut self) -> Result<(), PlaybackError>;

    fn pause(&mut self) -> Result<(), PlaybackError>;

    /// Jump to `position_secs`; callers clamp to the media bounds
    fn seek(&mut self, position_secs: f64) -> Result<(), PlaybackError>;

    fn position(&self) -> f64;

    /// Total length, once known
    fn duration(&self) -> Option<f64>;

    /// Release the underlying resources. The session is not used afterwards.
    fn stop(&mut self);
}
