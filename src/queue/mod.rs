//! The Up Next queue.
//!
//! [`QueueManager`] is a cheap, cloneable handle. All mutations are sent to a
//! single writer task which applies them one at a time, persists the new
//! ordering, and only then publishes it. Readers get point-in-time snapshots
//! from a `watch` channel and never observe a half-applied change.
//!
//! Invariants maintained by the writer:
//! - positions are always the dense range `0..len`, in list order
//! - an episode appears at most once
//! - removal renumbers everything after it in the same commit

mod writer;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::QueueError;
use crate::model::{Episode, EpisodeId, Source};
use crate::store::SharedRepository;

use writer::{QueueCommand, QueueWriter};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Ordered view of the queue at one version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Incremented on every committed mutation
    pub version: u64,
    pub episodes: Vec<EpisodeId>,
}

/// Change notifications, sent after the change is committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Enqueued {
        id: EpisodeId,
        position: usize,
    },
    Archived {
        id: EpisodeId,
        /// Position the episode had before removal
        position: usize,
        /// Episode playback should continue with, if any
        next: Option<EpisodeId>,
    },
    Moved {
        id: EpisodeId,
        from: usize,
        to: usize,
    },
    Cleared {
        removed: Vec<EpisodeId>,
    },
    EpisodesMerged {
        feed_url: String,
        inserted: Vec<EpisodeId>,
        auto_enqueued: Option<EpisodeId>,
    },
}

/// Result of archiving a queued episode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutcome {
    pub position: usize,
    /// The episode that followed it, or the new head when it was last
    pub next: Option<EpisodeId>,
}

/// Result of merging a feed's episodes into the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: Vec<EpisodeId>,
    pub skipped: usize,
    pub auto_enqueued: Option<EpisodeId>,
}

/// Handle to the queue writer
#[derive(Clone)]
pub struct QueueManager {
    command_tx: mpsc::Sender<QueueCommand>,
    snapshot_rx: watch::Receiver<QueueSnapshot>,
    events_tx: broadcast::Sender<QueueEvent>,
}

impl QueueManager {
    /// Restore the queue from `store` and spawn its writer task.
    ///
    /// Must be called from within a Tokio runtime. The writer stops once
    /// every handle has been dropped.
    pub fn start(store: SharedRepository) -> Self {
        let order: Vec<EpisodeId> = store
            .queued_episodes_sorted_by_position()
            .into_iter()
            .map(|e| e.id)
            .collect();

        let needs_renumbering = store
            .queued_episodes_sorted_by_position()
            .iter()
            .enumerate()
            .any(|(i, e)| e.queue_position != Some(i));
        if needs_renumbering {
            tracing::warn!(len = order.len(), "Stored queue positions were not dense, renumbering");
            if let Err(e) = store.write_queue(&order) {
                tracing::error!(error = %e, "Failed to renumber stored queue");
            }
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(QueueSnapshot {
            version: 0,
            episodes: order.clone(),
        });
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let writer = QueueWriter::new(store, order, command_rx, snapshot_tx, events_tx.clone());
        tokio::spawn(writer.run());

        Self {
            command_tx,
            snapshot_rx,
            events_tx,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, QueueError>>) -> QueueCommand,
    ) -> Result<T, QueueError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| QueueError::Shutdown)?;
        reply_rx.await.map_err(|_| QueueError::Shutdown)?
    }

    /// Append an episode. Returns its position, or `None` when it was
    /// already queued or is unknown.
    pub async fn enqueue(&self, id: EpisodeId) -> Result<Option<usize>, QueueError> {
        self.request(|reply| QueueCommand::Enqueue { id, reply })
            .await
    }

    /// Remove an episode and renumber the rest. `None` when it wasn't queued.
    pub async fn archive(&self, id: EpisodeId) -> Result<Option<ArchiveOutcome>, QueueError> {
        self.request(|reply| QueueCommand::Archive { id, reply })
            .await
    }

    /// Move an episode to `index`, clamped to the end of the queue.
    /// Returns the final position, or `None` when it isn't queued.
    pub async fn move_to(&self, id: EpisodeId, index: usize) -> Result<Option<usize>, QueueError> {
        self.request(|reply| QueueCommand::MoveTo { id, index, reply })
            .await
    }

    /// Archive everything, returning what was removed
    pub async fn clear(&self) -> Result<Vec<EpisodeId>, QueueError> {
        self.request(|reply| QueueCommand::Clear { reply }).await
    }

    /// Insert new feed episodes and apply the auto-enqueue rule on the writer
    pub async fn merge_episodes(
        &self,
        source: Source,
        episodes: Vec<Episode>,
    ) -> Result<MergeOutcome, QueueError> {
        self.request(|reply| QueueCommand::Merge {
            source,
            episodes,
            reply,
        })
        .await
    }

    /// Current ordering
    pub fn snapshot(&self) -> Vec<EpisodeId> {
        self.snapshot_rx.borrow().episodes.clone()
    }

    /// Current ordering with its version
    pub fn versioned_snapshot(&self) -> QueueSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot_rx.borrow().episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position_of(&self, id: &EpisodeId) -> Option<usize> {
        self.snapshot_rx
            .borrow()
            .episodes
            .iter()
            .position(|queued| queued == id)
    }

    pub fn head(&self) -> Option<EpisodeId> {
        self.snapshot_rx.borrow().episodes.first().cloned()
    }

    /// Watch the snapshot; `changed()` fires after each commit
    pub fn watch(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events_tx.subscribe()
    }
}
