use std::collections::HashSet;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::QueueError;
use crate::model::{Episode, EpisodeId, Source};
use crate::store::SharedRepository;

use super::{ArchiveOutcome, MergeOutcome, QueueEvent, QueueSnapshot};

pub(super) type Reply<T> = oneshot::Sender<Result<T, QueueError>>;

pub(super) enum QueueCommand {
    Enqueue {
        id: EpisodeId,
        reply: Reply<Option<usize>>,
    },
    Archive {
        id: EpisodeId,
        reply: Reply<Option<ArchiveOutcome>>,
    },
    MoveTo {
        id: EpisodeId,
        index: usize,
        reply: Reply<Option<usize>>,
    },
    Clear {
        reply: Reply<Vec<EpisodeId>>,
    },
    Merge {
        source: Source,
        episodes: Vec<Episode>,
        reply: Reply<MergeOutcome>,
    },
}

/// Owns the queue ordering. Runs on its own task; every mutation in the
/// process goes through [`QueueWriter::run`], one command at a time.
pub(super) struct QueueWriter {
    store: SharedRepository,
    order: Vec<EpisodeId>,
    members: HashSet<EpisodeId>,
    version: u64,
    command_rx: mpsc::Receiver<QueueCommand>,
    snapshot_tx: watch::Sender<QueueSnapshot>,
    events_tx: broadcast::Sender<QueueEvent>,
}

impl QueueWriter {
    pub(super) fn new(
        store: SharedRepository,
        order: Vec<EpisodeId>,
        command_rx: mpsc::Receiver<QueueCommand>,
        snapshot_tx: watch::Sender<QueueSnapshot>,
        events_tx: broadcast::Sender<QueueEvent>,
    ) -> Self {
        let members = order.iter().cloned().collect();
        Self {
            store,
            order,
            members,
            version: 0,
            command_rx,
            snapshot_tx,
            events_tx,
        }
    }

    pub(super) async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            match command {
                QueueCommand::Enqueue { id, reply } => {
                    let _ = reply.send(self.enqueue(id));
                }
                QueueCommand::Archive { id, reply } => {
                    let _ = reply.send(self.archive(&id));
                }
                QueueCommand::MoveTo { id, index, reply } => {
                    let _ = reply.send(self.move_to(&id, index));
                }
                QueueCommand::Clear { reply } => {
                    let _ = reply.send(self.clear());
                }
                QueueCommand::Merge {
                    source,
                    episodes,
                    reply,
                } => {
                    let _ = reply.send(self.merge(source, episodes));
                }
            }
        }
        tracing::debug!("Queue writer stopped");
    }

    /// Persist `next` as the new ordering and publish it
    fn commit(&mut self, next: Vec<EpisodeId>) -> Result<(), QueueError> {
        self.store.write_queue(&next)?;

        self.members = next.iter().cloned().collect();
        self.order = next;
        self.version += 1;
        self.snapshot_tx.send_replace(QueueSnapshot {
            version: self.version,
            episodes: self.order.clone(),
        });
        Ok(())
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events_tx.send(event);
    }

    fn enqueue(&mut self, id: EpisodeId) -> Result<Option<usize>, QueueError> {
        if self.members.contains(&id) || !self.store.contains_episode(&id) {
            return Ok(None);
        }

        let position = self.order.len();
        let mut next = self.order.clone();
        next.push(id.clone());
        self.commit(next)?;

        tracing::debug!(episode = %id, position, "Enqueued episode");
        self.emit(QueueEvent::Enqueued { id, position });
        Ok(Some(position))
    }

    fn archive(&mut self, id: &EpisodeId) -> Result<Option<ArchiveOutcome>, QueueError> {
        let Some(position) = self.order.iter().position(|queued| queued == id) else {
            return Ok(None);
        };

        let mut next = self.order.clone();
        next.remove(position);
        let successor = next.get(position).or_else(|| next.first()).cloned();
        self.commit(next)?;

        tracing::debug!(episode = %id, position, "Archived episode");
        self.emit(QueueEvent::Archived {
            id: id.clone(),
            position,
            next: successor.clone(),
        });
        Ok(Some(ArchiveOutcome {
            position,
            next: successor,
        }))
    }

    fn move_to(&mut self, id: &EpisodeId, index: usize) -> Result<Option<usize>, QueueError> {
        let Some(from) = self.order.iter().position(|queued| queued == id) else {
            return Ok(None);
        };

        let to = index.min(self.order.len() - 1);
        if to == from {
            return Ok(Some(to));
        }

        let mut next = self.order.clone();
        let moved = next.remove(from);
        next.insert(to, moved);
        self.commit(next)?;

        self.emit(QueueEvent::Moved {
            id: id.clone(),
            from,
            to,
        });
        Ok(Some(to))
    }

    fn clear(&mut self) -> Result<Vec<EpisodeId>, QueueError> {
        if self.order.is_empty() {
            return Ok(Vec::new());
        }

        let removed = self.order.clone();
        self.commit(Vec::new())?;

        self.emit(QueueEvent::Cleared {
            removed: removed.clone(),
        });
        Ok(removed)
    }

    /// Insert a feed's new episodes and auto-enqueue the latest one when the
    /// source is subscribed and has nothing queued.
    fn merge(
        &mut self,
        mut source: Source,
        episodes: Vec<Episode>,
    ) -> Result<MergeOutcome, QueueError> {
        let offered = episodes.len();
        let inserted_ids = self.store.insert_episodes(episodes.clone())?;

        // An unsubscribe may have landed while the feed was being fetched
        if let Some(stored) = self.store.source(&source.feed_url) {
            source.subscribed = stored.subscribed;
        }
        source.last_refreshed_at = Some(Utc::now());
        let subscribed = source.subscribed;
        let feed_url = source.feed_url.clone();
        self.store.upsert_source(source)?;

        let inserted: Vec<Episode> = episodes
            .into_iter()
            .filter(|e| inserted_ids.contains(&e.id))
            .collect();

        let source_has_queued = self.order.iter().any(|id| id.feed_url == feed_url);
        let mut auto_enqueued = None;
        if subscribed
            && !source_has_queued
            && let Some(latest) = latest_episode(&inserted).map(|e| e.id.clone())
            && self.enqueue(latest.clone())?.is_some()
        {
            auto_enqueued = Some(latest);
        }

        if !inserted_ids.is_empty() {
            tracing::info!(
                feed = %feed_url,
                inserted = inserted_ids.len(),
                auto_enqueued = auto_enqueued.is_some(),
                "Merged new episodes"
            );
            self.emit(QueueEvent::EpisodesMerged {
                feed_url,
                inserted: inserted_ids.clone(),
                auto_enqueued: auto_enqueued.clone(),
            });
        }

        Ok(MergeOutcome {
            skipped: offered - inserted_ids.len(),
            inserted: inserted_ids,
            auto_enqueued,
        })
    }
}

/// Most recently aired episode; undated episodes sort last and ties keep
/// feed order.
pub(super) fn latest_episode(episodes: &[Episode]) -> Option<&Episode> {
    episodes.iter().fold(None, |best: Option<&Episode>, candidate| match best {
        None => Some(candidate),
        Some(current) => match (current.air_date, candidate.air_date) {
            (None, Some(_)) => Some(candidate),
            (Some(a), Some(b)) if b > a => Some(candidate),
            _ => Some(current),
        },
    })
}
