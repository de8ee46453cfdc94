//! Persistence boundary.
//!
//! The engine only talks to [`Repository`]. Every mutating method is a
//! transaction: it is either fully committed or returns an error and leaves
//! the stored state untouched.

mod json;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{DownloadRecord, Episode, EpisodeId, Source};

pub use json::JsonStore;

/// Typed queries and mutations over sources, episodes and download records
pub trait Repository: Send + Sync {
    fn upsert_source(&self, source: Source) -> Result<(), StoreError>;

    fn source(&self, feed_url: &str) -> Option<Source>;

    fn sources(&self) -> Vec<Source>;

    fn episode(&self, id: &EpisodeId) -> Option<Episode>;

    fn contains_episode(&self, id: &EpisodeId) -> bool;

    fn episodes_for_source(&self, feed_url: &str) -> Vec<Episode>;

    /// Insert episodes whose identity is not stored yet.
    ///
    /// Existing identities are left untouched (first wins). Returns the ids
    /// that were actually inserted, in input order.
    fn insert_episodes(&self, episodes: Vec<Episode>) -> Result<Vec<EpisodeId>, StoreError>;

    fn queued_episodes_sorted_by_position(&self) -> Vec<Episode>;

    /// Replace the whole queue ordering.
    ///
    /// Episodes in `order` get `is_queued = true` and their index as position;
    /// every other episode is unqueued.
    fn write_queue(&self, order: &[EpisodeId]) -> Result<(), StoreError>;

    fn save_progress(&self, id: &EpisodeId, position_secs: f64) -> Result<(), StoreError>;

    /// Mark an episode played and stamp its download record for retention
    fn mark_played(
        &self,
        id: &EpisodeId,
        position_secs: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn download(&self, id: &EpisodeId) -> Option<DownloadRecord>;

    fn downloads(&self) -> Vec<DownloadRecord>;

    /// Insert or replace a download record, mirroring its state onto the episode
    fn upsert_download(&self, record: DownloadRecord) -> Result<(), StoreError>;

    fn delete_download(&self, id: &EpisodeId) -> Result<Option<DownloadRecord>, StoreError>;

    /// Download records whose episode has been played
    fn played_downloads(&self) -> Vec<DownloadRecord>;
}

/// A shared reference to a repository
pub type SharedRepository = Arc<dyn Repository>;
