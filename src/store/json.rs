use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{DownloadRecord, Episode, EpisodeId, Source};

use super::Repository;

const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default)]
struct StoreState {
    sources: BTreeMap<String, Source>,
    episodes: BTreeMap<EpisodeId, Episode>,
    downloads: BTreeMap<EpisodeId, DownloadRecord>,
}

/// On-disk layout. Maps with struct keys don't fit JSON objects, so records
/// are stored as lists.
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    sources: Vec<Source>,
    #[serde(default)]
    episodes: Vec<Episode>,
    #[serde(default)]
    downloads: Vec<DownloadRecord>,
}

impl From<&StoreState> for StoreFile {
    fn from(state: &StoreState) -> Self {
        Self {
            version: STORE_FORMAT_VERSION,
            sources: state.sources.values().cloned().collect(),
            episodes: state.episodes.values().cloned().collect(),
            downloads: state.downloads.values().cloned().collect(),
        }
    }
}

impl From<StoreFile> for StoreState {
    fn from(file: StoreFile) -> Self {
        Self {
            sources: file
                .sources
                .into_iter()
                .map(|s| (s.feed_url.clone(), s))
                .collect(),
            episodes: file
                .episodes
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect(),
            downloads: file
                .downloads
                .into_iter()
                .map(|d| (d.episode_id.clone(), d))
                .collect(),
        }
    }
}

/// Embedded store kept in memory and optionally mirrored to a JSON file.
///
/// With a backing file, each transaction runs against a copy of the state,
/// the copy is written to `<path>.tmp` and renamed over `<path>`, and only
/// then replaces the live state.
#[derive(Debug)]
pub struct JsonStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl JsonStore {
    /// A store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Open (or create) a store backed by `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::WriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let state = if path.exists() {
            read_store_file(path)?.into()
        } else {
            StoreState::default()
        };

        tracing::debug!(
            path = %path.display(),
            episodes = state.episodes.len(),
            "Opened store"
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` as one transaction
    fn commit<R>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut state = self.lock();

        let Some(path) = &self.path else {
            return f(&mut state);
        };

        let mut next = state.clone();
        let result = f(&mut next)?;
        if let Err(e) = write_store_file(path, &next) {
            tracing::error!(path = %path.display(), error = %e, "Failed to persist store");
            return Err(e);
        }
        *state = next;
        Ok(result)
    }
}

fn read_store_file(path: &Path) -> Result<StoreFile, StoreError> {
    let content = std::fs::read_to_string(path).map_err(|e| StoreError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| StoreError::JsonParseFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

fn write_store_file(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(&StoreFile::from(state))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, json).map_err(|e| StoreError::WriteFailed {
        path: tmp.clone(),
        source: e,
    })?;
    std::fs::rename(&tmp, path).map_err(|e| StoreError::WriteFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

impl Repository for JsonStore {
    fn upsert_source(&self, source: Source) -> Result<(), StoreError> {
        self.commit(|state| {
            state.sources.insert(source.feed_url.clone(), source);
            Ok(())
        })
    }

    fn source(&self, feed_url: &str) -> Option<Source> {
        self.lock().sources.get(feed_url).cloned()
    }

    fn sources(&self) -> Vec<Source> {
        self.lock().sources.values().cloned().collect()
    }

    fn episode(&self, id: &EpisodeId) -> Option<Episode> {
        self.lock().episodes.get(id).cloned()
    }

    fn contains_episode(&self, id: &EpisodeId) -> bool {
        self.lock().episodes.contains_key(id)
    }

    fn episodes_for_source(&self, feed_url: &str) -> Vec<Episode> {
        self.lock()
            .episodes
            .values()
            .filter(|e| e.id.feed_url == feed_url)
            .cloned()
            .collect()
    }

    fn insert_episodes(&self, episodes: Vec<Episode>) -> Result<Vec<EpisodeId>, StoreError> {
        self.commit(|state| {
            let mut inserted = Vec::new();
            for mut episode in episodes {
                if state.episodes.contains_key(&episode.id) {
                    continue;
                }
                episode.is_queued = false;
                episode.queue_position = None;
                inserted.push(episode.id.clone());
                state.episodes.insert(episode.id.clone(), episode);
            }
            Ok(inserted)
        })
    }

    fn queued_episodes_sorted_by_position(&self) -> Vec<Episode> {
        let mut queued: Vec<Episode> = self
            .lock()
            .episodes
            .values()
            .filter(|e| e.is_queued)
            .cloned()
            .collect();
        queued.sort_by_key(|e| e.queue_position.unwrap_or(usize::MAX));
        queued
    }

    fn write_queue(&self, order: &[EpisodeId]) -> Result<(), StoreError> {
        self.commit(|state| {
            if let Some(missing) = order.iter().find(|id| !state.episodes.contains_key(*id)) {
                return Err(StoreError::UnknownEpisode(missing.clone()));
            }

            let positions: BTreeMap<&EpisodeId, usize> =
                order.iter().enumerate().map(|(i, id)| (id, i)).collect();

            for episode in state.episodes.values_mut() {
                match positions.get(&episode.id) {
                    Some(&position) => {
                        episode.is_queued = true;
                        episode.queue_position = Some(position);
                    }
                    None => {
                        episode.is_queued = false;
                        episode.queue_position = None;
                    }
                }
            }
            Ok(())
        })
    }

    fn save_progress(&self, id: &EpisodeId, position_secs: f64) -> Result<(), StoreError> {
        self.commit(|state| {
            if let Some(episode) = state.episodes.get_mut(id) {
                episode.play_progress_secs = position_secs.max(0.0);
            }
            Ok(())
        })
    }

    fn mark_played(
        &self,
        id: &EpisodeId,
        position_secs: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.commit(|state| {
            if let Some(episode) = state.episodes.get_mut(id) {
                episode.played = true;
                episode.played_at = Some(at);
                episode.play_progress_secs = position_secs.max(0.0);
            }
            if let Some(record) = state.downloads.get_mut(id) {
                record.played_at = Some(at);
            }
            Ok(())
        })
    }

    fn download(&self, id: &EpisodeId) -> Option<DownloadRecord> {
        self.lock().downloads.get(id).cloned()
    }

    fn downloads(&self) -> Vec<DownloadRecord> {
        self.lock().downloads.values().cloned().collect()
    }

    fn upsert_download(&self, record: DownloadRecord) -> Result<(), StoreError> {
        self.commit(|state| {
            if let Some(episode) = state.episodes.get_mut(&record.episode_id) {
                episode.download_state = Some(record.state);
            }
            state.downloads.insert(record.episode_id.clone(), record);
            Ok(())
        })
    }

    fn delete_download(&self, id: &EpisodeId) -> Result<Option<DownloadRecord>, StoreError> {
        self.commit(|state| {
            if let Some(episode) = state.episodes.get_mut(id) {
                episode.download_state = None;
            }
            Ok(state.downloads.remove(id))
        })
    }

    fn played_downloads(&self) -> Vec<DownloadRecord> {
        let state = self.lock();
        let played: HashSet<&EpisodeId> = state
            .episodes
            .values()
            .filter(|e| e.played)
            .map(|e| &e.id)
            .collect();

        state
            .downloads
            .values()
            .filter(|d| d.played_at.is_some() || played.contains(&d.episode_id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DownloadState;
    use tempfile::tempdir;

    const FEED: &str = "https://example.com/feed.xml";

    fn episode(key: &str) -> Episode {
        Episode::new(
            EpisodeId::new(FEED, key),
            format!("Episode {key}"),
            format!("https://example.com/{key}.mp3"),
        )
    }

    #[test]
    fn insert_is_idempotent_and_first_wins() {
        let store = JsonStore::in_memory();

        let first = store.insert_episodes(vec![episode("a"), episode("b")]).unwrap();
        assert_eq!(first.len(), 2);

        let mut renamed = episode("a");
        renamed.title = "Different".to_string();
        let second = store.insert_episodes(vec![renamed, episode("c")]).unwrap();

        assert_eq!(second, vec![EpisodeId::new(FEED, "c")]);
        assert_eq!(
            store.episode(&EpisodeId::new(FEED, "a")).unwrap().title,
            "Episode a"
        );
    }

    #[test]
    fn insert_never_queues() {
        let store = JsonStore::in_memory();
        let mut ep = episode("a");
        ep.is_queued = true;
        ep.queue_position = Some(7);
        store.insert_episodes(vec![ep]).unwrap();

        assert!(store.queued_episodes_sorted_by_position().is_empty());
    }

    #[test]
    fn write_queue_sets_dense_positions() {
        let store = JsonStore::in_memory();
        store
            .insert_episodes(vec![episode("a"), episode("b"), episode("c")])
            .unwrap();

        let order = vec![EpisodeId::new(FEED, "c"), EpisodeId::new(FEED, "a")];
        store.write_queue(&order).unwrap();

        let queued = store.queued_episodes_sorted_by_position();
        let ids: Vec<_> = queued.iter().map(|e| e.id.key.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(queued[0].queue_position, Some(0));
        assert_eq!(queued[1].queue_position, Some(1));
        assert!(!store.episode(&EpisodeId::new(FEED, "b")).unwrap().is_queued);
    }

    #[test]
    fn write_queue_rejects_unknown_ids_without_changes() {
        let store = JsonStore::in_memory();
        store.insert_episodes(vec![episode("a")]).unwrap();
        store.write_queue(&[EpisodeId::new(FEED, "a")]).unwrap();

        let result = store.write_queue(&[EpisodeId::new(FEED, "zzz")]);
        assert!(matches!(result, Err(StoreError::UnknownEpisode(_))));
        assert_eq!(store.queued_episodes_sorted_by_position().len(), 1);
    }

    #[test]
    fn mark_played_stamps_download_record() {
        let store = JsonStore::in_memory();
        store.insert_episodes(vec![episode("a")]).unwrap();
        let id = EpisodeId::new(FEED, "a");

        let mut record = DownloadRecord::queued(id.clone(), PathBuf::from("/tmp/a.mp3"));
        record.state = DownloadState::Completed;
        store.upsert_download(record).unwrap();
        assert_eq!(
            store.episode(&id).unwrap().download_state,
            Some(DownloadState::Completed)
        );

        let at = Utc::now();
        store.mark_played(&id, 1200.0, at).unwrap();

        let ep = store.episode(&id).unwrap();
        assert!(ep.played);
        assert_eq!(ep.play_progress_secs, 1200.0);
        assert_eq!(store.download(&id).unwrap().played_at, Some(at));
        assert_eq!(store.played_downloads().len(), 1);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");

        {
            let store = JsonStore::open(&path).unwrap();
            store.upsert_source(Source::subscribed(FEED)).unwrap();
            store.insert_episodes(vec![episode("a"), episode("b")]).unwrap();
            store.write_queue(&[EpisodeId::new(FEED, "b")]).unwrap();
            store.save_progress(&EpisodeId::new(FEED, "b"), 42.5).unwrap();
        }

        let store = JsonStore::open(&path).unwrap();
        assert!(store.source(FEED).unwrap().subscribed);
        assert_eq!(store.episodes_for_source(FEED).len(), 2);
        let queued = store.queued_episodes_sorted_by_position();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].play_progress_secs, 42.5);
    }

    #[test]
    fn failed_write_leaves_state_unchanged_and_later_write_commits() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let path = data_dir.join("library.json");

        let store = JsonStore::open(&path).unwrap();
        store.insert_episodes(vec![episode("a")]).unwrap();

        std::fs::remove_dir_all(&data_dir).unwrap();
        let result = store.insert_episodes(vec![episode("b")]);
        assert!(matches!(result, Err(StoreError::WriteFailed { .. })));
        assert!(!store.contains_episode(&EpisodeId::new(FEED, "b")));

        std::fs::create_dir_all(&data_dir).unwrap();
        store.insert_episodes(vec![episode("b")]).unwrap();

        let reloaded = JsonStore::open(&path).unwrap();
        assert!(reloaded.contains_episode(&EpisodeId::new(FEED, "a")));
        assert!(reloaded.contains_episode(&EpisodeId::new(FEED, "b")));
    }

    #[test]
    fn open_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            JsonStore::open(&path),
            Err(StoreError::JsonParseFailed { .. })
        ));
    }
}
