//! Bounded download pool.
//!
//! Requests enter a FIFO admission queue consumed by `workers` tasks. Each
//! transfer streams into `<path>.partial` and is renamed into place once
//! complete. Start, finalize, cancel and delete for one episode are
//! serialized by a per-episode guard.

mod filename;
mod transfer;

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::http::HttpClient;
use crate::model::{DownloadRecord, DownloadState, EpisodeId};
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::retry::{IsRetryable, download_with_retry};
use crate::store::SharedRepository;

pub use filename::{audio_extension, local_filename};
pub use transfer::{TransferOutcome, progress_fraction, stream_to_partial};

/// Handle to a running transfer
struct ActiveTransfer {
    /// Distinguishes this transfer from later ones for the same episode
    transfer: u64,
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

#[derive(Default)]
struct PoolState {
    /// FIFO of admitted ids. Entries whose record is no longer `Queued` are
    /// skipped when popped.
    admission: VecDeque<EpisodeId>,
    records: HashMap<EpisodeId, DownloadRecord>,
    active: HashMap<EpisodeId, ActiveTransfer>,
    /// Ids whose last store write failed
    dirty: HashSet<EpisodeId>,
    next_transfer: u64,
}

struct Inner<C> {
    client: C,
    store: SharedRepository,
    config: DownloadConfig,
    reporter: SharedProgressReporter,
    state: Mutex<PoolState>,
    guards: Mutex<HashMap<EpisodeId, Arc<tokio::sync::Mutex<()>>>>,
    work: Notify,
    shutdown: CancellationToken,
}

/// Downloads episode audio with a fixed number of workers
#[derive(Clone)]
pub struct DownloadManager<C> {
    inner: Arc<Inner<C>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<C: HttpClient + 'static> DownloadManager<C> {
    /// Restore persisted records and start the worker pool.
    ///
    /// Records left `Queued` or `Downloading` by a previous run are admitted
    /// again, and stray `.partial` files in the download directory are
    /// removed.
    pub async fn start(
        client: C,
        store: SharedRepository,
        config: DownloadConfig,
        reporter: SharedProgressReporter,
    ) -> Result<Self, DownloadError> {
        tokio::fs::create_dir_all(&config.download_dir)
            .await
            .map_err(|e| DownloadError::FileCreateFailed {
                path: config.download_dir.clone(),
                source: e,
            })?;

        let cleaned = remove_partial_files(&config.download_dir).await;
        if cleaned > 0 {
            tracing::info!(count = cleaned, "Removed leftover partial files");
            reporter.report(ProgressEvent::PartialFilesCleanedUp { count: cleaned });
        }

        let mut state = PoolState::default();
        let mut readmitted = Vec::new();
        let mut restored = store.downloads();
        restored.sort_by_key(|r| r.updated_at);
        for mut record in restored {
            if matches!(record.state, DownloadState::Queued | DownloadState::Downloading) {
                record.state = DownloadState::Queued;
                record.progress = 0.0;
                record.bytes_downloaded = 0;
                state.admission.push_back(record.episode_id.clone());
                readmitted.push(record.episode_id.clone());
            }
            state.records.insert(record.episode_id.clone(), record);
        }

        let workers = config.workers.max(1);
        let inner = Arc::new(Inner {
            client,
            store,
            config,
            reporter,
            state: Mutex::new(state),
            guards: Mutex::new(HashMap::new()),
            work: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        for id in &readmitted {
            inner.persist(id);
        }
        if !readmitted.is_empty() {
            tracing::info!(count = readmitted.len(), "Resuming interrupted downloads");
        }

        let handles = (0..workers)
            .map(|slot| tokio::spawn(worker_loop(inner.clone(), slot)))
            .collect();

        Ok(Self {
            inner,
            workers: Arc::new(Mutex::new(handles)),
        })
    }

    /// Admit an episode for download.
    ///
    /// Returns `false` when it is already queued, downloading or downloaded.
    /// Failed and cancelled downloads start over.
    pub async fn request(&self, id: &EpisodeId) -> Result<bool, DownloadError> {
        let episode = self
            .inner
            .store
            .episode(id)
            .ok_or_else(|| DownloadError::UnknownEpisode(id.clone()))?;

        let guard = self.inner.guard(id);
        let mut held = guard.lock().await;

        // A cancelled transfer may still be winding down; wait until its
        // worker has finalized before admitting the episode again
        loop {
            let winding_down = {
                let state = self.inner.lock_state();
                if let Some(existing) = state.records.get(id)
                    && existing.state.is_active_or_done()
                {
                    return Ok(false);
                }
                state.active.get(id).map(|active| active.finished.clone())
            };
            let Some(mut finished) = winding_down else {
                break;
            };
            drop(held);
            let _ = finished.wait_for(|done| *done).await;
            held = guard.lock().await;
        }
        let _held = held;

        {
            let mut state = self.inner.lock_state();

            let path = self.inner.config.download_dir.join(local_filename(&episode));
            let mut record = DownloadRecord::queued(id.clone(), path);
            record.total_bytes = episode.enclosure_length;
            state.records.insert(id.clone(), record);
            state.admission.push_back(id.clone());
        }
        self.inner.persist(id);

        tracing::debug!(episode = %id, "Download queued");
        self.inner.reporter.report(ProgressEvent::DownloadQueued {
            episode_id: id.clone(),
        });
        self.inner.work.notify_one();
        Ok(true)
    }

    /// Stop a download at whatever stage it is in.
    ///
    /// Queued downloads are skipped by the workers, running transfers are
    /// aborted and their partial file deleted. Returns `false` (and does
    /// nothing) for completed, failed, cancelled or unknown downloads.
    pub async fn cancel(&self, id: &EpisodeId) -> bool {
        let guard = self.inner.guard(id);
        let held = guard.lock().await;

        let (partial, finished) = {
            let mut state = self.inner.lock_state();
            let Some(record) = state.records.get_mut(id) else {
                return false;
            };
            if !matches!(record.state, DownloadState::Queued | DownloadState::Downloading) {
                return false;
            }

            record.state = DownloadState::Cancelled;
            record.progress = 0.0;
            record.bytes_downloaded = 0;
            record.updated_at = Utc::now();
            let partial = record.partial_path();

            let finished = state.active.get(id).map(|active| {
                active.cancel.cancel();
                active.finished.clone()
            });
            (partial, finished)
        };
        self.inner.persist(id);

        match finished {
            // The worker deletes its partial file while finalizing
            Some(mut finished) => {
                drop(held);
                let _ = finished.wait_for(|done| *done).await;
            }
            None => {
                remove_if_exists(&partial).await;
                drop(held);
            }
        }

        tracing::info!(episode = %id, "Download cancelled");
        self.inner.reporter.report(ProgressEvent::DownloadCancelled {
            episode_id: id.clone(),
        });
        true
    }

    /// Delete a download: cancel it, remove its file and forget the record
    pub async fn remove(&self, id: &EpisodeId) -> bool {
        self.cancel(id).await;

        let guard = self.inner.guard(id);
        let _held = guard.lock().await;
        let removed = self.inner.delete_record(id).await;

        if removed {
            self.inner.reporter.report(ProgressEvent::DownloadRemoved {
                episode_id: id.clone(),
            });
        }
        removed
    }

    /// Record when an episode was played; retention counts from here
    pub async fn mark_played(&self, id: &EpisodeId, at: DateTime<Utc>) -> bool {
        let guard = self.inner.guard(id);
        let _held = guard.lock().await;

        {
            let mut state = self.inner.lock_state();
            let Some(record) = state.records.get_mut(id) else {
                return false;
            };
            record.played_at = Some(at);
            record.updated_at = Utc::now();
        }
        self.inner.persist(id);
        true
    }

    /// Delete completed downloads played at least `retention` before `now`.
    ///
    /// Unplayed and in-progress downloads are never touched. Returns how many
    /// were removed.
    pub async fn retention_sweep(&self, now: DateTime<Utc>) -> usize {
        let candidates: Vec<EpisodeId> = {
            let state = self.inner.lock_state();
            let mut ids: Vec<_> = state
                .records
                .values()
                .filter(|r| r.state == DownloadState::Completed)
                .map(|r| r.episode_id.clone())
                .collect();
            ids.sort();
            ids
        };

        // Plays recorded through the store rather than `mark_played`
        let played: HashMap<EpisodeId, DateTime<Utc>> = self
            .inner
            .store
            .played_downloads()
            .into_iter()
            .filter_map(|record| {
                let at = record.played_at.or_else(|| {
                    self.inner
                        .store
                        .episode(&record.episode_id)
                        .and_then(|e| e.played_at)
                })?;
                Some((record.episode_id, at))
            })
            .collect();

        let mut removed = 0;
        for id in candidates {
            let guard = self.inner.guard(&id);
            let _held = guard.lock().await;

            let expired = {
                let state = self.inner.lock_state();
                state.records.get(&id).is_some_and(|record| {
                    record.state == DownloadState::Completed
                        && record
                            .played_at
                            .or_else(|| played.get(&id).copied())
                            .and_then(|at| (now - at).to_std().ok())
                            .is_some_and(|age| age >= self.inner.config.retention)
                })
            };

            if expired && self.inner.delete_record(&id).await {
                tracing::debug!(episode = %id, "Retention removed download");
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Retention sweep finished");
        }
        self.inner
            .reporter
            .report(ProgressEvent::RetentionSwept { removed });
        removed
    }

    /// Current record for an episode, including live transfer progress
    pub fn record(&self, id: &EpisodeId) -> Option<DownloadRecord> {
        self.inner.lock_state().records.get(id).cloned()
    }

    pub fn records(&self) -> Vec<DownloadRecord> {
        let mut records: Vec<_> = self.inner.lock_state().records.values().cloned().collect();
        records.sort_by(|a, b| a.episode_id.cmp(&b.episode_id));
        records
    }

    /// Number of transfers currently running
    pub fn active_count(&self) -> usize {
        self.inner.lock_state().active.len()
    }

    /// Stop the workers.
    ///
    /// Running transfers are aborted, their partial files deleted and their
    /// records left `Queued` so the next start resumes them.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let handles: Vec<_> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Download worker panicked");
            }
        }

        self.inner.flush_dirty();
        tracing::debug!("Download pool stopped");
    }
}

impl<C: HttpClient + 'static> Inner<C> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn guard(&self, id: &EpisodeId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guards = match self.guards.lock() {
            Ok(guards) => guards,
            Err(poisoned) => poisoned.into_inner(),
        };
        guards.entry(id.clone()).or_default().clone()
    }

    /// Write the in-memory record for `id` (or its absence) to the store.
    ///
    /// Failures are logged and the id kept dirty; the next persist retries.
    fn persist(&self, id: &EpisodeId) {
        self.flush_dirty();
        if let Err(e) = self.write_record(id) {
            tracing::error!(episode = %id, error = %e, "Failed to persist download record");
            self.lock_state().dirty.insert(id.clone());
        }
    }

    fn flush_dirty(&self) {
        let dirty: Vec<EpisodeId> = self.lock_state().dirty.drain().collect();
        for id in dirty {
            if let Err(e) = self.write_record(&id) {
                tracing::warn!(episode = %id, error = %e, "Download record still not persisted");
                self.lock_state().dirty.insert(id);
            }
        }
    }

    fn write_record(&self, id: &EpisodeId) -> Result<(), crate::error::StoreError> {
        let record = self.lock_state().records.get(id).cloned();
        match record {
            Some(mut record) => {
                // Playback stamps played_at on the stored record directly
                if record.played_at.is_none() {
                    record.played_at = self.store.download(id).and_then(|r| r.played_at);
                }
                self.store.upsert_download(record)
            }
            None => self.store.delete_download(id).map(|_| ()),
        }
    }

    /// Remove the file and record for `id`. Caller holds the id's guard.
    async fn delete_record(&self, id: &EpisodeId) -> bool {
        let Some(record) = self.lock_state().records.remove(id) else {
            return false;
        };

        remove_if_exists(&record.local_path).await;
        remove_if_exists(&record.partial_path()).await;
        self.persist(id);
        true
    }

    /// Pop the next id that is still waiting to start
    fn next_admitted(&self) -> Option<EpisodeId> {
        let mut state = self.lock_state();
        while let Some(id) = state.admission.pop_front() {
            if state
                .records
                .get(&id)
                .is_some_and(|r| r.state == DownloadState::Queued)
            {
                return Some(id);
            }
        }
        None
    }

    fn report_progress(&self, id: &EpisodeId, bytes_downloaded: u64, total_bytes: Option<u64>) {
        let progress = progress_fraction(bytes_downloaded, total_bytes);
        {
            let mut state = self.lock_state();
            if let Some(record) = state.records.get_mut(id) {
                record.bytes_downloaded = bytes_downloaded;
                record.total_bytes = total_bytes.or(record.total_bytes);
                record.progress = progress;
            }
        }
        self.reporter.report(ProgressEvent::DownloadProgress {
            episode_id: id.clone(),
            bytes_downloaded,
            total_bytes,
            progress,
        });
    }

    async fn run_transfer(&self, slot: usize, id: EpisodeId) {
        let guard = self.guard(&id);

        let (episode, record, cancel, finished_tx, transfer) = {
            let _held = guard.lock().await;

            let still_queued = self
                .lock_state()
                .records
                .get(&id)
                .is_some_and(|r| r.state == DownloadState::Queued);
            if !still_queued {
                return;
            }
            let Some(episode) = self.store.episode(&id) else {
                self.fail(&id, &DownloadError::UnknownEpisode(id.clone()), false);
                return;
            };

            let (finished_tx, finished_rx) = watch::channel(false);
            let cancel = self.shutdown.child_token();
            let (record, transfer) = {
                let mut state = self.lock_state();
                state.next_transfer += 1;
                let transfer = state.next_transfer;
                let Some(record) = state.records.get_mut(&id) else {
                    return;
                };
                record.state = DownloadState::Downloading;
                record.attempts += 1;
                record.progress = 0.0;
                record.bytes_downloaded = 0;
                record.updated_at = Utc::now();
                let record = record.clone();

                state.active.insert(
                    id.clone(),
                    ActiveTransfer {
                        transfer,
                        cancel: cancel.clone(),
                        finished: finished_rx,
                    },
                );
                (record, transfer)
            };
            self.persist(&id);
            (episode, record, cancel, finished_tx, transfer)
        };

        tracing::info!(worker = slot, episode = %id, attempt = record.attempts, "Download starting");
        self.reporter.report(ProgressEvent::DownloadStarting {
            worker: slot,
            episode_id: id.clone(),
            episode_title: episode.title.clone(),
            content_length: record.total_bytes,
        });

        let partial = record.partial_path();
        let result = download_with_retry(
            &self.config.retry,
            &cancel,
            |attempt, e| {
                self.reporter.report(ProgressEvent::DownloadRetrying {
                    episode_id: id.clone(),
                    attempt,
                    error: e.to_string(),
                })
            },
            || {
                stream_to_partial(
                    &self.client,
                    &episode.audio_url,
                    &partial,
                    self.config.inactivity_timeout,
                    &cancel,
                    |bytes, total| self.report_progress(&id, bytes, total),
                )
            },
        )
        .await;

        let _held = guard.lock().await;
        self.finalize(&id, transfer, &record, result).await;
        {
            let mut state = self.lock_state();
            if state.active.get(&id).is_some_and(|a| a.transfer == transfer) {
                state.active.remove(&id);
            }
        }
        let _ = finished_tx.send(true);
    }

    /// Settle a finished transfer. Caller holds the id's guard.
    async fn finalize(
        &self,
        id: &EpisodeId,
        transfer: u64,
        started: &DownloadRecord,
        result: Result<TransferOutcome, DownloadError>,
    ) {
        let partial = started.partial_path();
        let still_ours = {
            let state = self.lock_state();
            state.active.get(id).is_some_and(|a| a.transfer == transfer)
                && state
                    .records
                    .get(id)
                    .is_some_and(|r| r.state == DownloadState::Downloading)
        };

        if !still_ours {
            // Cancelled or removed while the transfer ran
            remove_if_exists(&partial).await;
            return;
        }

        match result {
            Ok(outcome) => {
                if let Err(source) = tokio::fs::rename(&partial, &started.local_path).await {
                    remove_if_exists(&partial).await;
                    let e = DownloadError::FinalizeFailed {
                        from: partial,
                        source,
                    };
                    self.fail(id, &e, false);
                    return;
                }
                self.complete(id, outcome);
            }
            Err(DownloadError::Cancelled) if self.shutdown.is_cancelled() => {
                remove_if_exists(&partial).await;
                self.update(id, |record| {
                    record.state = DownloadState::Queued;
                    record.progress = 0.0;
                    record.bytes_downloaded = 0;
                });
                tracing::debug!(episode = %id, "Download interrupted by shutdown");
            }
            Err(e @ DownloadError::Stalled { .. }) => {
                remove_if_exists(&partial).await;
                if started.attempts <= self.config.retry.max_attempts {
                    tracing::warn!(episode = %id, attempt = started.attempts, error = %e, "Download stalled, re-queueing");
                    self.update(id, |record| {
                        record.state = DownloadState::Queued;
                        record.progress = 0.0;
                        record.bytes_downloaded = 0;
                        record.last_error = Some(e.to_string());
                    });
                    self.lock_state().admission.push_back(id.clone());
                    self.work.notify_one();
                } else {
                    self.fail(id, &e, true);
                }
            }
            Err(e) => {
                remove_if_exists(&partial).await;
                let retriable = e.is_retryable();
                self.fail(id, &e, retriable);
            }
        }
    }

    fn update(&self, id: &EpisodeId, apply: impl FnOnce(&mut DownloadRecord)) {
        {
            let mut state = self.lock_state();
            let Some(record) = state.records.get_mut(id) else {
                return;
            };
            apply(record);
            record.updated_at = Utc::now();
        }
        self.persist(id);
    }

    fn complete(&self, id: &EpisodeId, outcome: TransferOutcome) {
        self.update(id, |record| {
            record.state = DownloadState::Completed;
            record.progress = 1.0;
            record.bytes_downloaded = outcome.bytes_downloaded;
            record.total_bytes = outcome.total_bytes.or(Some(outcome.bytes_downloaded));
            record.content_hash = Some(outcome.content_hash.clone());
            record.retriable = false;
            record.last_error = None;
        });

        tracing::info!(episode = %id, bytes = outcome.bytes_downloaded, "Download completed");
        self.reporter.report(ProgressEvent::DownloadCompleted {
            episode_id: id.clone(),
            bytes_downloaded: outcome.bytes_downloaded,
            content_hash: outcome.content_hash,
        });
    }

    fn fail(&self, id: &EpisodeId, error: &DownloadError, retriable: bool) {
        self.update(id, |record| {
            record.state = DownloadState::Failed;
            record.progress = 0.0;
            record.bytes_downloaded = 0;
            record.retriable = retriable;
            record.last_error = Some(error.to_string());
        });

        tracing::error!(episode = %id, error = %error, retriable, "Download failed");
        self.reporter.report(ProgressEvent::DownloadFailed {
            episode_id: id.clone(),
            error: error.to_string(),
            retriable,
        });
    }
}

async fn worker_loop<C: HttpClient + 'static>(inner: Arc<Inner<C>>, slot: usize) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        match inner.next_admitted() {
            Some(id) => inner.run_transfer(slot, id).await,
            None => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.work.notified() => {}
                }
            }
        }
    }
    tracing::debug!(worker = slot, "Download worker stopped");
}

/// Delete a file, treating "already gone" as success
async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to delete file"),
    }
}

/// Remove every `*.partial` file directly inside `dir`
async fn remove_partial_files(dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Cannot scan download directory");
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "partial") {
            remove_if_exists(&path).await;
            removed += 1;
        }
    }
    removed
}
