// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Semaphore;

use crate::config::SyncConfig;
use crate::error::{FeedError, SyncError};
use crate::feed::{feed_location_url, is_url, load_feed_bytes, parse_feed};
use crate::http::HttpClient;
use crate::model::{EpisodeId, Source};
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::queue::QueueManager;
use crate::store::SharedRepository;

/// Result of refreshing one source
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub feed_url: String,
    pub podcast_title: String,
    /// Playable items found in the feed
    pub parsed: usize,
    /// Episodes that were new and got stored
    pub inserted: Vec<EpisodeId>,
    /// Items that were already known (or duplicated within the feed)
    pub skipped: usize,
    pub auto_enqueued: Option<EpisodeId>,
}

/// How one source of a batch ended
#[derive(Debug)]
pub enum SourceStatus {
    Synced(SyncOutcome),
    Failed(SyncError),
    /// Still running when the batch deadline passed
    TimedOut,
}

#[derive(Debug)]
pub struct SourceReport {
    pub feed_url: String,
    pub status: SourceStatus,
}

/// Per-source results of `refresh_all`, in input order
#[derive(Debug, Default)]
pub struct AggregateReport {
    pub sources: Vec<SourceReport>,
}

impl AggregateReport {
    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, SourceStatus::Synced(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, SourceStatus::Failed(_)))
    }

    pub fn timed_out(&self) -> usize {
        self.count(|s| matches!(s, SourceStatus::TimedOut))
    }

    /// Total episodes inserted across the batch
    pub fn inserted(&self) -> usize {
        self.sources
            .iter()
            .map(|r| match &r.status {
                SourceStatus::Synced(outcome) => outcome.inserted.len(),
                _ => 0,
            })
            .sum()
    }

    fn count(&self, pred: impl Fn(&SourceStatus) -> bool) -> usize {
        self.sources.iter().filter(|r| pred(&r.status)).count()
    }
}

/// Fetches feeds and merges their episodes through the queue writer
#[derive(Clone)]
pub struct FeedSyncEngine<C> {
    client: C,
    store: SharedRepository,
    queue: QueueManager,
    config: SyncConfig,
    reporter: SharedProgressReporter,
}

impl<C: HttpClient + Clone + 'static> FeedSyncEngine<C> {
    pub fn new(
        client: C,
        store: SharedRepository,
        queue: QueueManager,
        config: SyncConfig,
        reporter: SharedProgressReporter,
    ) -> Self {
        Self {
            client,
            store,
            queue,
            config,
            reporter,
        }
    }

    /// Subscribe to a feed and pull its episodes.
    ///
    /// The subscription is stored even if the first refresh fails, so the
    /// next refresh retries it.
    pub async fn subscribe(&self, feed_url: &str) -> Result<SyncOutcome, SyncError> {
        let source = match self.store.source(feed_url) {
            Some(mut existing) => {
                existing.subscribed = true;
                existing
            }
            None => Source::subscribed(feed_url),
        };
        self.store.upsert_source(source.clone())?;
        tracing::info!(feed = feed_url, "Subscribed");

        self.refresh_one(&source).await
    }

    /// Stop auto-enqueueing from a feed. Its episodes stay in the store.
    pub async fn unsubscribe(&self, feed_url: &str) -> Result<bool, SyncError> {
        let Some(mut source) = self.store.source(feed_url) else {
            return Ok(false);
        };
        source.subscribed = false;
        self.store.upsert_source(source)?;
        tracing::info!(feed = feed_url, "Unsubscribed");
        Ok(true)
    }

    /// Fetch, parse and merge one source
    pub async fn refresh_one(&self, source: &Source) -> Result<SyncOutcome, SyncError> {
        let result = self.fetch_and_merge(source).await;
        if let Err(e) = &result {
            tracing::warn!(feed = %source.feed_url, error = %e, "Feed refresh failed");
            self.reporter.report(ProgressEvent::FeedFailed {
                url: source.feed_url.clone(),
                error: e.to_string(),
            });
        }
        result
    }

    async fn fetch_and_merge(&self, source: &Source) -> Result<SyncOutcome, SyncError> {
        let feed_url = source.feed_url.as_str();

        if is_url(feed_url) {
            self.reporter.report(ProgressEvent::FetchingFeed {
                url: feed_url.to_string(),
            });
        }
        let bytes = load_feed_bytes(&self.client, feed_url, self.config.fetch_timeout).await?;

        self.reporter.report(ProgressEvent::ParsingFeed {
            url: feed_url.to_string(),
        });
        let podcast = parse_feed(&bytes, feed_location_url(feed_url)?)?;

        if podcast.items.is_empty() {
            return Err(FeedError::Empty {
                url: feed_url.to_string(),
            }
            .into());
        }

        let parsed = podcast.items.len();
        let mut seen = HashSet::new();
        let fresh: Vec<_> = podcast
            .items
            .into_iter()
            .map(|item| item.into_episode(feed_url))
            // First occurrence of an identity wins, later duplicates are dropped
            .filter(|episode| seen.insert(episode.id.clone()))
            .filter(|episode| !self.store.contains_episode(&episode.id))
            .collect();

        let mut updated = source.clone();
        updated.title = Some(podcast.title.clone());
        updated.image_url = podcast.image_url.map(String::from);

        let merge = self.queue.merge_episodes(updated, fresh).await?;

        let outcome = SyncOutcome {
            feed_url: feed_url.to_string(),
            podcast_title: podcast.title,
            parsed,
            skipped: parsed - merge.inserted.len(),
            inserted: merge.inserted,
            auto_enqueued: merge.auto_enqueued,
        };

        tracing::info!(
            feed = feed_url,
            parsed,
            inserted = outcome.inserted.len(),
            "Feed refreshed"
        );
        self.reporter.report(ProgressEvent::FeedMerged {
            url: outcome.feed_url.clone(),
            podcast_title: outcome.podcast_title.clone(),
            inserted: outcome.inserted.len(),
            skipped: outcome.skipped,
            auto_enqueued: outcome.auto_enqueued.clone(),
        });

        Ok(outcome)
    }

    /// Refresh every subscribed source in the store
    pub async fn refresh_subscribed(&self) -> AggregateReport {
        let sources = self
            .store
            .sources()
            .into_iter()
            .filter(|s| s.subscribed)
            .collect();
        self.refresh_all(sources).await
    }

    /// Refresh many sources with bounded parallelism.
    ///
    /// Resolves once every source has finished or `refresh_timeout` has
    /// passed; sources still running at that point are aborted and reported
    /// as `TimedOut`.
    pub async fn refresh_all(&self, sources: Vec<Source>) -> AggregateReport {
        let deadline = tokio::time::Instant::now() + self.config.refresh_timeout;
        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));

        let mut statuses: Vec<Option<SourceStatus>> = sources.iter().map(|_| None).collect();
        let mut abort_handles = Vec::with_capacity(sources.len());
        let mut pending = FuturesUnordered::new();

        for (index, source) in sources.iter().cloned().enumerate() {
            let engine = self.clone();
            let permits = permits.clone();

            let handle = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| SyncError::TaskFailed(e.to_string()))?;
                engine.refresh_one(&source).await
            });
            abort_handles.push(handle.abort_handle());
            pending.push(async move { (index, handle.await) });
        }

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((index, joined))) => {
                    statuses[index] = Some(match joined {
                        Ok(Ok(outcome)) => SourceStatus::Synced(outcome),
                        Ok(Err(e)) => SourceStatus::Failed(e),
                        Err(e) => SourceStatus::Failed(SyncError::TaskFailed(e.to_string())),
                    });
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        pending = pending.len(),
                        "Refresh deadline passed, abandoning remaining feeds"
                    );
                    for (index, status) in statuses.iter().enumerate() {
                        if status.is_none() {
                            abort_handles[index].abort();
                        }
                    }
                    break;
                }
            }
        }

        let report = AggregateReport {
            sources: sources
                .into_iter()
                .zip(statuses)
                .map(|(source, status)| SourceReport {
                    feed_url: source.feed_url,
                    status: status.unwrap_or(SourceStatus::TimedOut),
                })
                .collect(),
        };

        self.reporter.report(ProgressEvent::RefreshCompleted {
            succeeded: report.succeeded(),
            failed: report.failed(),
            timed_out: report.timed_out(),
        });

        report
    }
}
