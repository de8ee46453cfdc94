//! Playback coordination.
//!
//! A single task owns the current audio session and reacts to user
//! commands, session events, queue changes and a progress timer. At most one
//! session is alive at any time.

mod backend;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::config::PlaybackConfig;
use crate::error::PlaybackError;
use crate::model::{DownloadState, Episode, EpisodeId};
use crate::queue::{QueueEvent, QueueManager};
use crate::store::SharedRepository;

pub use backend::{AudioBackend, AudioSession, MediaSource, SessionEvent, SessionEventSender};

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    /// The episode just ended; about to load the next one or go idle
    Completed,
}

/// What the player is doing right now
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub episode: Option<EpisodeId>,
    pub position_secs: f64,
    pub duration_secs: Option<f64>,
    /// Set when playback stopped because of a failure
    pub error: Option<PlaybackError>,
}

impl PlaybackStatus {
    pub fn remaining_secs(&self) -> Option<f64> {
        self.duration_secs
            .map(|duration| (duration - self.position_secs).max(0.0))
    }

    /// Remaining time as shown next to the scrubber, e.g. "-12:05"
    pub fn remaining_display(&self) -> Option<String> {
        self.remaining_secs().map(format_remaining)
    }
}

/// Format seconds left as `-H:MM:SS`, or `-M:SS` under an hour
pub fn format_remaining(secs: f64) -> String {
    let total = if secs.is_finite() { secs.max(0.0) as u64 } else { 0 };
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);

    if hours > 0 {
        format!("-{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("-{minutes}:{seconds:02}")
    }
}

fn clamp_position(position: f64, duration: Option<f64>) -> f64 {
    let position = if position.is_nan() { 0.0 } else { position.max(0.0) };
    match duration {
        Some(duration) => position.min(duration.max(0.0)),
        None => position,
    }
}

type Reply = oneshot::Sender<Result<(), PlaybackError>>;

enum PlaybackCommand {
    Play { id: EpisodeId, reply: Reply },
    Pause { reply: Reply },
    Resume { reply: Reply },
    Seek { position_secs: f64, reply: Reply },
    Skip { delta_secs: f64, reply: Reply },
    Stop { reply: Reply },
    Shutdown { reply: Reply },
}

/// Handle to the playback task
#[derive(Clone)]
pub struct PlaybackCoordinator {
    command_tx: mpsc::Sender<PlaybackCommand>,
    status_rx: watch::Receiver<PlaybackStatus>,
    config: PlaybackConfig,
}

impl PlaybackCoordinator {
    /// Spawn the playback task
    pub fn start(
        backend: Arc<dyn AudioBackend>,
        store: SharedRepository,
        queue: QueueManager,
        config: PlaybackConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(PlaybackStatus::default());
        let queue_events = queue.subscribe();

        let actor = PlaybackActor {
            backend,
            store,
            queue,
            config: config.clone(),
            session_tx,
            status_tx,
            status: PlaybackStatus::default(),
            session: None,
            generation: 0,
            current_queued: false,
            last_saved: None,
            unsaved: None,
        };
        tokio::spawn(actor.run(command_rx, session_rx, queue_events));

        Self {
            command_tx,
            status_rx,
            config,
        }
    }

    async fn request(
        &self,
        make: impl FnOnce(Reply) -> PlaybackCommand,
    ) -> Result<(), PlaybackError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| PlaybackError::Shutdown)?;
        reply_rx.await.map_err(|_| PlaybackError::Shutdown)?
    }

    /// Start playing an episode from its saved position.
    ///
    /// Any other episode is released first. Playing the current episode
    /// resumes it.
    pub async fn play(&self, id: EpisodeId) -> Result<(), PlaybackError> {
        self.request(|reply| PlaybackCommand::Play { id, reply })
            .await
    }

    /// Pause if playing; otherwise nothing happens
    pub async fn pause(&self) -> Result<(), PlaybackError> {
        self.request(|reply| PlaybackCommand::Pause { reply }).await
    }

    /// Continue if paused. After a failure this reloads the episode.
    pub async fn resume(&self) -> Result<(), PlaybackError> {
        self.request(|reply| PlaybackCommand::Resume { reply }).await
    }

    /// Jump to a position, clamped to the episode length
    pub async fn seek(&self, position_secs: f64) -> Result<(), PlaybackError> {
        self.request(|reply| PlaybackCommand::Seek {
            position_secs,
            reply,
        })
        .await
    }

    /// Skip ahead by `secs`, or the configured step when `None`
    pub async fn skip_forward(&self, secs: Option<f64>) -> Result<(), PlaybackError> {
        let delta_secs = secs.unwrap_or(self.config.skip_forward_secs);
        self.request(|reply| PlaybackCommand::Skip { delta_secs, reply })
            .await
    }

    /// Skip back by `secs`, or the configured step when `None`
    pub async fn skip_backward(&self, secs: Option<f64>) -> Result<(), PlaybackError> {
        let delta_secs = -secs.unwrap_or(self.config.skip_backward_secs);
        self.request(|reply| PlaybackCommand::Skip { delta_secs, reply })
            .await
    }

    /// Save the position, release the session and go idle
    pub async fn stop(&self) -> Result<(), PlaybackError> {
        self.request(|reply| PlaybackCommand::Stop { reply }).await
    }

    /// Stop playback and end the task
    pub async fn shutdown(&self) -> Result<(), PlaybackError> {
        self.request(|reply| PlaybackCommand::Shutdown { reply })
            .await
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver that sees every status change
    pub fn watch(&self) -> watch::Receiver<PlaybackStatus> {
        self.status_rx.clone()
    }
}

struct PlaybackActor {
    backend: Arc<dyn AudioBackend>,
    store: SharedRepository,
    queue: QueueManager,
    config: PlaybackConfig,
    session_tx: mpsc::UnboundedSender<(u64, SessionEvent)>,
    status_tx: watch::Sender<PlaybackStatus>,
    status: PlaybackStatus,
    session: Option<Box<dyn AudioSession>>,
    /// Bumped for every opened session; older events are ignored
    generation: u64,
    /// Whether the current episode is in the queue
    current_queued: bool,
    last_saved: Option<(EpisodeId, f64)>,
    /// A progress write that failed and is retried on the next tick
    unsaved: Option<(EpisodeId, f64)>,
}

impl PlaybackActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<PlaybackCommand>,
        mut session_events: mpsc::UnboundedReceiver<(u64, SessionEvent)>,
        mut queue_events: broadcast::Receiver<QueueEvent>,
    ) {
        let mut ticker = tokio::time::interval(self.config.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut queue_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PlaybackCommand::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some((generation, event)) = session_events.recv() => {
                    if generation == self.generation && self.session.is_some() {
                        self.on_session_event(event).await;
                    }
                }
                event = queue_events.recv(), if queue_open => match event {
                    Ok(event) => self.on_queue_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Playback missed queue events, resyncing");
                        self.resync_with_queue().await;
                    }
                    Err(RecvError::Closed) => queue_open = false,
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }
        tracing::debug!("Playback coordinator stopped");
    }

    async fn handle(&mut self, command: PlaybackCommand) {
        match command {
            PlaybackCommand::Play { id, reply } => {
                let _ = reply.send(self.play(id).await);
            }
            PlaybackCommand::Pause { reply } => {
                let _ = reply.send(self.pause());
            }
            PlaybackCommand::Resume { reply } => {
                let _ = reply.send(self.resume().await);
            }
            PlaybackCommand::Seek {
                position_secs,
                reply,
            } => {
                let _ = reply.send(self.seek(position_secs));
            }
            PlaybackCommand::Skip { delta_secs, reply } => {
                let _ = reply.send(self.seek(self.current_position() + delta_secs));
            }
            PlaybackCommand::Stop { reply } => {
                self.stop();
                let _ = reply.send(Ok(()));
            }
            PlaybackCommand::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status.clone());
    }

    fn current_position(&self) -> f64 {
        self.session
            .as_ref()
            .map(|session| session.position())
            .unwrap_or(self.status.position_secs)
    }

    /// Prefer a finished download over streaming
    fn media_source(&self, episode: &Episode) -> MediaSource {
        if let Some(record) = self.store.download(&episode.id)
            && record.state == DownloadState::Completed
            && record.local_path.exists()
        {
            return MediaSource::File(record.local_path);
        }
        MediaSource::Url(episode.audio_url.clone())
    }

    async fn play(&mut self, id: EpisodeId) -> Result<(), PlaybackError> {
        let episode = self
            .store
            .episode(&id)
            .ok_or_else(|| PlaybackError::UnknownEpisode(id.clone()))?;

        if self.status.episode.as_ref() == Some(&id) && self.session.is_some() {
            return match self.status.state {
                PlaybackState::Paused => self.resume_session(),
                _ => Ok(()),
            };
        }

        self.release(true);
        self.generation += 1;

        let start = if episode.played {
            0.0
        } else {
            episode.play_progress_secs
        };
        self.current_queued = self.queue.position_of(&id).is_some();
        self.status = PlaybackStatus {
            state: PlaybackState::Loading,
            episode: Some(id.clone()),
            position_secs: start,
            duration_secs: episode.duration_secs,
            error: None,
        };
        self.publish();

        let source = self.media_source(&episode);
        tracing::info!(episode = %id, source = %source, "Loading episode");

        let events = SessionEventSender::new(self.generation, self.session_tx.clone());
        let mut session = match self.backend.open(source, events).await {
            Ok(session) => session,
            Err(e) => {
                return Err(self.fail(PlaybackError::OpenFailed {
                    episode: id,
                    reason: e.to_string(),
                }));
            }
        };

        let duration = session.duration().or(episode.duration_secs);
        let start = clamp_position(start, duration);
        let started = if start > 0.0 {
            session.seek(start)
        } else {
            Ok(())
        }
        .and_then(|()| session.play());

        if let Err(e) = started {
            session.stop();
            return Err(self.fail(e));
        }

        self.session = Some(session);
        self.status.state = PlaybackState::Playing;
        self.status.position_secs = start;
        self.status.duration_secs = duration;
        self.publish();
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlaybackError> {
        if self.status.state != PlaybackState::Playing {
            return Ok(());
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if let Err(e) = session.pause() {
            return Err(self.fail(e));
        }
        let position = session.position();

        self.status.state = PlaybackState::Paused;
        self.status.position_secs = position;
        self.publish();
        self.save_current_progress(position);
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), PlaybackError> {
        if self.status.state != PlaybackState::Paused {
            return Ok(());
        }

        if self.session.is_some() {
            return self.resume_session();
        }

        // Failed earlier and the session is gone; load it again
        match self.status.episode.clone() {
            Some(id) => self.play(id).await,
            None => Ok(()),
        }
    }

    fn resume_session(&mut self) -> Result<(), PlaybackError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if let Err(e) = session.play() {
            return Err(self.fail(e));
        }

        self.status.state = PlaybackState::Playing;
        self.status.error = None;
        self.publish();
        Ok(())
    }

    fn seek(&mut self, position_secs: f64) -> Result<(), PlaybackError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        let duration = session.duration().or(self.status.duration_secs);
        let target = clamp_position(position_secs, duration);
        if let Err(e) = session.seek(target) {
            return Err(self.fail(e));
        }

        self.status.position_secs = target;
        self.status.duration_secs = duration;
        self.publish();
        Ok(())
    }

    fn stop(&mut self) {
        self.release(true);
        self.status = PlaybackStatus::default();
        self.current_queued = false;
        self.publish();
    }

    /// Drop the current session, optionally saving where it was
    fn release(&mut self, save: bool) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if save {
            let position = session.position();
            self.status.position_secs = position;
            self.save_current_progress(position);
        }
        session.stop();
    }

    /// Release the session and park in `Paused` with the error
    fn fail(&mut self, error: PlaybackError) -> PlaybackError {
        tracing::warn!(episode = ?self.status.episode, error = %error, "Playback failed");
        self.release(true);
        self.status.state = PlaybackState::Paused;
        self.status.error = Some(error.clone());
        self.publish();
        error
    }

    fn save_current_progress(&mut self, position: f64) {
        let Some(id) = self.status.episode.clone() else {
            return;
        };
        if self.last_saved.as_ref() == Some(&(id.clone(), position)) {
            return;
        }

        match self.store.save_progress(&id, position) {
            Ok(()) => {
                self.last_saved = Some((id, position));
                self.unsaved = None;
            }
            Err(e) => {
                tracing::warn!(episode = %id, error = %e, "Failed to save play position");
                self.unsaved = Some((id, position));
            }
        }
    }

    fn on_tick(&mut self) {
        if let Some((id, position)) = self.unsaved.take() {
            match self.store.save_progress(&id, position) {
                Ok(()) => self.last_saved = Some((id, position)),
                Err(_) => self.unsaved = Some((id, position)),
            }
        }

        if self.status.state != PlaybackState::Playing {
            return;
        }
        let Some(position) = self.session.as_ref().map(|session| session.position()) else {
            return;
        };

        self.status.position_secs = position;
        self.publish();
        self.save_current_progress(position);
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Ended => self.finish_current().await,
            SessionEvent::Failed(reason) => {
                self.fail(PlaybackError::SessionFailed(reason));
            }
        }
    }

    /// Natural end of media: mark played, archive, then move on
    async fn finish_current(&mut self) {
        let Some(id) = self.status.episode.clone() else {
            return;
        };

        let position = self
            .session
            .as_ref()
            .and_then(|session| session.duration())
            .or(self.status.duration_secs)
            .unwrap_or_else(|| self.current_position());
        self.release(false);

        if let Err(e) = self.store.mark_played(&id, position, Utc::now()) {
            tracing::error!(episode = %id, error = %e, "Failed to mark episode played");
        }
        self.last_saved = Some((id.clone(), position));

        self.status.state = PlaybackState::Completed;
        self.status.position_secs = position;
        self.publish();
        tracing::info!(episode = %id, "Episode finished");

        let next = match self.queue.archive(id.clone()).await {
            Ok(Some(outcome)) => outcome.next,
            Ok(None) => self.queue.head(),
            Err(e) => {
                tracing::error!(episode = %id, error = %e, "Failed to archive finished episode");
                self.queue.head().filter(|head| head != &id)
            }
        };

        let next = next.filter(|_| self.config.autoplay_next);
        self.advance(next).await;
    }

    async fn advance(&mut self, next: Option<EpisodeId>) {
        match next {
            Some(next) => {
                if let Err(e) = self.play(next.clone()).await {
                    tracing::warn!(episode = %next, error = %e, "Could not start next episode");
                }
            }
            None => self.stop(),
        }
    }

    async fn on_queue_event(&mut self, event: QueueEvent) {
        let Some(current) = self.status.episode.clone() else {
            return;
        };

        match event {
            QueueEvent::Archived { id, next, .. } if id == current => {
                self.current_archived(next).await;
            }
            QueueEvent::Cleared { removed } if removed.contains(&current) => {
                self.current_archived(None).await;
            }
            QueueEvent::Enqueued { id, .. } if id == current => {
                self.current_queued = true;
            }
            _ => {}
        }
    }

    /// Someone else archived the episode being played
    async fn current_archived(&mut self, next: Option<EpisodeId>) {
        tracing::info!(episode = ?self.status.episode, next = ?next, "Current episode archived");
        self.release(true);
        self.current_queued = false;
        self.advance(next).await;
    }

    async fn resync_with_queue(&mut self) {
        let Some(current) = self.status.episode.clone() else {
            return;
        };

        let still_queued = self.queue.position_of(&current).is_some();
        if self.current_queued && !still_queued {
            self.current_archived(self.queue.head()).await;
        } else {
            self.current_queued = still_queued;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::{DownloadRecord, Episode};
    use crate::store::{JsonStore, Repository};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    const FEED: &str = "https://example.com/feed.xml";
    const LENGTH: f64 = 600.0;

    /// Test-side view of one opened session
    #[derive(Clone)]
    struct SessionProbe {
        source: MediaSource,
        position: Arc<Mutex<f64>>,
        playing: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
        events: SessionEventSender,
    }

    impl SessionProbe {
        fn set_position(&self, secs: f64) {
            *self.position.lock().unwrap() = secs;
        }

        fn position(&self) -> f64 {
            *self.position.lock().unwrap()
        }
    }

    struct MockSession {
        probe: SessionProbe,
        live: Arc<AtomicUsize>,
    }

    impl AudioSession for MockSession {
        fn play(&mut self) -> Result<(), PlaybackError> {
            self.probe.playing.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn pause(&mut self) -> Result<(), PlaybackError> {
            self.probe.playing.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn seek(&mut self, position_secs: f64) -> Result<(), PlaybackError> {
            self.probe.set_position(position_secs);
            Ok(())
        }

        fn position(&self) -> f64 {
            self.probe.position()
        }

        fn duration(&self) -> Option<f64> {
            Some(LENGTH)
        }

        fn stop(&mut self) {
            self.probe.playing.store(false, Ordering::SeqCst);
            self.probe.stopped.store(true, Ordering::SeqCst);
        }
    }

    impl Drop for MockSession {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockBackend {
        sessions: Mutex<Vec<SessionProbe>>,
        live: Arc<AtomicUsize>,
        max_live: AtomicUsize,
        failing_opens: AtomicUsize,
    }

    impl MockBackend {
        fn last(&self) -> SessionProbe {
            self.sessions.lock().unwrap().last().cloned().unwrap()
        }

        fn opened(&self) -> usize {
            self.sessions.lock().unwrap().len()
        }

        fn fail_next_opens(&self, count: usize) {
            self.failing_opens.store(count, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AudioBackend for MockBackend {
        async fn open(
            &self,
            source: MediaSource,
            events: SessionEventSender,
        ) -> Result<Box<dyn AudioSession>, PlaybackError> {
            if self
                .failing_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PlaybackError::SessionFailed("device busy".to_string()));
            }

            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);

            let probe = SessionProbe {
                source,
                position: Arc::new(Mutex::new(0.0)),
                playing: Arc::new(AtomicBool::new(false)),
                stopped: Arc::new(AtomicBool::new(false)),
                events,
            };
            self.sessions.lock().unwrap().push(probe.clone());

            Ok(Box::new(MockSession {
                probe,
                live: self.live.clone(),
            }))
        }
    }

    struct Harness {
        store: Arc<JsonStore>,
        queue: QueueManager,
        backend: Arc<MockBackend>,
        player: PlaybackCoordinator,
    }

    fn harness(config: PlaybackConfig) -> Harness {
        let store = Arc::new(JsonStore::in_memory());
        let queue = QueueManager::start(store.clone());
        let backend = Arc::new(MockBackend::default());
        let player = PlaybackCoordinator::start(backend.clone(), store.clone(), queue.clone(), config);
        Harness {
            store,
            queue,
            backend,
            player,
        }
    }

    fn add_episode(store: &JsonStore, key: &str) -> EpisodeId {
        let id = EpisodeId::new(FEED, key);
        let mut episode = Episode::new(id.clone(), key, format!("https://cdn.example.com/{key}.mp3"));
        episode.duration_secs = Some(LENGTH);
        store.insert_episodes(vec![episode]).unwrap();
        id
    }

    async fn queued(h: &Harness, keys: &[&str]) -> Vec<EpisodeId> {
        let mut ids = Vec::new();
        for key in keys {
            let id = add_episode(&h.store, key);
            h.queue.enqueue(id.clone()).await.unwrap();
            ids.push(id);
        }
        ids
    }

    async fn wait_status(
        player: &PlaybackCoordinator,
        condition: impl FnMut(&PlaybackStatus) -> bool,
    ) -> PlaybackStatus {
        let mut rx = player.watch();
        let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(condition))
            .await
            .expect("status not reached in time")
            .expect("coordinator stopped")
            .clone();
        status
    }

    #[test]
    fn remaining_time_formats() {
        assert_eq!(format_remaining(0.0), "-0:00");
        assert_eq!(format_remaining(65.4), "-1:05");
        assert_eq!(format_remaining(3599.0), "-59:59");
        assert_eq!(format_remaining(3600.0), "-1:00:00");
        assert_eq!(format_remaining(2.0 * 3600.0 + 5.0 * 60.0 + 9.0), "-2:05:09");
        assert_eq!(format_remaining(-5.0), "-0:00");
    }

    #[test]
    fn status_reports_remaining_time() {
        let status = PlaybackStatus {
            state: PlaybackState::Playing,
            episode: None,
            position_secs: 60.0,
            duration_secs: Some(3725.0),
            error: None,
        };
        assert_eq!(status.remaining_secs(), Some(3665.0));
        assert_eq!(status.remaining_display().as_deref(), Some("-1:01:05"));
        assert_eq!(PlaybackStatus::default().remaining_display(), None);
    }

    #[test]
    fn positions_clamp_to_media_bounds() {
        assert_eq!(clamp_position(-3.0, Some(10.0)), 0.0);
        assert_eq!(clamp_position(30.0, Some(10.0)), 10.0);
        assert_eq!(clamp_position(f64::NAN, Some(10.0)), 0.0);
        assert_eq!(clamp_position(30.0, None), 30.0);
    }

    #[tokio::test]
    async fn play_resumes_from_saved_progress() {
        let h = harness(PlaybackConfig::default());
        let id = add_episode(&h.store, "a");
        h.store.save_progress(&id, 42.0).unwrap();

        h.player.play(id.clone()).await.unwrap();

        let status = h.player.status();
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(status.episode, Some(id));
        assert_eq!(status.position_secs, 42.0);
        assert_eq!(status.duration_secs, Some(LENGTH));
        assert_eq!(h.backend.last().position(), 42.0);
        assert!(h.backend.last().playing.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn play_of_unknown_episode_fails() {
        let h = harness(PlaybackConfig::default());
        let result = h.player.play(EpisodeId::new(FEED, "missing")).await;
        assert!(matches!(result, Err(PlaybackError::UnknownEpisode(_))));
        assert_eq!(h.player.status().state, PlaybackState::Idle);
    }

    #[tokio::test]
    async fn pause_and_resume_only_act_in_matching_states() {
        let h = harness(PlaybackConfig::default());
        let id = add_episode(&h.store, "a");

        h.player.pause().await.unwrap();
        h.player.resume().await.unwrap();
        assert_eq!(h.player.status().state, PlaybackState::Idle);
        assert_eq!(h.backend.opened(), 0);

        h.player.play(id).await.unwrap();
        h.player.resume().await.unwrap();
        assert_eq!(h.player.status().state, PlaybackState::Playing);

        h.player.pause().await.unwrap();
        h.player.pause().await.unwrap();
        assert_eq!(h.player.status().state, PlaybackState::Paused);
        assert!(!h.backend.last().playing.load(Ordering::SeqCst));

        h.player.resume().await.unwrap();
        assert_eq!(h.player.status().state, PlaybackState::Playing);
        assert_eq!(h.backend.opened(), 1);
    }

    #[tokio::test]
    async fn pause_saves_position() {
        let h = harness(PlaybackConfig::default());
        let id = add_episode(&h.store, "a");
        h.player.play(id.clone()).await.unwrap();

        h.backend.last().set_position(123.0);
        h.player.pause().await.unwrap();

        assert_eq!(h.player.status().position_secs, 123.0);
        assert_eq!(h.store.episode(&id).unwrap().play_progress_secs, 123.0);
    }

    #[tokio::test]
    async fn seek_and_skip_clamp_to_duration() {
        let h = harness(PlaybackConfig::default());
        let id = add_episode(&h.store, "a");
        h.player.play(id).await.unwrap();

        h.player.seek(-5.0).await.unwrap();
        assert_eq!(h.player.status().position_secs, 0.0);

        h.player.seek(10_000.0).await.unwrap();
        assert_eq!(h.player.status().position_secs, LENGTH);

        h.player.seek(580.0).await.unwrap();
        h.player.skip_forward(None).await.unwrap();
        assert_eq!(h.backend.last().position(), LENGTH);

        h.player.seek(100.0).await.unwrap();
        h.player.skip_backward(None).await.unwrap();
        assert_eq!(h.player.status().position_secs, 85.0);

        h.player.skip_backward(Some(1000.0)).await.unwrap();
        assert_eq!(h.player.status().position_secs, 0.0);

        h.player.skip_forward(Some(10.0)).await.unwrap();
        assert_eq!(h.player.status().position_secs, 10.0);
    }

    #[tokio::test]
    async fn switching_episodes_keeps_a_single_session() {
        let h = harness(PlaybackConfig::default());
        let a = add_episode(&h.store, "a");
        let b = add_episode(&h.store, "b");

        h.player.play(a.clone()).await.unwrap();
        let first = h.backend.last();
        first.set_position(77.0);

        h.player.play(b.clone()).await.unwrap();

        assert!(first.stopped.load(Ordering::SeqCst));
        assert_eq!(h.backend.live.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.episode(&a).unwrap().play_progress_secs, 77.0);
        assert_eq!(h.player.status().episode, Some(b));
    }

    #[tokio::test]
    async fn end_of_media_archives_and_plays_next() {
        let h = harness(PlaybackConfig::default());
        let ids = queued(&h, &["a", "b"]).await;

        h.player.play(ids[0].clone()).await.unwrap();
        h.backend.last().events.send(SessionEvent::Ended);

        let status = wait_status(&h.player, |s| {
            s.episode.as_ref() == Some(&ids[1]) && s.state == PlaybackState::Playing
        })
        .await;
        assert_eq!(status.position_secs, 0.0);

        let finished = h.store.episode(&ids[0]).unwrap();
        assert!(finished.played);
        assert!(finished.played_at.is_some());
        assert_eq!(finished.play_progress_secs, LENGTH);
        assert_eq!(h.queue.snapshot(), vec![ids[1].clone()]);
        assert_eq!(h.backend.max_live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn end_of_last_episode_goes_idle() {
        let h = harness(PlaybackConfig::default());
        let ids = queued(&h, &["a"]).await;

        h.player.play(ids[0].clone()).await.unwrap();
        h.backend.last().events.send(SessionEvent::Ended);

        wait_status(&h.player, |s| s.state == PlaybackState::Idle).await;
        assert!(h.queue.is_empty());
        assert_eq!(h.backend.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn end_of_media_without_autoplay_goes_idle() {
        let h = harness(PlaybackConfig {
            autoplay_next: false,
            ..PlaybackConfig::default()
        });
        let ids = queued(&h, &["a", "b"]).await;

        h.player.play(ids[0].clone()).await.unwrap();
        h.backend.last().events.send(SessionEvent::Ended);

        wait_status(&h.player, |s| s.state == PlaybackState::Idle).await;
        assert_eq!(h.queue.snapshot(), vec![ids[1].clone()]);
        assert_eq!(h.backend.opened(), 1);
    }

    #[tokio::test]
    async fn archiving_another_episode_leaves_playback_alone() {
        let h = harness(PlaybackConfig::default());
        let ids = queued(&h, &["a", "b", "c"]).await;
        h.player.play(ids[0].clone()).await.unwrap();

        h.queue.archive(ids[1].clone()).await.unwrap();

        assert_eq!(h.queue.snapshot(), vec![ids[0].clone(), ids[2].clone()]);
        assert_eq!(h.queue.position_of(&ids[2]), Some(1));

        // Give the coordinator a chance to (wrongly) react
        h.player.pause().await.unwrap();
        let status = h.player.status();
        assert_eq!(status.episode, Some(ids[0].clone()));
        assert_eq!(status.state, PlaybackState::Paused);
        assert_eq!(h.backend.opened(), 1);
    }

    #[tokio::test]
    async fn archiving_the_current_episode_advances() {
        let h = harness(PlaybackConfig::default());
        let ids = queued(&h, &["a", "b", "c"]).await;
        h.player.play(ids[1].clone()).await.unwrap();
        let first = h.backend.last();
        first.set_position(30.0);

        h.queue.archive(ids[1].clone()).await.unwrap();

        wait_status(&h.player, |s| {
            s.episode.as_ref() == Some(&ids[2]) && s.state == PlaybackState::Playing
        })
        .await;
        assert!(first.stopped.load(Ordering::SeqCst));
        assert_eq!(h.store.episode(&ids[1]).unwrap().play_progress_secs, 30.0);
        assert_eq!(h.backend.max_live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clearing_the_queue_stops_queued_playback() {
        let h = harness(PlaybackConfig::default());
        let ids = queued(&h, &["a", "b"]).await;
        h.player.play(ids[0].clone()).await.unwrap();

        h.queue.clear().await.unwrap();

        wait_status(&h.player, |s| s.state == PlaybackState::Idle).await;
        assert_eq!(h.backend.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn events_from_released_sessions_are_ignored() {
        let h = harness(PlaybackConfig::default());
        let ids = queued(&h, &["a", "b"]).await;

        h.player.play(ids[0].clone()).await.unwrap();
        let stale = h.backend.last();
        h.player.play(ids[1].clone()).await.unwrap();

        stale.events.send(SessionEvent::Ended);
        stale.events.send(SessionEvent::Failed("late".to_string()));
        h.player.pause().await.unwrap();

        let status = h.player.status();
        assert_eq!(status.episode, Some(ids[1].clone()));
        assert_eq!(status.error, None);
        assert_eq!(h.queue.len(), 2);
        assert!(!h.store.episode(&ids[0]).unwrap().played);
    }

    #[tokio::test]
    async fn open_failure_pauses_with_error_and_resume_recovers() {
        let h = harness(PlaybackConfig::default());
        let id = add_episode(&h.store, "a");
        h.store.save_progress(&id, 12.0).unwrap();
        h.backend.fail_next_opens(1);

        let result = h.player.play(id.clone()).await;
        assert!(matches!(result, Err(PlaybackError::OpenFailed { .. })));
        let status = h.player.status();
        assert_eq!(status.state, PlaybackState::Paused);
        assert!(status.error.is_some());

        h.player.resume().await.unwrap();

        let status = h.player.status();
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(status.error, None);
        assert_eq!(h.backend.last().position(), 12.0);
    }

    #[tokio::test]
    async fn session_failure_releases_and_resume_reloads() {
        let h = harness(PlaybackConfig::default());
        let id = add_episode(&h.store, "a");
        h.player.play(id.clone()).await.unwrap();

        let broken = h.backend.last();
        broken.set_position(200.0);
        broken
            .events
            .send(SessionEvent::Failed("decoder error".to_string()));

        let status = wait_status(&h.player, |s| s.state == PlaybackState::Paused).await;
        assert_eq!(
            status.error,
            Some(PlaybackError::SessionFailed("decoder error".to_string()))
        );
        assert_eq!(h.backend.live.load(Ordering::SeqCst), 0);

        h.player.resume().await.unwrap();
        assert_eq!(h.player.status().state, PlaybackState::Playing);
        assert_eq!(h.backend.opened(), 2);
        assert_eq!(h.backend.last().position(), 200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn position_is_saved_on_the_progress_interval() {
        let h = harness(PlaybackConfig::default());
        let id = add_episode(&h.store, "a");
        h.player.play(id.clone()).await.unwrap();

        h.backend.last().set_position(31.0);
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(h.store.episode(&id).unwrap().play_progress_secs, 31.0);
        assert_eq!(h.player.status().position_secs, 31.0);
    }

    #[tokio::test]
    async fn stop_saves_and_goes_idle() {
        let h = harness(PlaybackConfig::default());
        let id = add_episode(&h.store, "a");
        h.player.play(id.clone()).await.unwrap();
        h.backend.last().set_position(50.0);

        h.player.stop().await.unwrap();

        assert_eq!(h.player.status(), PlaybackStatus::default());
        assert_eq!(h.store.episode(&id).unwrap().play_progress_secs, 50.0);
        assert_eq!(h.backend.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn downloaded_file_is_preferred_over_stream() {
        let h = harness(PlaybackConfig::default());
        let id = add_episode(&h.store, "a");
        let dir = tempdir().unwrap();
        let path: PathBuf = dir.path().join("a.mp3");
        std::fs::write(&path, b"audio").unwrap();

        let mut record = DownloadRecord::queued(id.clone(), path.clone());
        record.state = DownloadState::Completed;
        h.store.upsert_download(record).unwrap();

        h.player.play(id).await.unwrap();
        assert_eq!(h.backend.last().source, MediaSource::File(path));
    }

    #[tokio::test]
    async fn missing_download_falls_back_to_stream() {
        let h = harness(PlaybackConfig::default());
        let id = add_episode(&h.store, "a");
        let mut record = DownloadRecord::queued(id.clone(), PathBuf::from("/nonexistent/a.mp3"));
        record.state = DownloadState::Completed;
        h.store.upsert_download(record).unwrap();

        h.player.play(id).await.unwrap();
        assert_eq!(
            h.backend.last().source,
            MediaSource::Url("https://cdn.example.com/a.mp3".to_string())
        );
    }

    #[tokio::test]
    async fn shutdown_saves_and_ends_the_task() {
        let h = harness(PlaybackConfig::default());
        let id = add_episode(&h.store, "a");
        h.player.play(id.clone()).await.unwrap();
        h.backend.last().set_position(9.0);

        h.player.shutdown().await.unwrap();

        assert_eq!(h.store.episode(&id).unwrap().play_progress_secs, 9.0);
        assert!(matches!(h.player.play(id).await, Err(PlaybackError::Shutdown)));
    }
}
