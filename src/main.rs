use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use upnext::{
    AggregateReport, Config, DownloadManager, DownloadState, EpisodeId, JsonStore, NoopReporter,
    ProgressEvent, ProgressReporter, QueueManager, ReqwestClient, SharedProgressReporter,
    SharedRepository, SourceStatus, SyncOutcome,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "[i] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "[-] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");

const DEFAULT_STORE: &str = "upnext.json";

/// Podcast subscriptions, Up Next queue and episode downloads
#[derive(Parser, Debug)]
#[command(name = "upnext")]
#[command(about = "Podcast subscriptions, Up Next queue and episode downloads")]
#[command(version)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store file (overrides the configured store path)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode - suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed (URL or local file) and fetch its episodes
    Subscribe { feed: String },

    /// Stop auto-enqueueing new episodes from a feed
    Unsubscribe { feed: String },

    /// Refresh every subscribed feed
    Refresh,

    /// Show the Up Next queue
    Queue,

    /// List stored episodes, optionally for one feed
    Episodes { feed: Option<String> },

    /// Append an episode to the queue
    Enqueue { episode: String },

    /// Remove an episode from the queue
    Archive { episode: String },

    /// Move a queued episode to a new position (1-based)
    Move { episode: String, position: usize },

    /// Download episodes
    Download {
        /// Download every queued episode
        #[arg(long)]
        all_queued: bool,

        /// Episodes to download (queue position or full episode id)
        episodes: Vec<String>,
    },

    /// Delete downloads that were played longer ago than the retention period
    Sweep,
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<EpisodeId, ProgressBar>>,
    main_bar: ProgressBar,
}

impl IndicatifReporter {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let main_style = ProgressStyle::default_bar()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let main_bar = multi.add(ProgressBar::new_spinner());
        main_bar.set_style(main_style);
        main_bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            main_bar,
        }
    }

    fn bars(&self) -> std::sync::MutexGuard<'_, HashMap<EpisodeId, ProgressBar>> {
        self.bars.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get_or_create_bar(&self, id: &EpisodeId) -> ProgressBar {
        let mut bars = self.bars();

        if let Some(bar) = bars.get(id) {
            return bar.clone();
        }

        let style = ProgressStyle::default_bar()
            .template(&format!(
                "  {DOWNLOAD}[{{bar:30.cyan/blue}}] {{bytes}}/{{total_bytes}} {{wide_msg}}"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bars.insert(id.clone(), bar.clone());
        bar
    }

    fn finish_bar(&self, id: &EpisodeId) {
        if let Some(bar) = self.bars().remove(id) {
            bar.finish_and_clear();
        }
    }

    fn finish(&self) {
        self.main_bar.finish_and_clear();
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::FetchingFeed { url } => {
                self.main_bar
                    .set_message(format!("{SEARCH}Fetching feed: {}", url.cyan()));
            }

            ProgressEvent::ParsingFeed { url } => {
                self.main_bar
                    .set_message(format!("{SEARCH}Parsing feed: {}", url.cyan()));
            }

            ProgressEvent::FeedMerged {
                podcast_title,
                inserted,
                skipped,
                ..
            } => {
                self.main_bar.set_message(format!(
                    "{HEADPHONES}{} • {} new, {} known",
                    podcast_title.bold().green(),
                    inserted.to_string().yellow(),
                    skipped.to_string().cyan()
                ));
            }

            ProgressEvent::FeedFailed { url, error } => {
                self.multi
                    .println(format!("  {FAILURE}{} - {}", url.red(), error.dimmed()))
                    .ok();
            }

            ProgressEvent::DownloadStarting {
                worker,
                episode_id,
                episode_title,
                content_length,
            } => {
                let bar = self.get_or_create_bar(&episode_id);
                bar.set_length(content_length.unwrap_or(0));
                bar.set_position(0);
                bar.set_message(format!(
                    "[{}] {}",
                    (worker + 1).to_string().cyan(),
                    truncate_title(&episode_title, 40)
                ));
            }

            ProgressEvent::DownloadProgress {
                episode_id,
                bytes_downloaded,
                total_bytes,
                ..
            } => {
                let bar = self.get_or_create_bar(&episode_id);
                if let Some(total) = total_bytes {
                    bar.set_length(total);
                }
                bar.set_position(bytes_downloaded);
            }

            ProgressEvent::DownloadRetrying {
                episode_id,
                attempt,
                error,
            } => {
                let bar = self.get_or_create_bar(&episode_id);
                bar.set_position(0);
                bar.set_message(format!(
                    "retry {} - {}",
                    attempt.to_string().yellow(),
                    error.dimmed()
                ));
            }

            ProgressEvent::DownloadCompleted {
                episode_id,
                bytes_downloaded,
                ..
            } => {
                let bar = self.get_or_create_bar(&episode_id);
                bar.set_position(bytes_downloaded);
                self.multi
                    .println(format!("  {SUCCESS}{}", episode_id.key.green()))
                    .ok();
                self.finish_bar(&episode_id);
            }

            ProgressEvent::DownloadFailed {
                episode_id, error, ..
            } => {
                self.multi
                    .println(format!(
                        "  {FAILURE}{} - {}",
                        truncate_title(&episode_id.key, 30).red(),
                        error.red()
                    ))
                    .ok();
                self.finish_bar(&episode_id);
            }

            ProgressEvent::DownloadCancelled { episode_id } => {
                self.finish_bar(&episode_id);
            }

            ProgressEvent::PartialFilesCleanedUp { count } => {
                self.main_bar.set_message(format!(
                    "{BROOM}Removed {} leftover partial files",
                    count.to_string().cyan()
                ));
            }

            ProgressEvent::RefreshCompleted { .. }
            | ProgressEvent::DownloadQueued { .. }
            | ProgressEvent::DownloadRemoved { .. }
            | ProgressEvent::RetentionSwept { .. } => {}
        }
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let cut: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "upnext=warn",
        1 => "upnext=debug",
        _ => "upnext=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(store) = &args.store {
        config.store_path = Some(store.clone());
    } else if config.store_path.is_none() {
        config.store_path = Some(PathBuf::from(DEFAULT_STORE));
    }
    Ok(config)
}

fn open_store(path: &Path) -> Result<SharedRepository> {
    let store = JsonStore::open(path)
        .with_context(|| format!("Failed to open store {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Resolve a queue position (1-based) or a full `feed#key` episode id
fn resolve_episode(store: &SharedRepository, queue: &QueueManager, arg: &str) -> Result<EpisodeId> {
    if let Ok(position) = arg.parse::<usize>() {
        let snapshot = queue.snapshot();
        return position
            .checked_sub(1)
            .and_then(|index| snapshot.get(index).cloned())
            .with_context(|| format!("No episode at queue position {position}"));
    }

    let found = store
        .sources()
        .into_iter()
        .flat_map(|source| store.episodes_for_source(&source.feed_url))
        .find(|episode| episode.id.to_string() == arg);

    match found {
        Some(episode) => Ok(episode.id),
        None => bail!("Unknown episode: {arg}"),
    }
}

fn print_outcome(outcome: &SyncOutcome) {
    println!(
        "{HEADPHONES}{} • {} new, {} known{}",
        outcome.podcast_title.bold().green(),
        outcome.inserted.len().to_string().yellow(),
        outcome.skipped.to_string().cyan(),
        match &outcome.auto_enqueued {
            Some(id) => format!(", queued {}", id.key.cyan()),
            None => String::new(),
        }
    );
}

fn print_report(report: &AggregateReport) {
    for source in &report.sources {
        match &source.status {
            SourceStatus::Synced(outcome) => print_outcome(outcome),
            SourceStatus::Failed(e) => println!(
                "  {CROSS}{} - {}",
                source.feed_url.yellow(),
                e.to_string().dimmed()
            ),
            SourceStatus::TimedOut => {
                println!("  {CROSS}{} - {}", source.feed_url.yellow(), "timed out".dimmed())
            }
        }
    }

    println!(
        "\n{PARTY}{} {} refreshed, {} new episodes, {} failed, {} timed out",
        "Refresh complete:".bold().green(),
        report.succeeded().to_string().green().bold(),
        report.inserted().to_string().yellow(),
        if report.failed() > 0 {
            report.failed().to_string().red().bold()
        } else {
            report.failed().to_string().green()
        },
        report.timed_out().to_string().yellow()
    );
}

fn print_queue(store: &SharedRepository, queue: &QueueManager) {
    let snapshot = queue.snapshot();
    if snapshot.is_empty() {
        println!("{}", "Up Next is empty".dimmed());
        return;
    }

    for (index, id) in snapshot.iter().enumerate() {
        let Some(episode) = store.episode(id) else {
            continue;
        };
        let downloaded = if episode.download_state == Some(DownloadState::Completed) {
            format!(" {DOWNLOAD}")
        } else {
            String::new()
        };
        println!(
            "{:>3}. {}{}  {}",
            (index + 1).to_string().cyan(),
            episode.title.bold(),
            downloaded,
            id.to_string().dimmed()
        );
    }
}

async fn wait_for_downloads(manager: &DownloadManager<ReqwestClient>, ids: &[EpisodeId]) {
    loop {
        let pending = ids.iter().any(|id| {
            manager
                .record(id)
                .is_some_and(|r| matches!(r.state, DownloadState::Queued | DownloadState::Downloading))
        });
        if !pending {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = load_config(&args)?;
    let store_path = config
        .store_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE));
    let store = open_store(&store_path)?;
    let queue = QueueManager::start(store.clone());

    let indicatif = (!args.quiet).then(|| Arc::new(IndicatifReporter::new()));
    let reporter: SharedProgressReporter = match &indicatif {
        Some(reporter) => reporter.clone(),
        None => NoopReporter::shared(),
    };

    if !args.quiet {
        println!(
            "\n{}{} {}\n",
            MICROPHONE,
            "upnext".bold().magenta(),
            "- Podcast Queue".dimmed()
        );
    }

    let client = ReqwestClient::with_timeouts(
        config.sync.fetch_timeout,
        config.download.inactivity_timeout,
    )
    .context("Failed to build HTTP client")?;
    let engine = upnext::FeedSyncEngine::new(
        client.clone(),
        store.clone(),
        queue.clone(),
        config.sync.clone(),
        reporter.clone(),
    );

    match &args.command {
        Command::Subscribe { feed } => {
            let outcome = engine
                .subscribe(feed)
                .await
                .with_context(|| format!("Failed to subscribe to {feed}"))?;
            if let Some(reporter) = &indicatif {
                reporter.finish();
            }
            print_outcome(&outcome);
        }

        Command::Unsubscribe { feed } => {
            if engine.unsubscribe(feed).await.context("Failed to unsubscribe")? {
                println!("{SUCCESS}Unsubscribed from {}", feed.cyan());
            } else {
                bail!("Not subscribed to {feed}");
            }
        }

        Command::Refresh => {
            let report = engine.refresh_subscribed().await;
            if let Some(reporter) = &indicatif {
                reporter.finish();
            }
            print_report(&report);
        }

        Command::Queue => print_queue(&store, &queue),

        Command::Episodes { feed } => {
            let sources = match feed {
                Some(feed) => vec![feed.clone()],
                None => store.sources().into_iter().map(|s| s.feed_url).collect(),
            };
            for feed_url in sources {
                for episode in store.episodes_for_source(&feed_url) {
                    let marker = if episode.is_queued { "▶" } else { " " };
                    println!(
                        "{} {}  {}",
                        marker.green(),
                        episode.title.bold(),
                        episode.id.to_string().dimmed()
                    );
                }
            }
        }

        Command::Enqueue { episode } => {
            let id = resolve_episode(&store, &queue, episode)?;
            match queue.enqueue(id.clone()).await.context("Failed to enqueue")? {
                Some(position) => println!(
                    "{SUCCESS}Queued {} at position {}",
                    id.key.cyan(),
                    (position + 1).to_string().cyan()
                ),
                None => println!("{}", "Episode is already queued".dimmed()),
            }
        }

        Command::Archive { episode } => {
            let id = resolve_episode(&store, &queue, episode)?;
            match queue.archive(id.clone()).await.context("Failed to archive")? {
                Some(_) => println!("{SUCCESS}Archived {}", id.key.cyan()),
                None => println!("{}", "Episode was not queued".dimmed()),
            }
        }

        Command::Move { episode, position } => {
            let id = resolve_episode(&store, &queue, episode)?;
            let index = position.saturating_sub(1);
            match queue.move_to(id.clone(), index).await.context("Failed to move")? {
                Some(to) => println!(
                    "{SUCCESS}Moved {} to position {}",
                    id.key.cyan(),
                    (to + 1).to_string().cyan()
                ),
                None => bail!("Episode is not queued"),
            }
        }

        Command::Download {
            all_queued,
            episodes,
        } => {
            let mut ids = Vec::new();
            if *all_queued {
                ids.extend(queue.snapshot());
            }
            for episode in episodes {
                ids.push(resolve_episode(&store, &queue, episode)?);
            }
            if ids.is_empty() {
                bail!("Nothing to download: pass episodes or --all-queued");
            }

            let manager =
                DownloadManager::start(client, store.clone(), config.download.clone(), reporter)
                    .await
                    .context("Failed to start downloads")?;
            for id in &ids {
                manager
                    .request(id)
                    .await
                    .with_context(|| format!("Failed to request {id}"))?;
            }

            wait_for_downloads(&manager, &ids).await;
            manager.shutdown().await;
            if let Some(reporter) = &indicatif {
                reporter.finish();
            }

            let failed: Vec<_> = ids
                .iter()
                .filter_map(|id| manager.record(id))
                .filter(|r| r.state == DownloadState::Failed)
                .collect();
            let completed = ids.len() - failed.len();

            if !failed.is_empty() {
                println!("\n{}", "Failed downloads:".red().bold());
                for record in &failed {
                    println!(
                        "  {}{} - {}",
                        CROSS,
                        record.episode_id.key.yellow(),
                        record.last_error.as_deref().unwrap_or("unknown error").dimmed()
                    );
                }
            }
            println!(
                "\n{PARTY}{} {} ready, {} failed",
                "Downloads done:".bold().green(),
                completed.to_string().green().bold(),
                failed.len().to_string().red()
            );
            if completed == 0 {
                std::process::exit(1);
            }
        }

        Command::Sweep => {
            let manager =
                DownloadManager::start(client, store.clone(), config.download.clone(), reporter)
                    .await
                    .context("Failed to start downloads")?;
            let removed = manager.retention_sweep(Utc::now()).await;
            manager.shutdown().await;
            if let Some(reporter) = &indicatif {
                reporter.finish();
            }
            println!(
                "{BROOM}Removed {} played downloads",
                removed.to_string().cyan()
            );
        }
    }

    Ok(())
}
