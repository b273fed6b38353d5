// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use console::Emoji;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use podsync::{
    AutoAddRule, FeedCache, FeedService, FeedSyncManager, FetchOptions, FileBackend,
    InsertPosition, JsonStore, NoopReporter, ProgressReporter, ReqwestClient,
    SharedProgressReporter, SubscriptionStore, SyncEvent, SyncOptions, TargetType,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "[i] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static INBOX: Emoji<'_, '_> = Emoji("📥 ", "[>] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static CLOCK: Emoji<'_, '_> = Emoji("⏰ ", "[~] ");

/// Subscribe to podcast feeds and keep them in sync
#[derive(Parser, Debug)]
#[command(name = "podsync")]
#[command(about = "Subscribe to podcast feeds and keep them in sync")]
#[command(version)]
struct Cli {
    /// Directory holding subscriptions, queues, playlists and the feed cache
    #[arg(long, env = "PODSYNC_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Quiet mode - suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a feed and print its episodes without subscribing
    Fetch {
        url: String,

        /// Always go to the network
        #[arg(long)]
        no_cache: bool,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Subscribe to a feed
    Subscribe { url: String },

    /// Remove a subscription
    Unsubscribe { id: String },

    /// List subscriptions
    List,

    /// Refresh subscriptions that are due (or the given ones)
    Sync {
        /// Refresh even podcasts fetched recently
        #[arg(short, long)]
        force: bool,

        /// Podcasts refreshed at the same time
        #[arg(short = 'c', long, default_value = "3")]
        concurrency: usize,

        /// Minutes after which a podcast is due again
        #[arg(long, default_value = "60")]
        interval_mins: u32,

        /// Podcast ids to restrict the sync to
        ids: Vec<String>,
    },

    /// Sync now and then on a fixed interval until interrupted
    Watch {
        /// Minutes between sync runs
        #[arg(long, default_value = "60")]
        interval_mins: u64,
    },

    /// Route new episodes of a podcast into a queue or playlist
    AutoAdd(AutoAddArgs),

    /// Inspect or prune the feed cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Args, Debug)]
struct AutoAddArgs {
    /// Podcast id
    id: String,

    /// Target queue id
    #[arg(long, conflicts_with = "playlist", required_unless_present_any = ["playlist", "disable"])]
    queue: Option<String>,

    /// Target playlist id
    #[arg(long)]
    playlist: Option<String>,

    /// Insert at the top instead of appending
    #[arg(long)]
    top: bool,

    /// Switch auto-add off
    #[arg(long, conflicts_with_all = ["queue", "playlist", "top"])]
    disable: bool,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Show entry count and size
    Stats,
    /// Remove expired entries
    Cleanup,
    /// Remove one cached feed, or all of them
    Clear { url: Option<String> },
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl IndicatifReporter {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        let bar = self.bar.lock().ok().and_then(|guard| guard.clone());
        if let Some(bar) = bar {
            f(&bar);
        }
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: SyncEvent) {
        match event {
            SyncEvent::SyncStarted { total } => {
                let style = ProgressStyle::with_template(
                    "{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓░");
                let bar = ProgressBar::new(total as u64);
                bar.set_style(style);
                bar.enable_steady_tick(Duration::from_millis(100));
                if let Ok(mut slot) = self.bar.lock() {
                    *slot = Some(bar);
                }
            }

            SyncEvent::PodcastSyncing { title, .. } => {
                self.with_bar(|bar| {
                    bar.set_message(format!("{HEADPHONES}{}", truncate_title(&title, 40).cyan()))
                });
            }

            SyncEvent::PodcastSynced {
                title,
                new_episodes,
                ..
            } => {
                self.with_bar(|bar| {
                    bar.inc(1);
                    bar.println(format!(
                        "{SUCCESS}{} • {} new",
                        truncate_title(&title, 50).green(),
                        new_episodes.to_string().yellow()
                    ));
                });
            }

            SyncEvent::PodcastFailed { title, error, .. } => {
                self.with_bar(|bar| {
                    bar.inc(1);
                    bar.println(format!(
                        "{FAILURE}{} - {}",
                        truncate_title(&title, 40).red(),
                        error.dimmed()
                    ));
                });
            }

            SyncEvent::EpisodesAutoAdded {
                target,
                target_id,
                count,
                ..
            } => {
                self.with_bar(|bar| {
                    bar.println(format!(
                        "   {INBOX}{} added to {target} {}",
                        count.to_string().cyan(),
                        target_id.bold()
                    ));
                });
            }

            SyncEvent::SyncCompleted {
                success_count,
                failure_count,
                new_episodes,
            } => {
                if let Ok(mut slot) = self.bar.lock()
                    && let Some(bar) = slot.take()
                {
                    bar.finish_and_clear();
                }
                println!(
                    "{PARTY}{} {} synced, {} failed, {} new episodes",
                    "Sync complete:".bold().green(),
                    success_count.to_string().green().bold(),
                    if failure_count > 0 {
                        failure_count.to_string().red().bold()
                    } else {
                        failure_count.to_string().green()
                    },
                    new_episodes.to_string().yellow()
                );
            }
        }
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let head: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

fn format_duration(seconds: u32) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn default_data_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set; pass --data-dir")?;
    Ok(PathBuf::from(home).join(".local/share/podsync"))
}

struct App {
    service: FeedService,
    store: Arc<JsonStore>,
    reporter: SharedProgressReporter,
}

impl App {
    fn new(cli: &Cli) -> Result<Self> {
        let data_dir = match &cli.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir()?,
        };

        let user_agent = FetchOptions::default().user_agent;
        let client = ReqwestClient::new(&user_agent).context("Failed to create HTTP client")?;
        let cache = FeedCache::new(Arc::new(FileBackend::new(data_dir.join("cache"))));
        let service = FeedService::new(Arc::new(client)).with_cache(cache);

        let reporter: SharedProgressReporter = if cli.quiet {
            NoopReporter::shared()
        } else {
            Arc::new(IndicatifReporter::new())
        };

        Ok(Self {
            service,
            store: Arc::new(JsonStore::new(data_dir)),
            reporter,
        })
    }

    fn manager(&self, sync_interval: Option<Duration>) -> FeedSyncManager {
        let builder = FeedSyncManager::builder(
            self.service.clone(),
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
        )
        .reporter(self.reporter.clone());

        match sync_interval {
            Some(interval) => builder.sync_interval(interval).build(),
            None => builder.build(),
        }
    }
}

async fn fetch(app: &App, url: &str, no_cache: bool, timeout: u64) -> Result<()> {
    let options = FetchOptions {
        use_cache: !no_cache,
        timeout: Duration::from_secs(timeout),
        ..FetchOptions::default()
    };
    let feed = app
        .service
        .fetch_feed(url, &options)
        .await
        .with_context(|| format!("Failed to fetch {url}"))?;

    let podcast = &feed.podcast;
    println!("{HEADPHONES}{}", podcast.title.bold().green());
    if !podcast.author.is_empty() {
        println!("   by {}", podcast.author.cyan());
    }
    println!("   {} ({} episodes)\n", podcast.id.dimmed(), feed.episodes.len());

    for episode in &feed.episodes {
        let date = episode
            .publish_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "----------".to_string());
        println!(
            "  {} {} {}",
            date.dimmed(),
            truncate_title(&episode.title, 60),
            format_duration(episode.duration).dimmed()
        );
    }
    Ok(())
}

async fn list(app: &App) -> Result<()> {
    let podcasts = app.store.get_all_podcasts().await?;
    if podcasts.is_empty() {
        println!("No subscriptions yet. Add one with `podsync subscribe <URL>`.");
        return Ok(());
    }

    for podcast in podcasts {
        println!(
            "{} {}",
            podcast.id.dimmed(),
            truncate_title(&podcast.title, 50).bold()
        );
        println!(
            "   {} episodes, last fetched {}",
            podcast.episodes.len().to_string().cyan(),
            format_time(podcast.last_fetched_at)
        );
        if let Some(rule) = podcast.active_auto_add_rule() {
            println!(
                "   {INBOX}auto-add to {} {} ({:?})",
                rule.target_type,
                rule.target_id.bold(),
                rule.position
            );
        }
    }
    Ok(())
}

async fn auto_add(app: &App, args: AutoAddArgs) -> Result<()> {
    let Some(mut podcast) = app.store.get_podcast(&args.id).await? else {
        bail!("No subscription with id {}", args.id);
    };

    podcast.auto_add_rule = if args.disable {
        podcast.auto_add_rule.map(|rule| AutoAddRule {
            enabled: false,
            ..rule
        })
    } else {
        let (target_type, target_id) = match (args.queue, args.playlist) {
            (Some(queue), _) => (TargetType::Queue, queue),
            (None, Some(playlist)) => (TargetType::Playlist, playlist),
            (None, None) => bail!("Pass --queue or --playlist"),
        };
        Some(AutoAddRule {
            enabled: true,
            target_type,
            target_id,
            position: if args.top {
                InsertPosition::Top
            } else {
                InsertPosition::Bottom
            },
        })
    };

    app.store.update_podcast(&podcast).await?;
    match podcast.active_auto_add_rule() {
        Some(rule) => println!(
            "{SUCCESS}New episodes of {} go to {} {}",
            podcast.title.bold(),
            rule.target_type,
            rule.target_id.cyan()
        ),
        None => println!("{SUCCESS}Auto-add disabled for {}", podcast.title.bold()),
    }
    Ok(())
}

async fn cache(app: &App, action: CacheAction) -> Result<()> {
    let Some(cache) = app.service.cache() else {
        bail!("No feed cache configured");
    };

    match action {
        CacheAction::Stats => {
            let stats = cache.stats().await?;
            println!(
                "{} cached feeds, {}",
                stats.total_entries.to_string().cyan(),
                HumanBytes(stats.total_size_bytes)
            );
        }
        CacheAction::Cleanup => {
            let removed = cache.cleanup_expired().await?;
            println!("{SUCCESS}Removed {} expired entries", removed.to_string().cyan());
        }
        CacheAction::Clear { url } => {
            app.service.clear_cache(url.as_deref()).await;
            println!("{SUCCESS}Cache cleared");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let app = App::new(&cli)?;

    if !cli.quiet {
        println!("\n{}{}\n", MICROPHONE, "podsync".bold().magenta());
    }

    match cli.command {
        Command::Fetch {
            url,
            no_cache,
            timeout,
        } => fetch(&app, &url, no_cache, timeout).await?,

        Command::Subscribe { url } => match app.service.subscribe(app.store.as_ref(), &url).await {
            Ok(podcast) => println!(
                "{SUCCESS}Subscribed to {} ({} episodes)\n   id: {}",
                podcast.title.bold().green(),
                podcast.episodes.len(),
                podcast.id
            ),
            Err(e) => {
                tracing::debug!(error = %e, "Subscribe failed");
                eprintln!("{FAILURE}{}", e.user_message().red());
                std::process::exit(1);
            }
        },

        Command::Unsubscribe { id } => {
            if app.manager(None).unsubscribe(&id).await? {
                println!("{SUCCESS}Unsubscribed {}", id.bold());
            } else {
                println!("No subscription with id {}", id.bold());
            }
        }

        Command::List => list(&app).await?,

        Command::Sync {
            force,
            concurrency,
            interval_mins,
            ids,
        } => {
            let options = SyncOptions {
                force,
                concurrency,
                update_interval: chrono::Duration::minutes(i64::from(interval_mins)),
                ..SyncOptions::default()
            };
            let manager = app.manager(None);
            let result = if ids.is_empty() {
                manager.sync_all(options).await?
            } else {
                manager.sync_podcasts(&ids, options).await?
            };

            if result.total == 0 && !cli.quiet {
                println!("Nothing to sync, every podcast is up to date.");
            }
            if result.total > 0 && result.success_count == 0 {
                std::process::exit(1);
            }
        }

        Command::Watch { interval_mins } => {
            let interval = Duration::from_secs(interval_mins.max(1) * 60);
            let manager = app.manager(Some(interval));

            manager.start_auto_sync().await;
            println!(
                "{CLOCK}Syncing every {} minutes. Press Ctrl-C to stop.",
                interval_mins.max(1).to_string().cyan()
            );
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            manager.stop_auto_sync();
        }

        Command::AutoAdd(args) => auto_add(&app, args).await?,

        Command::Cache { action } => cache(&app, action).await?,
    }

    Ok(())
}
