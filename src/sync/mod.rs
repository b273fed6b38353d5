// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Batch synchronization of subscribed podcasts.
//!
//! A [`FeedSyncManager`] refreshes subscriptions in strictly sequenced
//! batches of bounded width, merges new episodes into the stored podcasts and
//! applies auto-add rules. At most one sync runs per manager at a time; a
//! second request fails fast with [`SyncError::AlreadySyncing`].

mod auto_add;
pub(crate) mod merge;
mod schedule;

pub use auto_add::apply_auto_add;
pub use merge::{find_new_episodes, merge_episodes, should_update};
pub use schedule::{ScheduleHandle, ScheduledTask, Scheduler, TokioScheduler};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;

use crate::error::SyncError;
use crate::model::{Episode, Podcast};
use crate::progress::{NoopReporter, SharedProgressReporter, SyncEvent};
use crate::service::FeedService;
use crate::store::{SharedPlaylistManager, SharedQueueManager, SharedSubscriptionStore};

/// Default period of the auto-sync timer
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Options for a batch sync
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Sync every selected podcast, due or not
    pub force: bool,
    /// Restrict the run to these podcasts; unknown ids are skipped
    pub podcast_ids: Option<Vec<String>>,
    /// Podcasts refreshed concurrently per batch; 0 is treated as 1
    pub concurrency: usize,
    /// A podcast is due once this much time passed since its last fetch
    pub update_interval: chrono::Duration,
    /// Pause between consecutive batches
    pub batch_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force: false,
            podcast_ids: None,
            concurrency: 3,
            update_interval: chrono::Duration::hours(1),
            batch_delay: Duration::from_secs(1),
        }
    }
}

/// Outcome of syncing one podcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub podcast_id: String,
    pub title: String,
    pub success: bool,
    pub new_episodes_count: usize,
    pub error: Option<String>,
    /// Set when the podcast synced but routing its new episodes failed
    pub auto_add_error: Option<String>,
}

impl SyncResult {
    fn succeeded(podcast: &Podcast, new_episodes_count: usize) -> Self {
        Self {
            podcast_id: podcast.id.clone(),
            title: podcast.title.clone(),
            success: true,
            new_episodes_count,
            error: None,
            auto_add_error: None,
        }
    }

    fn failed(podcast: &Podcast, error: String) -> Self {
        Self {
            podcast_id: podcast.id.clone(),
            title: podcast.title.clone(),
            success: false,
            new_episodes_count: 0,
            error: Some(error),
            auto_add_error: None,
        }
    }
}

/// Outcome of a batch sync; `results` follow the selection order
#[derive(Debug, Clone)]
pub struct BatchSyncResult {
    pub total: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub new_episodes_count: usize,
    pub results: Vec<SyncResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl BatchSyncResult {
    fn from_results(
        results: Vec<SyncResult>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            success_count,
            failure_count: results.len() - success_count,
            new_episodes_count: results.iter().map(|r| r.new_episodes_count).sum(),
            results,
            started_at,
            completed_at,
        }
    }
}

/// Snapshot of a manager's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub auto_sync_enabled: bool,
    pub sync_interval: Duration,
}

struct State {
    last_sync_time: Option<DateTime<Utc>>,
    sync_interval: Duration,
    auto_sync: Option<ScheduleHandle>,
}

struct Inner {
    service: FeedService,
    store: SharedSubscriptionStore,
    queues: SharedQueueManager,
    playlists: SharedPlaylistManager,
    reporter: SharedProgressReporter,
    scheduler: Arc<dyn Scheduler>,
    auto_sync_options: SyncOptions,
    syncing: AtomicBool,
    state: Mutex<State>,
}

/// Holds the single-flight flag; clears it when dropped
struct SyncGuard {
    inner: Arc<Inner>,
}

impl SyncGuard {
    fn acquire(inner: &Arc<Inner>) -> Result<Self, SyncError> {
        inner
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SyncError::AlreadySyncing)?;
        Ok(Self {
            inner: inner.clone(),
        })
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.inner.syncing.store(false, Ordering::Release);
    }
}

/// Builder for [`FeedSyncManager`]
pub struct FeedSyncManagerBuilder {
    service: FeedService,
    store: SharedSubscriptionStore,
    queues: SharedQueueManager,
    playlists: SharedPlaylistManager,
    reporter: SharedProgressReporter,
    scheduler: Arc<dyn Scheduler>,
    auto_sync_options: SyncOptions,
    sync_interval: Duration,
}

impl FeedSyncManagerBuilder {
    pub fn reporter(mut self, reporter: SharedProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Options used by every auto-sync run; `force` and `podcast_ids` are honored too
    pub fn auto_sync_options(mut self, options: SyncOptions) -> Self {
        self.auto_sync_options = options;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn build(self) -> FeedSyncManager {
        FeedSyncManager {
            inner: Arc::new(Inner {
                service: self.service,
                store: self.store,
                queues: self.queues,
                playlists: self.playlists,
                reporter: self.reporter,
                scheduler: self.scheduler,
                auto_sync_options: self.auto_sync_options,
                syncing: AtomicBool::new(false),
                state: Mutex::new(State {
                    last_sync_time: None,
                    sync_interval: self.sync_interval,
                    auto_sync: None,
                }),
            }),
        }
    }
}

/// Keeps subscribed podcasts up to date, on demand or on a timer
#[derive(Clone)]
pub struct FeedSyncManager {
    inner: Arc<Inner>,
}

impl FeedSyncManager {
    pub fn builder(
        service: FeedService,
        store: SharedSubscriptionStore,
        queues: SharedQueueManager,
        playlists: SharedPlaylistManager,
    ) -> FeedSyncManagerBuilder {
        FeedSyncManagerBuilder {
            service,
            store,
            queues,
            playlists,
            reporter: NoopReporter::shared(),
            scheduler: TokioScheduler::shared(),
            auto_sync_options: SyncOptions::default(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    pub fn service(&self) -> &FeedService {
        &self.inner.service
    }

    /// Sync every subscription that is due, or all of them when forced.
    ///
    /// The run is spawned onto the runtime, so dropping the returned future
    /// does not cancel it; the manager stays busy until it finishes.
    pub async fn sync_all(&self, options: SyncOptions) -> Result<BatchSyncResult, SyncError> {
        let guard = SyncGuard::acquire(&self.inner)?;
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let _guard = guard;
            inner.run_batch(&options).await
        })
        .await
        .map_err(|e| SyncError::TaskFailed(e.to_string()))?
    }

    /// Like [`sync_all`](Self::sync_all), restricted to `podcast_ids`
    pub async fn sync_podcasts(
        &self,
        podcast_ids: &[String],
        options: SyncOptions,
    ) -> Result<BatchSyncResult, SyncError> {
        self.sync_all(SyncOptions {
            podcast_ids: Some(podcast_ids.to_vec()),
            ..options
        })
        .await
    }

    /// Sync one podcast right away, due or not
    pub async fn sync_podcast(&self, podcast_id: &str) -> Result<SyncResult, SyncError> {
        let guard = SyncGuard::acquire(&self.inner)?;
        let inner = self.inner.clone();
        let podcast_id = podcast_id.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            let podcast = inner
                .store
                .get_podcast(&podcast_id)
                .await?
                .ok_or_else(|| SyncError::UnknownPodcast(podcast_id.clone()))?;
            Ok::<_, SyncError>(inner.sync_one(&podcast).await)
        })
        .await
        .map_err(|e| SyncError::TaskFailed(e.to_string()))?
    }

    /// Remove a subscription and its cached feed. Refused while a sync runs.
    pub async fn unsubscribe(&self, podcast_id: &str) -> Result<bool, SyncError> {
        let _guard = SyncGuard::acquire(&self.inner)?;

        let Some(podcast) = self.inner.store.get_podcast(podcast_id).await? else {
            return Ok(false);
        };
        let removed = self.inner.store.remove_podcast(podcast_id).await?;
        self.inner
            .service
            .clear_cache(Some(podcast.feed_url.as_str()))
            .await;

        tracing::info!(podcast_id = %podcast_id, title = %podcast.title, "Unsubscribed");
        Ok(removed)
    }

    /// Start the auto-sync timer and run one sync immediately.
    ///
    /// Does nothing if auto-sync is already running.
    pub async fn start_auto_sync(&self) {
        {
            let mut state = self.inner.state();
            if state.auto_sync.is_some() {
                return;
            }

            let weak = Arc::downgrade(&self.inner);
            let task: ScheduledTask = Arc::new(move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        FeedSyncManager { inner }.run_auto_sync().await;
                    }
                }
                .boxed()
            });
            let period = state.sync_interval;
            state.auto_sync = Some(self.inner.scheduler.schedule_repeating(period, task));
            tracing::info!(interval_secs = period.as_secs(), "Auto-sync started");
        }

        self.run_auto_sync().await;
    }

    /// Stop the auto-sync timer. A run already in flight completes.
    pub fn stop_auto_sync(&self) {
        let handle = self.inner.state().auto_sync.take();
        if let Some(handle) = handle {
            handle.cancel();
            tracing::info!("Auto-sync stopped");
        }
    }

    /// Change the auto-sync period, restarting the timer if it runs
    pub async fn set_sync_interval(&self, interval: Duration) {
        let running = {
            let mut state = self.inner.state();
            state.sync_interval = interval;
            state.auto_sync.is_some()
        };

        if running {
            self.stop_auto_sync();
            self.start_auto_sync().await;
        }
    }

    pub fn get_sync_status(&self) -> SyncStatus {
        let state = self.inner.state();
        SyncStatus {
            is_syncing: self.inner.syncing.load(Ordering::Acquire),
            last_sync_time: state.last_sync_time,
            auto_sync_enabled: state.auto_sync.is_some(),
            sync_interval: state.sync_interval,
        }
    }

    async fn run_auto_sync(&self) {
        match self.sync_all(self.inner.auto_sync_options.clone()).await {
            Ok(result) => tracing::debug!(
                total = result.total,
                failures = result.failure_count,
                new_episodes = result.new_episodes_count,
                "Auto-sync run finished"
            ),
            Err(SyncError::AlreadySyncing) => {
                tracing::info!("Skipping auto-sync run, a sync is already in progress")
            }
            Err(e) => tracing::warn!(error = %e, "Auto-sync run failed"),
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_batch(&self, options: &SyncOptions) -> Result<BatchSyncResult, SyncError> {
        let clock = self.service.clock();
        let started_at = clock.now();
        let targets = self.select_targets(options).await?;

        self.reporter.report(SyncEvent::SyncStarted {
            total: targets.len(),
        });

        let width = options.concurrency.max(1);
        let mut results = Vec::with_capacity(targets.len());
        for (index, batch) in targets.chunks(width).enumerate() {
            if index > 0 && !options.batch_delay.is_zero() {
                tokio::time::sleep(options.batch_delay).await;
            }
            results.extend(join_all(batch.iter().map(|podcast| self.sync_one(podcast))).await);
        }

        let completed_at = clock.now();
        let result = BatchSyncResult::from_results(results, started_at, completed_at);
        self.state().last_sync_time = Some(completed_at);

        self.reporter.report(SyncEvent::SyncCompleted {
            success_count: result.success_count,
            failure_count: result.failure_count,
            new_episodes: result.new_episodes_count,
        });
        tracing::info!(
            total = result.total,
            succeeded = result.success_count,
            failed = result.failure_count,
            new_episodes = result.new_episodes_count,
            "Sync finished"
        );

        Ok(result)
    }

    async fn select_targets(&self, options: &SyncOptions) -> Result<Vec<Podcast>, SyncError> {
        let podcasts = self.store.get_all_podcasts().await?;

        let selected: Vec<Podcast> = match &options.podcast_ids {
            None => podcasts,
            Some(ids) => {
                let mut seen = HashSet::new();
                ids.iter()
                    .filter(|id| seen.insert(id.as_str()))
                    .filter_map(|id| {
                        let found = podcasts.iter().find(|p| &p.id == id).cloned();
                        if found.is_none() {
                            tracing::debug!(podcast_id = %id, "Skipping unknown podcast");
                        }
                        found
                    })
                    .collect()
            }
        };

        if options.force {
            return Ok(selected);
        }

        let now = self.service.clock().now();
        Ok(selected
            .into_iter()
            .filter(|p| should_update(p, now, options.update_interval))
            .collect())
    }

    async fn sync_one(&self, podcast: &Podcast) -> SyncResult {
        self.reporter.report(SyncEvent::PodcastSyncing {
            podcast_id: podcast.id.clone(),
            title: podcast.title.clone(),
        });

        match self.refresh(podcast).await {
            Ok((updated, new_episodes)) => {
                let mut result = SyncResult::succeeded(&updated, new_episodes.len());
                result.auto_add_error = self.auto_add(&updated, &new_episodes).await;

                self.reporter.report(SyncEvent::PodcastSynced {
                    podcast_id: updated.id.clone(),
                    title: updated.title.clone(),
                    new_episodes: new_episodes.len(),
                });
                result
            }
            Err(e) => {
                tracing::warn!(podcast_id = %podcast.id, error = %e, "Podcast sync failed");
                self.reporter.report(SyncEvent::PodcastFailed {
                    podcast_id: podcast.id.clone(),
                    title: podcast.title.clone(),
                    error: e.to_string(),
                });
                SyncResult::failed(podcast, e.to_string())
            }
        }
    }

    /// Fetch, merge and persist one podcast
    async fn refresh(&self, stored: &Podcast) -> Result<(Podcast, Vec<Episode>), SyncError> {
        let update = self.service.update_feed(stored).await?;

        let mut podcast = stored.clone();
        podcast.refresh_metadata(&update.podcast);
        podcast.episodes = merge_episodes(&update.new_episodes, &stored.episodes);
        podcast.last_fetched_at = Some(self.service.clock().now());

        self.store.update_podcast(&podcast).await?;
        Ok((podcast, update.new_episodes))
    }

    /// Apply the podcast's auto-add rule; returns the error message on failure
    async fn auto_add(&self, podcast: &Podcast, new_episodes: &[Episode]) -> Option<String> {
        let rule = podcast.active_auto_add_rule()?;
        if new_episodes.is_empty() {
            return None;
        }

        let queues = self.queues.as_ref();
        let playlists = self.playlists.as_ref();
        match apply_auto_add(rule, new_episodes, queues, playlists).await {
            Ok(count) => {
                self.reporter.report(SyncEvent::EpisodesAutoAdded {
                    podcast_id: podcast.id.clone(),
                    target: rule.target_type,
                    target_id: rule.target_id.clone(),
                    count,
                });
                None
            }
            Err(e) => {
                tracing::warn!(
                    podcast_id = %podcast.id,
                    target = %rule.target_type,
                    target_id = %rule.target_id,
                    error = %e,
                    "Auto-add failed"
                );
                Some(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::schedule::tests::ManualScheduler;
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{StorageError, TransportError};
    use crate::fetcher::RetryPolicy;
    use crate::http::{HttpClient, HttpRequest, HttpResponse};
    use crate::identity;
    use crate::model::{AutoAddRule, InsertPosition, TargetType};
    use crate::progress::tests::RecordingReporter;
    use crate::store::{MemoryStore, QueueManager, SubscriptionStore};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use url::Url;

    /// Serves canned feeds by URL, counting requests and peak concurrency
    #[derive(Default)]
    struct FeedServer {
        feeds: Mutex<HashMap<String, (u16, String)>>,
        latency: Duration,
        requests: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl FeedServer {
        fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Self::default()
            }
        }

        fn serve(&self, url: &str, status: u16, body: String) {
            self.feeds
                .lock()
                .unwrap()
                .insert(url.to_string(), (status, body));
        }

        fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpClient for FeedServer {
        async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let answer = self.feeds.lock().unwrap().get(&request.url).cloned();

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match answer {
                Some((status, body)) => Ok(HttpResponse::new(status, body)),
                None => Ok(HttpResponse::new(404, "")),
            }
        }
    }

    /// Queue manager that refuses every write
    struct BrokenQueues;

    #[async_trait]
    impl QueueManager for BrokenQueues {
        async fn add_episodes(&self, _: &str, _: &[String]) -> Result<(), StorageError> {
            Err(StorageError::Backend("queue offline".into()))
        }

        async fn insert_episode(&self, _: &str, _: &str, _: usize) -> Result<(), StorageError> {
            Err(StorageError::Backend("queue offline".into()))
        }

        async fn get_queue(&self, _: &str) -> Result<Vec<String>, StorageError> {
            Ok(Vec::new())
        }
    }

    /// Subscription store that refuses to save one podcast
    struct RefusingStore {
        inner: Arc<MemoryStore>,
        refused_id: String,
    }

    #[async_trait]
    impl SubscriptionStore for RefusingStore {
        async fn get_all_podcasts(&self) -> Result<Vec<Podcast>, StorageError> {
            self.inner.get_all_podcasts().await
        }

        async fn get_podcast(&self, id: &str) -> Result<Option<Podcast>, StorageError> {
            self.inner.get_podcast(id).await
        }

        async fn add_podcast(&self, podcast: &Podcast) -> Result<(), StorageError> {
            self.inner.add_podcast(podcast).await
        }

        async fn update_podcast(&self, podcast: &Podcast) -> Result<(), StorageError> {
            if podcast.id == self.refused_id {
                return Err(StorageError::Backend("disk full".into()));
            }
            self.inner.update_podcast(podcast).await
        }

        async fn remove_podcast(&self, id: &str) -> Result<bool, StorageError> {
            self.inner.remove_podcast(id).await
        }
    }

    fn feed_xml(title: &str, episodes: &[(&str, u32)]) -> String {
        let items: String = episodes
            .iter()
            .map(|(guid, day)| {
                format!(
                    "<item><title>{guid}</title><guid>{guid}</guid>\
                     <pubDate>{day:02} Jan 2024 10:00:00 GMT</pubDate>\
                     <enclosure url=\"https://cdn.example.com/{guid}.mp3\" type=\"audio/mpeg\"/></item>"
                )
            })
            .collect();
        format!(
            "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>{title}</title>{items}</channel></rss>"
        )
    }

    fn feed_url(name: &str) -> String {
        format!("https://{name}.example.com/feed.xml")
    }

    fn stored_podcast(name: &str) -> Podcast {
        Podcast::new(Url::parse(&feed_url(name)).unwrap(), name)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()
    }

    struct Harness {
        server: Arc<FeedServer>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        reporter: Arc<RecordingReporter>,
        scheduler: Arc<ManualScheduler>,
    }

    impl Harness {
        fn new(server: FeedServer, podcasts: Vec<Podcast>) -> Self {
            Self {
                server: Arc::new(server),
                store: Arc::new(MemoryStore::with_podcasts(podcasts)),
                clock: Arc::new(ManualClock::new(now())),
                reporter: Arc::new(RecordingReporter::default()),
                scheduler: Arc::new(ManualScheduler::default()),
            }
        }

        fn builder(&self) -> FeedSyncManagerBuilder {
            let service = FeedService::new(self.server.clone())
                .with_clock(self.clock.clone())
                .with_retry_policy(RetryPolicy::none());
            let store = self.store.clone();
            FeedSyncManager::builder(service, store.clone(), store.clone(), store)
                .reporter(self.reporter.clone())
                .scheduler(self.scheduler.clone())
                .auto_sync_options(quick_options())
        }

        fn manager(&self) -> FeedSyncManager {
            self.builder().build()
        }

        async fn podcast(&self, name: &str) -> Podcast {
            let id = identity::podcast_id(&feed_url(name));
            self.store.get_podcast(&id).await.unwrap().unwrap()
        }
    }

    fn quick_options() -> SyncOptions {
        SyncOptions {
            batch_delay: Duration::ZERO,
            ..SyncOptions::default()
        }
    }

    fn forced() -> SyncOptions {
        SyncOptions {
            force: true,
            ..quick_options()
        }
    }

    #[tokio::test]
    async fn failing_podcast_does_not_abort_the_batch() {
        let server = FeedServer::default();
        server.serve(&feed_url("a"), 200, feed_xml("A", &[("a1", 1)]));
        server.serve(&feed_url("b"), 500, String::new());
        server.serve(&feed_url("c"), 200, feed_xml("C", &[("c1", 2)]));
        let h = Harness::new(
            server,
            vec![stored_podcast("a"), stored_podcast("b"), stored_podcast("c")],
        );

        let result = h.manager().sync_all(quick_options()).await.unwrap();

        assert_eq!(result.total, 3);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.new_episodes_count, 2);
        let order: Vec<_> = result.results.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(order, vec!["A", "b", "C"]);
        assert!(result.results[1].error.as_deref().unwrap().contains("500"));

        assert_eq!(h.podcast("a").await.episodes.len(), 1);
        assert_eq!(h.podcast("a").await.last_fetched_at, Some(now()));
        assert_eq!(h.podcast("c").await.episodes.len(), 1);
        assert_eq!(h.podcast("b").await.last_fetched_at, None);
    }

    #[tokio::test]
    async fn parse_and_storage_failures_stay_with_their_podcast() {
        let server = FeedServer::default();
        server.serve(&feed_url("a"), 200, feed_xml("A", &[("a1", 1)]));
        server.serve(&feed_url("b"), 200, "<html>maintenance</html>".to_string());
        server.serve(&feed_url("c"), 200, feed_xml("C", &[("c1", 2)]));
        server.serve(&feed_url("d"), 200, feed_xml("D", &[("d1", 3)]));
        let h = Harness::new(
            server,
            vec![
                stored_podcast("a"),
                stored_podcast("b"),
                stored_podcast("c"),
                stored_podcast("d"),
            ],
        );
        let store = Arc::new(RefusingStore {
            inner: h.store.clone(),
            refused_id: identity::podcast_id(&feed_url("c")),
        });
        let service = FeedService::new(h.server.clone())
            .with_clock(h.clock.clone())
            .with_retry_policy(RetryPolicy::none());
        let manager = FeedSyncManager::builder(service, store, h.store.clone(), h.store.clone())
            .scheduler(h.scheduler.clone())
            .build();

        let result = manager.sync_all(quick_options()).await.unwrap();

        assert_eq!(result.total, 4);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failure_count, 2);
        assert_eq!(result.new_episodes_count, 2);
        let outcomes: Vec<_> = result.results.iter().map(|r| r.success).collect();
        assert_eq!(outcomes, vec![true, false, false, true]);
        assert!(result.results[1].error.as_deref().unwrap().contains("parse"));
        assert!(result.results[2].error.as_deref().unwrap().contains("disk full"));

        assert_eq!(h.podcast("a").await.episodes.len(), 1);
        assert_eq!(h.podcast("d").await.episodes.len(), 1);
        assert_eq!(h.podcast("b").await.last_fetched_at, None);
        assert_eq!(h.podcast("c").await.last_fetched_at, None);
        assert!(!manager.get_sync_status().is_syncing);
    }

    #[tokio::test]
    async fn merges_new_episodes_newest_first() {
        let server = FeedServer::default();
        server.serve(&feed_url("a"), 200, feed_xml("A", &[("ep-old", 1), ("ep-new", 8)]));
        let mut stored = stored_podcast("a");
        stored.episodes = crate::feed::parse_feed(
            feed_xml("A", &[("ep-old", 1)]).as_bytes(),
            &stored.feed_url,
        )
        .unwrap()
        .episodes;
        let h = Harness::new(server, vec![stored]);

        let result = h.manager().sync_all(quick_options()).await.unwrap();

        assert_eq!(result.results[0].new_episodes_count, 1);
        let podcast = h.podcast("a").await;
        let guids: Vec<_> = podcast.episodes.iter().filter_map(|e| e.guid.as_deref()).collect();
        assert_eq!(guids, vec!["ep-new", "ep-old"]);
        assert_eq!(podcast.title, "A");
    }

    #[tokio::test]
    async fn second_sync_while_running_is_rejected() {
        let server = FeedServer::default();
        server.serve(&feed_url("a"), 200, feed_xml("A", &[("a1", 1)]));
        let h = Harness::new(server, vec![stored_podcast("a")]);
        let manager = h.manager();

        let (first, second) = tokio::join!(manager.sync_all(forced()), manager.sync_all(forced()));

        assert!(first.is_ok());
        assert!(matches!(second, Err(SyncError::AlreadySyncing)));
        assert!(matches!(
            manager.sync_podcast("anything").await,
            Err(SyncError::UnknownPodcast(_))
        ));
        assert!(!manager.get_sync_status().is_syncing);
        assert!(manager.sync_all(forced()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_caller_does_not_cancel_the_batch() {
        let server = FeedServer::with_latency(Duration::from_secs(1));
        server.serve(&feed_url("a"), 200, feed_xml("A", &[("a1", 1)]));
        let h = Harness::new(server, vec![stored_podcast("a")]);
        let manager = h.manager();

        {
            let run = manager.sync_all(forced());
            tokio::pin!(run);
            assert!(futures::poll!(&mut run).is_pending());
        }
        assert!(manager.get_sync_status().is_syncing);

        while manager.get_sync_status().is_syncing {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(h.podcast("a").await.episodes.len(), 1);
    }

    #[tokio::test]
    async fn only_due_podcasts_are_synced_unless_forced() {
        let server = FeedServer::default();
        for name in ["fresh", "stale", "never"] {
            server.serve(&feed_url(name), 200, feed_xml(name, &[]));
        }
        let mut fresh = stored_podcast("fresh");
        fresh.last_fetched_at = Some(now() - chrono::Duration::minutes(30));
        let mut stale = stored_podcast("stale");
        stale.last_fetched_at = Some(now() - chrono::Duration::hours(2));
        let h = Harness::new(server, vec![fresh, stale, stored_podcast("never")]);
        let manager = h.manager();

        let due = manager.sync_all(quick_options()).await.unwrap();
        let ids: Vec<_> = due.results.iter().map(|r| r.podcast_id.clone()).collect();
        assert_eq!(
            ids,
            vec![
                identity::podcast_id(&feed_url("stale")),
                identity::podcast_id(&feed_url("never")),
            ]
        );

        let all = manager.sync_all(forced()).await.unwrap();
        assert_eq!(all.total, 3);
    }

    #[tokio::test]
    async fn sync_podcasts_skips_unknown_ids_and_keeps_request_order() {
        let server = FeedServer::default();
        server.serve(&feed_url("a"), 200, feed_xml("A", &[]));
        server.serve(&feed_url("b"), 200, feed_xml("B", &[]));
        let h = Harness::new(server, vec![stored_podcast("a"), stored_podcast("b")]);
        let a = identity::podcast_id(&feed_url("a"));
        let b = identity::podcast_id(&feed_url("b"));

        let result = h
            .manager()
            .sync_podcasts(
                &[b.clone(), "podcast-missing".to_string(), a.clone(), b.clone()],
                forced(),
            )
            .await
            .unwrap();

        assert_eq!(result.total, 2);
        assert_eq!(result.failure_count, 0);
        let ids: Vec<_> = result.results.iter().map(|r| r.podcast_id.clone()).collect();
        assert_eq!(ids, vec![b, a]);
    }

    #[tokio::test]
    async fn sync_podcast_forces_a_single_refresh() {
        let server = FeedServer::default();
        server.serve(&feed_url("a"), 200, feed_xml("A", &[("a1", 1)]));
        let mut podcast = stored_podcast("a");
        podcast.last_fetched_at = Some(now());
        let h = Harness::new(server, vec![podcast.clone()]);

        let result = h.manager().sync_podcast(&podcast.id).await.unwrap();

        assert!(result.success);
        assert_eq!(result.new_episodes_count, 1);
        assert_eq!(h.server.requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_bounded_and_sequenced() {
        let server = FeedServer::with_latency(Duration::from_secs(2));
        let names = ["p1", "p2", "p3", "p4", "p5"];
        for name in names {
            server.serve(&feed_url(name), 200, feed_xml(name, &[]));
        }
        let h = Harness::new(server, names.iter().map(|n| stored_podcast(n)).collect());
        let options = SyncOptions {
            concurrency: 2,
            batch_delay: Duration::from_secs(1),
            ..forced()
        };

        let started = tokio::time::Instant::now();
        let result = h.manager().sync_all(options).await.unwrap();

        assert_eq!(result.success_count, 5);
        assert_eq!(h.server.peak_in_flight.load(Ordering::SeqCst), 2);
        // Three batches of 2s each plus two pauses
        assert!(started.elapsed() >= Duration::from_secs(8));
    }

    #[tokio::test]
    async fn zero_concurrency_still_makes_progress() {
        let server = FeedServer::default();
        server.serve(&feed_url("a"), 200, feed_xml("A", &[]));
        let h = Harness::new(server, vec![stored_podcast("a")]);

        let options = SyncOptions {
            concurrency: 0,
            ..forced()
        };
        let result = h.manager().sync_all(options).await.unwrap();

        assert_eq!(result.success_count, 1);
    }

    #[tokio::test]
    async fn auto_add_routes_new_episodes_to_the_top_of_a_queue() {
        let server = FeedServer::default();
        server.serve(&feed_url("a"), 200, feed_xml("A", &[("n2", 9), ("n1", 8)]));
        let mut podcast = stored_podcast("a");
        podcast.auto_add_rule = Some(AutoAddRule {
            enabled: true,
            target_type: TargetType::Queue,
            target_id: "default".to_string(),
            position: InsertPosition::Top,
        });
        let h = Harness::new(server, vec![podcast]);
        QueueManager::add_episodes(h.store.as_ref(), "default", &["queued".to_string()])
            .await
            .unwrap();

        h.manager().sync_all(forced()).await.unwrap();

        let expected = vec![
            identity::episode_id(Some("n2"), ""),
            identity::episode_id(Some("n1"), ""),
            "queued".to_string(),
        ];
        assert_eq!(h.store.get_queue("default").await.unwrap(), expected);
        assert!(h.reporter.events().iter().any(|e| matches!(
            e,
            SyncEvent::EpisodesAutoAdded { count: 2, target: TargetType::Queue, .. }
        )));
    }

    #[tokio::test]
    async fn auto_add_failure_does_not_fail_the_podcast() {
        let server = FeedServer::default();
        server.serve(&feed_url("a"), 200, feed_xml("A", &[("n1", 8)]));
        let mut podcast = stored_podcast("a");
        podcast.auto_add_rule = Some(AutoAddRule {
            enabled: true,
            target_type: TargetType::Queue,
            target_id: "default".to_string(),
            position: InsertPosition::Bottom,
        });
        let h = Harness::new(server, vec![podcast]);
        let service = FeedService::new(h.server.clone()).with_retry_policy(RetryPolicy::none());
        let manager = FeedSyncManager::builder(
            service,
            h.store.clone(),
            Arc::new(BrokenQueues),
            h.store.clone(),
        )
        .build();

        let result = manager.sync_all(forced()).await.unwrap();

        assert_eq!(result.success_count, 1);
        let podcast_result = &result.results[0];
        assert!(podcast_result.success);
        assert!(podcast_result.auto_add_error.as_deref().unwrap().contains("queue offline"));
        assert_eq!(h.podcast("a").await.episodes.len(), 1);
    }

    #[tokio::test]
    async fn reports_progress_in_order() {
        let server = FeedServer::default();
        server.serve(&feed_url("a"), 200, feed_xml("A", &[("a1", 1)]));
        let h = Harness::new(server, vec![stored_podcast("a"), stored_podcast("b")]);
        let a = identity::podcast_id(&feed_url("a"));
        let b = identity::podcast_id(&feed_url("b"));

        h.manager().sync_all(SyncOptions { concurrency: 1, ..forced() }).await.unwrap();

        let events = h.reporter.events();
        assert_eq!(events.first(), Some(&SyncEvent::SyncStarted { total: 2 }));
        assert_eq!(
            events[1],
            SyncEvent::PodcastSyncing { podcast_id: a.clone(), title: "a".to_string() }
        );
        assert_eq!(
            events[2],
            SyncEvent::PodcastSynced { podcast_id: a, title: "A".to_string(), new_episodes: 1 }
        );
        assert!(matches!(
            &events[4],
            SyncEvent::PodcastFailed { podcast_id, .. } if *podcast_id == b
        ));
        assert_eq!(
            events.last(),
            Some(&SyncEvent::SyncCompleted { success_count: 1, failure_count: 1, new_episodes: 1 })
        );
    }

    #[tokio::test]
    async fn auto_sync_runs_immediately_and_on_every_tick() {
        let server = FeedServer::default();
        server.serve(&feed_url("a"), 200, feed_xml("A", &[]));
        let h = Harness::new(server, vec![stored_podcast("a")]);
        let manager = h.builder().sync_interval(Duration::from_secs(600)).build();

        manager.start_auto_sync().await;
        manager.start_auto_sync().await;

        assert_eq!(h.server.requests(), 1);
        assert_eq!(h.scheduler.active_periods(), vec![Duration::from_secs(600)]);
        let status = manager.get_sync_status();
        assert!(status.auto_sync_enabled);
        assert_eq!(status.last_sync_time, Some(now()));

        // Non-forced: the podcast is only due again once the interval passed
        h.scheduler.fire().await;
        assert_eq!(h.server.requests(), 1);
        h.clock.advance(chrono::Duration::hours(2));
        h.scheduler.fire().await;
        assert_eq!(h.server.requests(), 2);

        manager.stop_auto_sync();
        manager.stop_auto_sync();
        assert!(h.scheduler.active_periods().is_empty());
        assert!(!manager.get_sync_status().auto_sync_enabled);
    }

    #[tokio::test]
    async fn changing_interval_restarts_a_running_timer() {
        let server = FeedServer::default();
        server.serve(&feed_url("a"), 200, feed_xml("A", &[]));
        let h = Harness::new(server, vec![stored_podcast("a")]);
        let manager = h.manager();

        manager.set_sync_interval(Duration::from_secs(120)).await;
        assert!(h.scheduler.active_periods().is_empty());
        assert_eq!(h.server.requests(), 0);

        manager.start_auto_sync().await;
        h.clock.advance(chrono::Duration::hours(2));
        manager.set_sync_interval(Duration::from_secs(300)).await;

        assert_eq!(h.scheduler.active_periods(), vec![Duration::from_secs(300)]);
        assert_eq!(h.server.requests(), 2);
        assert_eq!(manager.get_sync_status().sync_interval, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn dropping_the_manager_stops_its_timer() {
        let h = Harness::new(FeedServer::default(), vec![]);
        let manager = h.manager();
        manager.start_auto_sync().await;
        assert_eq!(h.scheduler.active_periods().len(), 1);

        drop(manager);

        assert!(h.scheduler.active_periods().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_removes_podcast_unless_syncing() {
        let server = FeedServer::default();
        server.serve(&feed_url("a"), 200, feed_xml("A", &[]));
        let h = Harness::new(server, vec![stored_podcast("a")]);
        let manager = h.manager();
        let id = identity::podcast_id(&feed_url("a"));

        let (sync, refused) = tokio::join!(manager.sync_all(forced()), manager.unsubscribe(&id));
        assert!(sync.is_ok());
        assert!(matches!(refused, Err(SyncError::AlreadySyncing)));

        assert!(manager.unsubscribe(&id).await.unwrap());
        assert!(!manager.unsubscribe(&id).await.unwrap());
        assert!(h.store.get_all_podcasts().await.unwrap().is_empty());
    }
}
