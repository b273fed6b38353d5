// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use chrono::Duration;
use url::Url;

use crate::cache::{DEFAULT_CACHE_TTL, FeedCache};
use crate::clock::{SharedClock, SystemClock};
use crate::error::{FeedError, SubscribeError};
use crate::feed::{ParsedFeed, parse_feed};
use crate::fetcher::{FeedFetcher, FetchOptions, Origin, RetryPolicy, validate_feed_url};
use crate::http::HttpClient;
use crate::identity;
use crate::model::{Episode, Podcast};
use crate::store::SubscriptionStore;
use crate::sync::merge::{find_new_episodes, merge_episodes};

/// Result of refreshing one subscribed podcast against its live feed
#[derive(Debug, Clone)]
pub struct UpdatedFeed {
    /// Metadata as published by the feed right now
    pub podcast: Podcast,
    /// Every episode in the feed, in feed order
    pub episodes: Vec<Episode>,
    /// Episodes whose id the stored podcast does not know yet
    pub new_episodes: Vec<Episode>,
}

/// Fetch, parse and cache orchestration for feeds
#[derive(Clone)]
pub struct FeedService {
    fetcher: FeedFetcher,
    clock: SharedClock,
    cache_ttl: Duration,
}

impl FeedService {
    /// A service without a cache
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self {
            fetcher: FeedFetcher::new(client),
            clock: SystemClock::shared(),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_cache(mut self, cache: FeedCache) -> Self {
        self.fetcher = self.fetcher.with_cache(cache);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.fetcher = self.fetcher.with_retry_policy(retry);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Clock used to stamp `subscribed_at` and `last_fetched_at`
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn cache(&self) -> Option<&FeedCache> {
        self.fetcher.cache()
    }

    pub fn validate_feed_url(&self, url: &str) -> bool {
        validate_feed_url(url)
    }

    /// Fetch and parse the feed at `url`.
    ///
    /// Documents fetched or revalidated over the network are written back to
    /// the cache once they parse; cache trouble never fails the call.
    pub async fn fetch_feed(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> Result<ParsedFeed, FeedError> {
        let feed_url = Url::parse(url.trim()).map_err(|_| FeedError::InvalidUrl {
            url: url.to_string(),
        })?;

        let document = self.fetcher.fetch(feed_url.as_str(), options).await?;
        let parsed = parse_feed(document.body.as_bytes(), &feed_url)?;

        let fetched = matches!(document.origin, Origin::Network | Origin::Revalidated);
        if let Some(cache) = self.cache()
            && fetched
        {
            cache
                .set(
                    feed_url.as_str(),
                    &document.body,
                    self.cache_ttl,
                    document.validators,
                )
                .await;
        }

        tracing::debug!(
            url = %feed_url,
            episodes = parsed.episodes.len(),
            origin = ?document.origin,
            "Parsed feed"
        );
        Ok(parsed)
    }

    /// Fetch the live feed of a stored podcast, bypassing the cache, and work
    /// out which episodes are new to it
    pub async fn update_feed(&self, podcast: &Podcast) -> Result<UpdatedFeed, FeedError> {
        let options = FetchOptions {
            use_cache: false,
            ..FetchOptions::default()
        };
        let parsed = self.fetch_feed(podcast.feed_url.as_str(), &options).await?;
        let new_episodes = find_new_episodes(&parsed.episodes, &podcast.episodes);

        Ok(UpdatedFeed {
            podcast: parsed.podcast,
            episodes: parsed.episodes,
            new_episodes,
        })
    }

    /// Drop one cached document, or all of them. Without a cache this does nothing.
    pub async fn clear_cache(&self, url: Option<&str>) {
        let Some(cache) = self.cache() else {
            return;
        };

        let result = match url {
            Some(url) => cache.remove(&cache_key(url)).await,
            None => cache.clear().await,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to clear feed cache");
        }
    }

    /// Subscribe to the feed at `url` and persist it with its episodes
    pub async fn subscribe(
        &self,
        store: &dyn SubscriptionStore,
        url: &str,
    ) -> Result<Podcast, SubscribeError> {
        if !self.validate_feed_url(url) {
            return Err(SubscribeError::InvalidUrl(url.to_string()));
        }
        let feed_url =
            Url::parse(url.trim()).map_err(|_| SubscribeError::InvalidUrl(url.to_string()))?;

        let id = identity::podcast_id(feed_url.as_str());
        if store.get_podcast(&id).await?.is_some() {
            return Err(SubscribeError::AlreadySubscribed(feed_url.to_string()));
        }

        let parsed = self.fetch_feed(feed_url.as_str(), &FetchOptions::default()).await?;

        let now = self.clock.now();
        let mut podcast = parsed.podcast;
        podcast.episodes = merge_episodes(&parsed.episodes, &[]);
        podcast.subscribed_at = Some(now);
        podcast.last_fetched_at = Some(now);

        store.add_podcast(&podcast).await?;
        tracing::info!(
            podcast_id = %podcast.id,
            title = %podcast.title,
            episodes = podcast.episodes.len(),
            "Subscribed to podcast"
        );
        Ok(podcast)
    }
}

/// Documents are cached under the parsed URL, as `fetch_feed` requests them
fn cache_key(url: &str) -> String {
    let url = url.trim();
    Url::parse(url)
        .map(String::from)
        .unwrap_or_else(|_| url.to_string())
}
