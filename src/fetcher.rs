// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::cache::{FeedCache, Lookup, Validators};
use crate::error::{FeedError, TransportError};
use crate::http::{HttpClient, HttpRequest, HttpResponse, STATUS_NOT_MODIFIED};

/// Per-request fetch settings
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Serve fresh cached documents without touching the network
    pub use_cache: bool,
    pub timeout: Duration,
    pub user_agent: String,
    /// Overrides the cached ETag for `If-None-Match`
    pub etag: Option<String>,
    /// Overrides the cached Last-Modified for `If-Modified-Since`
    pub last_modified: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            timeout: Duration::from_secs(30),
            user_agent: format!("podsync/{}", env!("CARGO_PKG_VERSION")),
            etag: None,
            last_modified: None,
        }
    }
}

/// Bounded exponential backoff for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based): base * 2^retry, capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Where a fetched document came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Fresh cache entry, no request made
    Cache,
    /// 2xx response body
    Network,
    /// Stale cache entry confirmed by a 304
    Revalidated,
}

/// A raw feed document plus the validators to store with it
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub body: String,
    pub validators: Validators,
    pub origin: Origin,
}

/// Accepts only parseable `http` and `https` URLs
pub fn validate_feed_url(url: &str) -> bool {
    Url::parse(url.trim())
        .map(|parsed| matches!(parsed.scheme(), "http" | "https") && parsed.host().is_some())
        .unwrap_or(false)
}

/// Conditional, cache-aware GET of feed documents
#[derive(Clone)]
pub struct FeedFetcher {
    client: Arc<dyn HttpClient>,
    cache: Option<FeedCache>,
    retry: RetryPolicy,
}

enum Answer {
    Body(String, Validators),
    NotModified,
}

impl FeedFetcher {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self {
            client,
            cache: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_cache(mut self, cache: FeedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cache(&self) -> Option<&FeedCache> {
        self.cache.as_ref()
    }

    /// Fetch the document at `url`.
    ///
    /// A fresh cache entry is returned as-is when `use_cache` is set. A stale
    /// one lends its validators to the request and is reused on a 304.
    pub async fn fetch(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> Result<FetchedDocument, FeedError> {
        if !validate_feed_url(url) {
            return Err(FeedError::InvalidUrl {
                url: url.to_string(),
            });
        }

        let mut validators = Validators {
            etag: options.etag.clone(),
            last_modified: options.last_modified.clone(),
        };
        let mut stale = None;

        if options.use_cache
            && let Some(cache) = &self.cache
        {
            match cache.lookup(url).await {
                Lookup::Fresh(entry) => {
                    tracing::debug!(url = %url, "Serving feed from cache");
                    return Ok(FetchedDocument {
                        validators: entry.validators(),
                        body: entry.data,
                        origin: Origin::Cache,
                    });
                }
                Lookup::Stale(entry) => {
                    if validators.is_empty() {
                        validators = entry.validators();
                    }
                    stale = Some(entry);
                }
                Lookup::Miss => {}
            }
        }

        match self.get_with_retry(url, options, &validators).await? {
            Answer::Body(body, fresh_validators) => Ok(FetchedDocument {
                body,
                validators: fresh_validators,
                origin: Origin::Network,
            }),
            Answer::NotModified => match stale {
                Some(entry) => {
                    tracing::debug!(url = %url, "Feed not modified, reusing cached document");
                    Ok(FetchedDocument {
                        validators,
                        body: entry.data,
                        origin: Origin::Revalidated,
                    })
                }
                None => Err(FeedError::NotModified {
                    url: url.to_string(),
                }),
            },
        }
    }

    async fn get_with_retry(
        &self,
        url: &str,
        options: &FetchOptions,
        validators: &Validators,
    ) -> Result<Answer, FeedError> {
        let request = build_request(url, options, validators);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut retry = 0;

        loop {
            match self.get_once(&request).await {
                Ok(answer) => return Ok(answer),
                Err(e) if e.is_retryable() && retry + 1 < max_attempts => {
                    let delay = self.retry.delay_for(retry);
                    tracing::warn!(
                        url = %url,
                        retry = retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Feed fetch failed, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(&self, request: &HttpRequest) -> Result<Answer, FeedError> {
        let response = tokio::time::timeout(request.timeout, self.client.get(request))
            .await
            .unwrap_or(Err(TransportError::Timeout))
            .map_err(|source| FeedError::Network {
                url: request.url.clone(),
                source,
            })?;

        classify(&request.url, response)
    }
}

fn build_request(url: &str, options: &FetchOptions, validators: &Validators) -> HttpRequest {
    let mut request = HttpRequest::get(url, options.timeout)
        .header("User-Agent", options.user_agent.clone())
        .header(
            "Accept",
            "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5",
        );
    if let Some(etag) = &validators.etag {
        request = request.header("If-None-Match", etag.clone());
    }
    if let Some(last_modified) = &validators.last_modified {
        request = request.header("If-Modified-Since", last_modified.clone());
    }
    request
}

fn classify(url: &str, response: HttpResponse) -> Result<Answer, FeedError> {
    match response.status {
        STATUS_NOT_MODIFIED => Ok(Answer::NotModified),
        200..=299 => {
            let validators = Validators {
                etag: response.header("etag").map(str::to_string),
                last_modified: response.header("last-modified").map(str::to_string),
            };
            let body = String::from_utf8_lossy(&response.body).into_owned();
            Ok(Answer::Body(body, validators))
        }
        status => Err(FeedError::HttpStatus {
            url: url.to_string(),
            status,
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::DEFAULT_CACHE_TTL;
    use crate::clock::ManualClock;
    use crate::cache::MemoryBackend;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) const URL: &str = "https://example.com/feed.xml";

    /// Replays canned answers in order and records every request
    #[derive(Default)]
    pub(crate) struct ScriptedClient {
        answers: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        pub(crate) requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedClient {
        pub(crate) fn new(answers: Vec<Result<HttpResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub(crate) fn last_request(&self) -> HttpRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Request("no scripted answer".into())))
        }
    }

    struct HangingClient;

    #[async_trait]
    impl HttpClient for HangingClient {
        async fn get(&self, _request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            std::future::pending().await
        }
    }

    fn ok(body: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse::new(200, body.to_string()))
    }

    fn status(code: u16) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse::new(code, ""))
    }

    fn test_cache() -> (FeedCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        (
            FeedCache::with_clock(Arc::new(MemoryBackend::new()), clock.clone()),
            clock,
        )
    }

    #[test]
    fn validate_feed_url_accepts_only_http_schemes() {
        assert!(validate_feed_url("http://example.com/feed.xml"));
        assert!(validate_feed_url("https://example.com/feed.xml"));
        assert!(!validate_feed_url("ftp://example.com/feed.xml"));
        assert!(!validate_feed_url("file:///tmp/feed.xml"));
        assert!(!validate_feed_url("/path/to/feed.xml"));
        assert!(!validate_feed_url("not a url"));
    }

    #[test]
    fn retry_delays_grow_and_are_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn invalid_url_never_reaches_the_network() {
        let client = ScriptedClient::new(vec![]);
        let fetcher = FeedFetcher::new(client.clone());

        let err = fetcher
            .fetch("ftp://example.com/feed", &FetchOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, FeedError::InvalidUrl { .. }));
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn returns_body_and_response_validators() {
        let client = ScriptedClient::new(vec![Ok(HttpResponse::new(200, "<rss/>")
            .with_header("ETag", "\"v1\"")
            .with_header("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT"))]);
        let fetcher = FeedFetcher::new(client.clone());

        let doc = fetcher.fetch(URL, &FetchOptions::default()).await.unwrap();

        assert_eq!(doc.body, "<rss/>");
        assert_eq!(doc.origin, Origin::Network);
        assert_eq!(doc.validators.etag.as_deref(), Some("\"v1\""));
        assert!(client.last_request().header_value("user-agent").is_some());
    }

    #[tokio::test]
    async fn fresh_cache_entry_skips_the_network() {
        let (cache, _clock) = test_cache();
        cache.set(URL, "<rss/>", DEFAULT_CACHE_TTL, Validators::default()).await;
        let client = ScriptedClient::new(vec![]);
        let fetcher = FeedFetcher::new(client.clone()).with_cache(cache);

        let doc = fetcher.fetch(URL, &FetchOptions::default()).await.unwrap();

        assert_eq!(doc.origin, Origin::Cache);
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn bypassing_cache_always_fetches() {
        let (cache, _clock) = test_cache();
        cache.set(URL, "<old/>", DEFAULT_CACHE_TTL, Validators::default()).await;
        let client = ScriptedClient::new(vec![ok("<new/>")]);
        let fetcher = FeedFetcher::new(client.clone()).with_cache(cache);

        let options = FetchOptions {
            use_cache: false,
            ..FetchOptions::default()
        };
        let doc = fetcher.fetch(URL, &options).await.unwrap();

        assert_eq!(doc.body, "<new/>");
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test]
    async fn stale_entry_revalidates_with_conditional_headers() {
        let (cache, clock) = test_cache();
        cache
            .set(
                URL,
                "<cached/>",
                DEFAULT_CACHE_TTL,
                Validators {
                    etag: Some("\"v1\"".into()),
                    last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".into()),
                },
            )
            .await;
        clock.advance(chrono::Duration::hours(2));

        let client = ScriptedClient::new(vec![status(304)]);
        let fetcher = FeedFetcher::new(client.clone()).with_cache(cache);

        let doc = fetcher.fetch(URL, &FetchOptions::default()).await.unwrap();

        assert_eq!(doc.origin, Origin::Revalidated);
        assert_eq!(doc.body, "<cached/>");
        let request = client.last_request();
        assert_eq!(request.header_value("if-none-match"), Some("\"v1\""));
        assert_eq!(
            request.header_value("if-modified-since"),
            Some("Mon, 01 Jan 2024 00:00:00 GMT")
        );
    }

    #[tokio::test]
    async fn caller_validators_override_cached_ones() {
        let client = ScriptedClient::new(vec![status(304)]);
        let fetcher = FeedFetcher::new(client.clone());

        let options = FetchOptions {
            etag: Some("\"caller\"".into()),
            ..FetchOptions::default()
        };
        let err = fetcher.fetch(URL, &options).await.unwrap_err();

        assert!(err.is_not_modified());
        assert_eq!(client.last_request().header_value("if-none-match"), Some("\"caller\""));
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_are_retried_then_surface() {
        let client = ScriptedClient::new(vec![status(500), status(502), status(503)]);
        let fetcher = FeedFetcher::new(client.clone());

        let err = fetcher.fetch(URL, &FetchOptions::default()).await.unwrap_err();

        assert!(matches!(err, FeedError::HttpStatus { status: 503, .. }));
        assert_eq!(client.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_success() {
        let client = ScriptedClient::new(vec![
            Err(TransportError::Connect("refused".into())),
            status(503),
            ok("<rss/>"),
        ]);
        let fetcher = FeedFetcher::new(client.clone());

        let doc = fetcher.fetch(URL, &FetchOptions::default()).await.unwrap();

        assert_eq!(doc.body, "<rss/>");
        assert_eq!(client.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let client = ScriptedClient::new(vec![status(404), ok("<rss/>")]);
        let fetcher = FeedFetcher::new(client.clone());

        let err = fetcher.fetch(URL, &FetchOptions::default()).await.unwrap_err();

        assert!(matches!(err, FeedError::HttpStatus { status: 404, .. }));
        assert_eq!(err.url(), URL);
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_request_times_out_as_network_error() {
        let fetcher =
            FeedFetcher::new(Arc::new(HangingClient)).with_retry_policy(RetryPolicy::none());
        let options = FetchOptions {
            timeout: Duration::from_secs(5),
            ..FetchOptions::default()
        };

        let err = fetcher.fetch(URL, &options).await.unwrap_err();

        assert!(matches!(
            err,
            FeedError::Network {
                source: TransportError::Timeout,
                ..
            }
        ));
    }
}
