// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod cache;
pub mod clock;
pub mod error;
pub mod feed;
pub mod fetcher;
pub mod http;
pub mod identity;
pub mod model;
pub mod progress;
pub mod service;
pub mod store;
pub mod sync;

// Re-export main types for convenience
pub use cache::{CacheEntry, CacheStats, FeedCache, FileBackend, MemoryBackend};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{FeedError, StorageError, SubscribeError, SyncError, TransportError};
pub use feed::{FeedFormat, ParsedFeed, detect_format, parse_feed};
pub use fetcher::{FeedFetcher, FetchOptions, RetryPolicy, validate_feed_url};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
pub use model::{AutoAddRule, Episode, EpisodeType, InsertPosition, Podcast, TargetType};
pub use progress::{NoopReporter, ProgressReporter, SharedProgressReporter, SyncEvent};
pub use service::{FeedService, UpdatedFeed};
pub use store::{JsonStore, MemoryStore, PlaylistManager, QueueManager, SubscriptionStore};
pub use sync::{
    BatchSyncResult, DEFAULT_SYNC_INTERVAL, FeedSyncManager, SyncOptions, SyncResult, SyncStatus,
    TokioScheduler,
};
