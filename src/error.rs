// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by an [`HttpClient`](crate::http::HttpClient) transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// Errors that can occur when fetching or parsing a podcast feed
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Invalid feed URL: {url}")]
    InvalidUrl { url: String },

    #[error("Failed to fetch feed from {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    /// The server answered 304 and there is no cached body to reuse
    #[error("Feed at {url} has not been modified")]
    NotModified { url: String },

    #[error("Failed to parse feed from {url}: {reason}")]
    Parse { url: String, reason: String },
}

impl FeedError {
    pub fn parse(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        FeedError::Parse {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// The feed URL this error concerns
    pub fn url(&self) -> &str {
        match self {
            FeedError::InvalidUrl { url }
            | FeedError::Network { url, .. }
            | FeedError::HttpStatus { url, .. }
            | FeedError::NotModified { url }
            | FeedError::Parse { url, .. } => url,
        }
    }

    /// Transport failures and 5xx responses are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::Network { .. } => true,
            FeedError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_not_modified(&self) -> bool {
        matches!(self, FeedError::NotModified { .. })
    }

    pub fn is_network(&self) -> bool {
        matches!(
            self,
            FeedError::Network { .. } | FeedError::HttpStatus { .. }
        )
    }
}

/// Errors raised by cache backends and subscription stores
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Stored record {key} is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Errors returned by the sync manager
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync already in progress")]
    AlreadySyncing,

    #[error("Unknown podcast: {0}")]
    UnknownPodcast(String),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sync task failed: {0}")]
    TaskFailed(String),
}

/// Errors returned when subscribing to a new feed
#[derive(Error, Debug)]
pub enum SubscribeError {
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),

    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SubscribeError {
    /// Message suitable for showing to a user without inspecting the variant
    pub fn user_message(&self) -> String {
        match self {
            SubscribeError::InvalidUrl(_) => {
                "Invalid URL. Please enter a valid http or https feed address.".to_string()
            }
            SubscribeError::AlreadySubscribed(_) => {
                "You are already subscribed to this podcast.".to_string()
            }
            SubscribeError::Feed(FeedError::InvalidUrl { .. }) => {
                "Invalid URL. Please enter a valid http or https feed address.".to_string()
            }
            SubscribeError::Feed(FeedError::Parse { .. }) => {
                "Parse failure: the address did not return a valid podcast feed.".to_string()
            }
            SubscribeError::Feed(err) => {
                format!("Network failure: could not download the feed ({err}).")
            }
            SubscribeError::Storage(err) => format!("Could not save the subscription ({err})."),
        }
    }
}
