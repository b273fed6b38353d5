// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::identity;

/// A subscribed (or freshly fetched) podcast and its episodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Podcast {
    /// Derived from `feed_url`; see [`identity::podcast_id`]
    pub id: String,
    pub feed_url: Url,
    pub title: String,
    pub author: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// Newest first
    #[serde(default)]
    pub episodes: Vec<Episode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<PlaybackSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_add_rule: Option<AutoAddRule>,
}

impl Podcast {
    /// Create an empty podcast record for a feed URL
    pub fn new(feed_url: Url, title: impl Into<String>) -> Self {
        Self {
            id: identity::podcast_id(feed_url.as_str()),
            feed_url,
            title: title.into(),
            author: String::new(),
            description: String::new(),
            image_url: None,
            website_url: None,
            categories: Vec::new(),
            language: None,
            subscribed_at: None,
            last_fetched_at: None,
            episodes: Vec::new(),
            settings: None,
            auto_add_rule: None,
        }
    }

    /// Copy feed-provided metadata from a fresh fetch, keeping identity,
    /// subscription state and user preferences untouched
    pub fn refresh_metadata(&mut self, fetched: &Podcast) {
        self.title = fetched.title.clone();
        self.author = fetched.author.clone();
        self.description = fetched.description.clone();
        self.image_url = fetched.image_url.clone();
        self.website_url = fetched.website_url.clone();
        self.categories = fetched.categories.clone();
        self.language = fetched.language.clone();
    }

    /// The auto-add rule, if one is attached and switched on
    pub fn active_auto_add_rule(&self) -> Option<&AutoAddRule> {
        self.auto_add_rule.as_ref().filter(|rule| rule.enabled)
    }
}

/// A single episode of a podcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Derived from the GUID or audio URL; see [`identity::episode_id`]
    pub id: String,
    pub podcast_id: String,
    pub title: String,
    pub description: String,
    pub audio_url: Url,
    /// Seconds, 0 when the feed gave nothing usable
    pub duration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_type: Option<EpisodeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    Full,
    Trailer,
    Bonus,
}

impl EpisodeType {
    /// Accepts `full`, `trailer` or `bonus` in any case; anything else is ignored
    pub fn from_feed_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "full" => Some(EpisodeType::Full),
            "trailer" => Some(EpisodeType::Trailer),
            "bonus" => Some(EpisodeType::Bonus),
            _ => None,
        }
    }
}

/// Per-podcast overrides of the global playback settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_speed: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_intro_secs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_outro_secs: Option<u32>,
}

/// Routes newly discovered episodes into a queue or playlist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoAddRule {
    pub enabled: bool,
    pub target_type: TargetType,
    pub target_id: String,
    pub position: InsertPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Queue,
    Playlist,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetType::Queue => f.write_str("queue"),
            TargetType::Playlist => f.write_str("playlist"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertPosition {
    Top,
    Bottom,
}
