// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistence seams consumed by the sync engine.
//!
//! The engine only needs whole-record reads and writes of podcasts plus a
//! handful of list operations on queues and playlists. Each call must be
//! atomic on its own; nothing here offers transactions.

mod json;

pub use json::JsonStore;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::Podcast;

/// Subscribed podcasts, each stored together with its episode list
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// All subscriptions in a stable order
    async fn get_all_podcasts(&self) -> Result<Vec<Podcast>, StorageError>;

    async fn get_podcast(&self, id: &str) -> Result<Option<Podcast>, StorageError>;

    /// Insert or replace a subscription
    async fn add_podcast(&self, podcast: &Podcast) -> Result<(), StorageError>;

    /// Replace an existing subscription; `NotFound` if it is gone
    async fn update_podcast(&self, podcast: &Podcast) -> Result<(), StorageError>;

    /// Returns whether anything was removed
    async fn remove_podcast(&self, id: &str) -> Result<bool, StorageError>;
}

/// Ordered episode queues, addressed by id and created on first use
#[async_trait]
pub trait QueueManager: Send + Sync {
    /// Append episodes that are not queued yet
    async fn add_episodes(&self, queue_id: &str, episode_ids: &[String])
    -> Result<(), StorageError>;

    /// Insert at `index` (clamped to the length); already queued ids are left alone
    async fn insert_episode(
        &self,
        queue_id: &str,
        episode_id: &str,
        index: usize,
    ) -> Result<(), StorageError>;

    async fn get_queue(&self, queue_id: &str) -> Result<Vec<String>, StorageError>;
}

/// Ordered playlists with the same list semantics as queues
#[async_trait]
pub trait PlaylistManager: Send + Sync {
    async fn add_episodes(
        &self,
        playlist_id: &str,
        episode_ids: &[String],
    ) -> Result<(), StorageError>;

    async fn insert_episode(
        &self,
        playlist_id: &str,
        episode_id: &str,
        index: usize,
    ) -> Result<(), StorageError>;

    async fn get_playlist(&self, playlist_id: &str) -> Result<Vec<String>, StorageError>;
}

pub type SharedSubscriptionStore = Arc<dyn SubscriptionStore>;
pub type SharedQueueManager = Arc<dyn QueueManager>;
pub type SharedPlaylistManager = Arc<dyn PlaylistManager>;

fn append_unique(list: &mut Vec<String>, episode_ids: &[String]) {
    for id in episode_ids {
        if !list.contains(id) {
            list.push(id.clone());
        }
    }
}

fn insert_unique(list: &mut Vec<String>, episode_id: &str, index: usize) {
    if !list.iter().any(|id| id == episode_id) {
        let index = index.min(list.len());
        list.insert(index, episode_id.to_string());
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    podcasts: Vec<Podcast>,
    queues: HashMap<String, Vec<String>>,
    playlists: HashMap<String, Vec<String>>,
}

/// Subscriptions, queues and playlists held in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-filled with `podcasts`, in that order
    pub fn with_podcasts(podcasts: impl IntoIterator<Item = Podcast>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                podcasts: podcasts.into_iter().collect(),
                ..MemoryState::default()
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get_all_podcasts(&self) -> Result<Vec<Podcast>, StorageError> {
        Ok(self.lock()?.podcasts.clone())
    }

    async fn get_podcast(&self, id: &str) -> Result<Option<Podcast>, StorageError> {
        Ok(self.lock()?.podcasts.iter().find(|p| p.id == id).cloned())
    }

    async fn add_podcast(&self, podcast: &Podcast) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        match state.podcasts.iter().position(|p| p.id == podcast.id) {
            Some(index) => state.podcasts[index] = podcast.clone(),
            None => state.podcasts.push(podcast.clone()),
        }
        Ok(())
    }

    async fn update_podcast(&self, podcast: &Podcast) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let existing = state
            .podcasts
            .iter_mut()
            .find(|p| p.id == podcast.id)
            .ok_or_else(|| StorageError::NotFound(podcast.id.clone()))?;
        *existing = podcast.clone();
        Ok(())
    }

    async fn remove_podcast(&self, id: &str) -> Result<bool, StorageError> {
        let mut state = self.lock()?;
        let before = state.podcasts.len();
        state.podcasts.retain(|p| p.id != id);
        Ok(state.podcasts.len() != before)
    }
}

#[async_trait]
impl QueueManager for MemoryStore {
    async fn add_episodes(
        &self,
        queue_id: &str,
        episode_ids: &[String],
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        append_unique(state.queues.entry(queue_id.to_string()).or_default(), episode_ids);
        Ok(())
    }

    async fn insert_episode(
        &self,
        queue_id: &str,
        episode_id: &str,
        index: usize,
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        insert_unique(state.queues.entry(queue_id.to_string()).or_default(), episode_id, index);
        Ok(())
    }

    async fn get_queue(&self, queue_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.lock()?.queues.get(queue_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl PlaylistManager for MemoryStore {
    async fn add_episodes(
        &self,
        playlist_id: &str,
        episode_ids: &[String],
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        append_unique(
            state.playlists.entry(playlist_id.to_string()).or_default(),
            episode_ids,
        );
        Ok(())
    }

    async fn insert_episode(
        &self,
        playlist_id: &str,
        episode_id: &str,
        index: usize,
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        insert_unique(
            state.playlists.entry(playlist_id.to_string()).or_default(),
            episode_id,
            index,
        );
        Ok(())
    }

    async fn get_playlist(&self, playlist_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .lock()?
            .playlists
            .get(playlist_id)
            .cloned()
            .unwrap_or_default())
    }
}
