// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::{PlaylistManager, QueueManager, SubscriptionStore, append_unique, insert_unique};
use crate::error::StorageError;
use crate::model::Podcast;

const PODCASTS_DIR: &str = "podcasts";
const QUEUES_DIR: &str = "queues";
const PLAYLISTS_DIR: &str = "playlists";

/// Store that keeps one pretty-printed JSON document per record:
///
/// ```text
/// <root>/podcasts/<podcast-id>.json
/// <root>/queues/<queue-id>.json
/// <root>/playlists/<playlist-id>.json
/// ```
///
/// Every write goes to a `.partial` file first and is renamed into place.
#[derive(Debug)]
pub struct JsonStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on queue and playlist files
    lists: Mutex<()>,
}

impl JsonStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lists: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, dir: &str, id: &str) -> Result<PathBuf, StorageError> {
        if id.is_empty()
            || id.starts_with('.')
            || id.contains(['/', '\\'])
            || id.chars().any(char::is_control)
        {
            return Err(StorageError::Backend(format!("unusable record id: {id:?}")));
        }
        Ok(self.root.join(dir).join(format!("{id}.json")))
    }

    async fn read_list(&self, dir: &str, id: &str) -> Result<Vec<String>, StorageError> {
        let path = self.record_path(dir, id)?;
        Ok(read_json(&path).await?.unwrap_or_default())
    }

    async fn modify_list(
        &self,
        dir: &str,
        id: &str,
        change: impl FnOnce(&mut Vec<String>) + Send,
    ) -> Result<(), StorageError> {
        let _guard = self.lists.lock().await;
        let path = self.record_path(dir, id)?;
        let mut list: Vec<String> = read_json(&path).await?.unwrap_or_default();
        change(&mut list);
        write_json(&path, &list).await
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    };

    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| StorageError::Corrupt {
            key: path.display().to_string(),
            source,
        })
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }

    let json = serde_json::to_vec_pretty(value)?;
    let temp_path = path.with_extension("json.partial");
    tokio::fs::write(&temp_path, json)
        .await
        .map_err(|e| io_error(&temp_path, e))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| io_error(path, e))
}

#[async_trait]
impl SubscriptionStore for JsonStore {
    async fn get_all_podcasts(&self) -> Result<Vec<Podcast>, StorageError> {
        let dir = self.root.join(PODCASTS_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut podcasts = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(podcast) = read_json::<Podcast>(&path).await? {
                podcasts.push(podcast);
            }
        }

        // Directory order is arbitrary; oldest subscription first
        podcasts.sort_by(|a, b| {
            a.subscribed_at
                .cmp(&b.subscribed_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(podcasts)
    }

    async fn get_podcast(&self, id: &str) -> Result<Option<Podcast>, StorageError> {
        read_json(&self.record_path(PODCASTS_DIR, id)?).await
    }

    async fn add_podcast(&self, podcast: &Podcast) -> Result<(), StorageError> {
        write_json(&self.record_path(PODCASTS_DIR, &podcast.id)?, podcast).await
    }

    async fn update_podcast(&self, podcast: &Podcast) -> Result<(), StorageError> {
        let path = self.record_path(PODCASTS_DIR, &podcast.id)?;
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error(&path, e))?
        {
            return Err(StorageError::NotFound(podcast.id.clone()));
        }
        write_json(&path, podcast).await
    }

    async fn remove_podcast(&self, id: &str) -> Result<bool, StorageError> {
        let path = self.record_path(PODCASTS_DIR, id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

#[async_trait]
impl QueueManager for JsonStore {
    async fn add_episodes(
        &self,
        queue_id: &str,
        episode_ids: &[String],
    ) -> Result<(), StorageError> {
        self.modify_list(QUEUES_DIR, queue_id, |list| append_unique(list, episode_ids))
            .await
    }

    async fn insert_episode(
        &self,
        queue_id: &str,
        episode_id: &str,
        index: usize,
    ) -> Result<(), StorageError> {
        self.modify_list(QUEUES_DIR, queue_id, |list| {
            insert_unique(list, episode_id, index)
        })
        .await
    }

    async fn get_queue(&self, queue_id: &str) -> Result<Vec<String>, StorageError> {
        self.read_list(QUEUES_DIR, queue_id).await
    }
}

#[async_trait]
impl PlaylistManager for JsonStore {
    async fn add_episodes(
        &self,
        playlist_id: &str,
        episode_ids: &[String],
    ) -> Result<(), StorageError> {
        self.modify_list(PLAYLISTS_DIR, playlist_id, |list| {
            append_unique(list, episode_ids)
        })
        .await
    }

    async fn insert_episode(
        &self,
        playlist_id: &str,
        episode_id: &str,
        index: usize,
    ) -> Result<(), StorageError> {
        self.modify_list(PLAYLISTS_DIR, playlist_id, |list| {
            insert_unique(list, episode_id, index)
        })
        .await
    }

    async fn get_playlist(&self, playlist_id: &str) -> Result<Vec<String>, StorageError> {
        self.read_list(PLAYLISTS_DIR, playlist_id).await
    }
}
