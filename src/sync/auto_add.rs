// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::StorageError;
use crate::model::{AutoAddRule, Episode, InsertPosition, TargetType};
use crate::store::{PlaylistManager, QueueManager};

/// Route `new_episodes` into the rule's queue or playlist.
///
/// `Top` keeps feed order at the head of the list by inserting the episodes
/// at index 0 in reverse; `Bottom` appends them in feed order. Returns how
/// many episodes were handed to the target.
pub async fn apply_auto_add(
    rule: &AutoAddRule,
    new_episodes: &[Episode],
    queues: &dyn QueueManager,
    playlists: &dyn PlaylistManager,
) -> Result<usize, StorageError> {
    if !rule.enabled || new_episodes.is_empty() {
        return Ok(0);
    }

    let ids: Vec<String> = new_episodes.iter().map(|e| e.id.clone()).collect();
    let target = rule.target_id.as_str();

    match (rule.target_type, rule.position) {
        (TargetType::Queue, InsertPosition::Top) => {
            for id in ids.iter().rev() {
                queues.insert_episode(target, id, 0).await?;
            }
        }
        (TargetType::Queue, InsertPosition::Bottom) => queues.add_episodes(target, &ids).await?,
        (TargetType::Playlist, InsertPosition::Top) => {
            for id in ids.iter().rev() {
                playlists.insert_episode(target, id, 0).await?;
            }
        }
        (TargetType::Playlist, InsertPosition::Bottom) => {
            playlists.add_episodes(target, &ids).await?
        }
    }

    Ok(ids.len())
}
