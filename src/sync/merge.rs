// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use crate::model::{Episode, Podcast};

/// Episodes from `fetched` whose id is not among `existing`, in feed order.
///
/// An id repeated within the feed counts once, as its first occurrence.
pub fn find_new_episodes(fetched: &[Episode], existing: &[Episode]) -> Vec<Episode> {
    let mut known: HashSet<&str> = existing.iter().map(|e| e.id.as_str()).collect();
    fetched
        .iter()
        .filter(|e| known.insert(e.id.as_str()))
        .cloned()
        .collect()
}

/// Merge freshly discovered episodes into an existing list.
///
/// The result holds each id once (the `fresh` copy wins) and is ordered
/// newest first. Undated episodes go last; ties keep their merge order.
pub fn merge_episodes(fresh: &[Episode], existing: &[Episode]) -> Vec<Episode> {
    let mut seen = HashSet::new();
    let mut merged: Vec<Episode> = fresh
        .iter()
        .chain(existing)
        .filter(|e| seen.insert(e.id.as_str()))
        .cloned()
        .collect();

    merged.sort_by(|a, b| newest_first(a.publish_date, b.publish_date));
    merged
}

fn newest_first(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Is the podcast due for a refresh at `now`
pub fn should_update(podcast: &Podcast, now: DateTime<Utc>, interval: Duration) -> bool {
    match podcast.last_fetched_at {
        Some(last) => now - last >= interval,
        None => true,
    }
}
