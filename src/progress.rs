// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use crate::model::TargetType;

/// Events emitted while a batch sync runs
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A batch has selected its podcasts
    SyncStarted { total: usize },

    /// A podcast's feed is being refreshed
    PodcastSyncing { podcast_id: String, title: String },

    /// A podcast was refreshed and persisted
    PodcastSynced {
        podcast_id: String,
        title: String,
        new_episodes: usize,
    },

    /// A podcast could not be refreshed; the batch carries on
    PodcastFailed {
        podcast_id: String,
        title: String,
        error: String,
    },

    /// New episodes were routed into a queue or playlist
    EpisodesAutoAdded {
        podcast_id: String,
        target: TargetType,
        target_id: String,
        count: usize,
    },

    /// The batch finished
    SyncCompleted {
        success_count: usize,
        failure_count: usize,
        new_episodes: usize,
    },
}

/// Trait for reporting progress events during synchronization.
///
/// Implementations can use this to display progress bars, log messages,
/// or collect statistics.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: SyncEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: SyncEvent) {}
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}
