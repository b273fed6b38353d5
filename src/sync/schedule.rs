// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::{Instant, MissedTickBehavior};

/// Work fired by a [`Scheduler`] on every tick
pub type ScheduledTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Fixed-interval timer capability
pub trait Scheduler: Send + Sync {
    /// Run `task` every `period`, first after one full period.
    ///
    /// The schedule lives until the returned handle is cancelled or dropped.
    fn schedule_repeating(&self, period: Duration, task: ScheduledTask) -> ScheduleHandle;
}

/// Keeps a repeating schedule alive; cancelling or dropping it stops the timer
pub struct ScheduleHandle {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ScheduleHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ScheduleHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ScheduleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Scheduler backed by a spawned `tokio::time::interval` loop.
///
/// Must be used from within a Tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn shared() -> Arc<dyn Scheduler> {
        Arc::new(Self)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_repeating(&self, period: Duration, task: ScheduledTask) -> ScheduleHandle {
        // tokio rejects a zero period
        let period = period.max(Duration::from_millis(1));
        let task_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            // A run that overruns its slot pushes the next one back instead of bursting
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task().await;
            }
        });
        let abort = task_handle.abort_handle();
        ScheduleHandle::new(move || abort.abort())
    }
}
