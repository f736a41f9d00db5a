//! Periodic refresh
//!
//! A coordinator notices changes written by another process sharing the
//! administrative store by polling its `lastUpdated` stamp.

use super::cache::TriggerCache;
use super::store::TriggerStore;
use crate::error::TrigxResult;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Handle to a recurring job. The job is cancelled when the handle drops.
pub struct JobHandle {
    name: String,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl JobHandle {
    pub fn new(name: impl Into<String>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            debug!(job = %self.name, "cancelling recurring job");
            cancel();
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub type Task = Box<dyn Fn() + Send + Sync + 'static>;

/// Host-provided recurring job facility.
pub trait RecurringScheduler: Send + Sync {
    fn schedule_recurring(
        &self,
        name: &str,
        task: Task,
        initial_delay: Duration,
        period: Duration,
    ) -> TrigxResult<JobHandle>;
}

/// One background thread per job, woken by a timed channel receive.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadScheduler;

impl RecurringScheduler for ThreadScheduler {
    fn schedule_recurring(
        &self,
        name: &str,
        task: Task,
        initial_delay: Duration,
        period: Duration,
    ) -> TrigxResult<JobHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let worker = thread::Builder::new()
            .name(format!("trigx-{}", name))
            .spawn(move || {
                let mut wait = initial_delay;
                // Any message or a dropped sender stops the loop
                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(wait) {
                    task();
                    wait = period;
                }
            })?;

        Ok(JobHandle::new(name, move || {
            drop(stop_tx);
            // A task that drops its own handle must not join itself
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }))
    }
}

pub struct RefreshScheduler {
    database: String,
    store: Arc<TriggerStore>,
    cache: Arc<TriggerCache>,
}

impl RefreshScheduler {
    pub fn new(database: impl Into<String>, store: Arc<TriggerStore>, cache: Arc<TriggerCache>) -> Self {
        Self {
            database: database.into(),
            store,
            cache,
        }
    }

    /// Refresh if the store changed since the last applied snapshot.
    ///
    /// Returns whether a new snapshot was published.
    pub fn tick(&self) -> TrigxResult<bool> {
        let last_updated = self.store.read_last_updated(&self.database)?;
        let last_applied = self.cache.last_applied();
        if last_updated < last_applied {
            return Ok(false);
        }
        debug!(database = %self.database, last_updated, last_applied, "store changed, refreshing triggers");
        self.cache.refresh()
    }

    /// Run [`tick`](Self::tick) every `period`; errors are logged and the next tick retries.
    pub fn start(
        self: Arc<Self>,
        scheduler: &dyn RecurringScheduler,
        initial_delay: Duration,
        period: Duration,
    ) -> TrigxResult<JobHandle> {
        let name = format!("trigger-refresh-{}", self.database);
        let refresher = self;
        scheduler.schedule_recurring(
            &name,
            Box::new(move || {
                if let Err(e) = refresher.tick() {
                    warn!(database = %refresher.database, error = %e, "scheduled trigger refresh failed");
                }
            }),
            initial_delay,
            period,
        )
    }
}
