//! Lock-free trigger snapshot cache
//!
//! Every committing transaction reads the current snapshot, so reads are a
//! single atomic load. Refreshes build a whole new snapshot off to the side
//! and publish it with compare-and-swap against the base they started from.

use super::reconciler::RegistrationReconciler;
use super::snapshot::TriggerSnapshot;
use super::store::TriggerStore;
use crate::error::TrigxResult;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Read handle on the published snapshot, shared with the event hooks.
#[derive(Clone)]
pub struct SnapshotReader {
    pub(super) cell: Arc<ArcSwap<TriggerSnapshot>>,
}

impl SnapshotReader {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(ArcSwap::from_pointee(TriggerSnapshot::empty())),
        }
    }

    pub fn get(&self) -> Arc<TriggerSnapshot> {
        self.cell.load_full()
    }
}

impl Default for SnapshotReader {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TriggerCache {
    database: String,
    reader: SnapshotReader,
    store: Arc<TriggerStore>,
    reconciler: RegistrationReconciler,
    max_attempts: u32,
    /// Clock reading taken just before loading the last published snapshot
    last_applied: AtomicU64,
}

impl TriggerCache {
    pub fn new(
        database: impl Into<String>,
        reader: SnapshotReader,
        store: Arc<TriggerStore>,
        reconciler: RegistrationReconciler,
        max_attempts: u32,
    ) -> Self {
        Self {
            database: database.into(),
            reader,
            store,
            reconciler,
            max_attempts: max_attempts.max(1),
            last_applied: AtomicU64::new(0),
        }
    }

    pub fn get(&self) -> Arc<TriggerSnapshot> {
        self.reader.get()
    }

    pub fn reader(&self) -> SnapshotReader {
        self.reader.clone()
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        self.reconciler.is_registered()
    }

    /// Drop the host registration whatever the published snapshot holds.
    pub fn release(&self) -> TrigxResult<()> {
        self.reconciler.reconcile(true)?;
        Ok(())
    }

    /// Reload from the store and publish.
    ///
    /// Returns `Ok(false)` when every attempt lost the swap to a concurrent
    /// refresh; the published snapshot is left as the winner installed it.
    pub fn refresh(&self) -> TrigxResult<bool> {
        self.refresh_with(|| self.store.read(&self.database))
    }

    fn refresh_with<F>(&self, mut load: F) -> TrigxResult<bool>
    where
        F: FnMut() -> TrigxResult<TriggerSnapshot>,
    {
        for attempt in 1..=self.max_attempts {
            let base = self.reader.cell.load_full();
            // Stamped before the read so a write landing during it still looks newer
            let loaded_at = self.store.clock().now_millis();
            let fresh = Arc::new(load()?);

            let previous = self.reader.cell.compare_and_swap(&base, fresh);
            if Arc::ptr_eq(&previous, &base) {
                self.last_applied.store(loaded_at, Ordering::SeqCst);
                debug!(database = %self.database, attempt, triggers = ?self.get().names(),
                    "trigger snapshot refreshed");
                // Reconcile against what is published now, a later swap may have landed
                self.reconciler.reconcile(self.get().is_empty())?;
                return Ok(true);
            }
            debug!(database = %self.database, attempt, "lost snapshot swap, retrying");
        }

        debug!(database = %self.database, attempts = self.max_attempts,
            "abandoning snapshot refresh until next cycle");
        Ok(false)
    }
}
