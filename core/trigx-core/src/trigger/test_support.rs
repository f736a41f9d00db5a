//! Shared fixtures for the trigger module tests.

use super::cache::{SnapshotReader, TriggerCache};
use super::reconciler::RegistrationReconciler;
use super::store::TriggerStore;
use crate::clock::ManualClock;
use crate::error::TrigxResult;
use crate::host::memory::MemoryHost;
use crate::host::{HostTransaction, TransactionData, TransactionEventListener, TransactionEvents};
use crate::retry::RetryPolicy;
use crate::storage::SystemStore;
use std::sync::Arc;

pub struct NoopListener;

impl TransactionEventListener for NoopListener {
    fn before_commit(&self, _: &TransactionData, _: &mut dyn HostTransaction) -> TrigxResult<()> {
        Ok(())
    }
    fn after_commit(&self, _: &TransactionData) -> TrigxResult<()> {
        Ok(())
    }
    fn after_rollback(&self, _: &TransactionData) -> TrigxResult<()> {
        Ok(())
    }
}

/// A cache for "neo4j" over `system`, registering a no-op listener on `host`.
pub fn cache_over(
    system: Arc<dyn SystemStore>,
    clock: Arc<ManualClock>,
    host: &Arc<MemoryHost>,
) -> (Arc<TriggerStore>, TriggerCache) {
    let store = Arc::new(TriggerStore::new(system, clock, RetryPolicy::default()));
    let events: Arc<dyn TransactionEvents> = host.clone();
    let reconciler = RegistrationReconciler::new("neo4j", events, Arc::new(NoopListener));
    let cache = TriggerCache::new("neo4j", SnapshotReader::new(), Arc::clone(&store), reconciler, 5);
    (store, cache)
}
