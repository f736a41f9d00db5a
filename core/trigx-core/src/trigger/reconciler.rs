//! Keeps the host event registration in step with the trigger snapshot.
//!
//! With no triggers defined the listener is unregistered so the host pays no
//! per-transaction callback cost. Only the thread that wins the
//! compare-and-swap on the registration flag talks to the host.

use crate::error::TrigxResult;
use crate::host::{TransactionEventListener, TransactionEvents};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// What a reconcile call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Registered,
    Unregistered,
    Unchanged,
}

pub struct RegistrationReconciler {
    database: String,
    events: Arc<dyn TransactionEvents>,
    listener: Arc<dyn TransactionEventListener>,
    registered: AtomicBool,
}

impl RegistrationReconciler {
    pub fn new(
        database: impl Into<String>,
        events: Arc<dyn TransactionEvents>,
        listener: Arc<dyn TransactionEventListener>,
    ) -> Self {
        Self {
            database: database.into(),
            events,
            listener,
            registered: AtomicBool::new(false),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Register on empty→non-empty, unregister on non-empty→empty.
    pub fn reconcile(&self, snapshot_is_empty: bool) -> TrigxResult<Transition> {
        if !snapshot_is_empty
            && self
                .registered
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            if let Err(e) = self
                .events
                .register(&self.database, Arc::clone(&self.listener))
            {
                self.registered.store(false, Ordering::SeqCst);
                warn!(database = %self.database, error = %e, "failed to register trigger listener");
                return Err(e);
            }
            info!(database = %self.database, "trigger listener registered");
            return Ok(Transition::Registered);
        }

        if snapshot_is_empty
            && self
                .registered
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            if let Err(e) = self.events.unregister(&self.database, &self.listener) {
                self.registered.store(true, Ordering::SeqCst);
                warn!(database = %self.database, error = %e, "failed to unregister trigger listener");
                return Err(e);
            }
            info!(database = %self.database, "trigger listener unregistered");
            return Ok(Transition::Unregistered);
        }

        Ok(Transition::Unchanged)
    }
}
