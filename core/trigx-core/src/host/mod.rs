//! Host database collaborators
//!
//! The trigger engine never touches user data directly. It is handed these
//! seams by the host: transactions it can open and tag, an event subsystem
//! that calls back on commit/rollback, and an opaque statement runner.

pub mod memory;

use crate::error::TrigxResult;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Statement parameters and transaction metadata.
pub type Params = BTreeMap<String, Value>;

/// A host transaction that trigger statements run against.
pub trait HostTransaction {
    fn id(&self) -> u64;

    /// Per-transaction metadata, visible to event listeners.
    fn metadata(&self) -> &Params;

    fn set_metadata(&mut self, key: &str, value: Value);

    fn commit(self: Box<Self>) -> TrigxResult<()>;

    fn rollback(self: Box<Self>) -> TrigxResult<()>;

    /// Downcast hook for statement runners bound to a concrete host.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Opens transactions on the target database.
pub trait HostDatabase: Send + Sync {
    fn name(&self) -> &str;

    fn begin(&self) -> TrigxResult<Box<dyn HostTransaction>>;
}

/// What the host reports about a committing or rolled-back transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionData {
    pub tx_id: u64,
    /// Set once the transaction has committed
    pub commit_time: Option<u64>,
    pub metadata: Params,
    /// Change-set, forwarded to trigger statements without inspection
    pub changes: Params,
}

/// Callbacks the host invokes around every transaction of a database.
pub trait TransactionEventListener: Send + Sync {
    /// Runs inside the committing transaction; an error aborts the commit.
    fn before_commit(&self, data: &TransactionData, tx: &mut dyn HostTransaction)
    -> TrigxResult<()>;

    fn after_commit(&self, data: &TransactionData) -> TrigxResult<()>;

    fn after_rollback(&self, data: &TransactionData) -> TrigxResult<()>;
}

/// The host's transaction-event subsystem.
pub trait TransactionEvents: Send + Sync {
    fn register(
        &self,
        database: &str,
        listener: Arc<dyn TransactionEventListener>,
    ) -> TrigxResult<()>;

    fn unregister(
        &self,
        database: &str,
        listener: &Arc<dyn TransactionEventListener>,
    ) -> TrigxResult<()>;
}

/// Runs a statement to completion against a transaction, returning the row count.
pub trait StatementRunner: Send + Sync {
    fn run(&self, statement: &str, params: &Params, tx: &mut dyn HostTransaction)
    -> TrigxResult<u64>;
}

/// Identity comparison for listener trait objects.
pub(crate) fn same_listener(
    a: &Arc<dyn TransactionEventListener>,
    b: &Arc<dyn TransactionEventListener>,
) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
