//! In-memory host database
//!
//! A single-database key/value host with the full transaction event
//! lifecycle. Used for embedding without a real graph engine and throughout
//! the tests.

use super::{
    HostDatabase, HostTransaction, Params, StatementRunner, TransactionData,
    TransactionEventListener, TransactionEvents, same_listener,
};
use crate::error::{TrigxError, TrigxResult};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

struct HostState {
    name: String,
    next_tx_id: AtomicU64,
    /// Monotonic commit timestamps
    commit_clock: AtomicU64,
    data: RwLock<BTreeMap<String, Value>>,
    listeners: DashMap<String, Vec<Arc<dyn TransactionEventListener>>>,
    registrations: AtomicUsize,
    unregistrations: AtomicUsize,
    listener_errors: Mutex<Vec<String>>,
}

impl HostState {
    /// Copy of the current listeners so callbacks run without holding the map.
    fn listeners(&self) -> Vec<Arc<dyn TransactionEventListener>> {
        self.listeners
            .get(&self.name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn record_listener_error(&self, callback: &str, tx_id: u64, err: &TrigxError) {
        warn!(database = %self.name, tx_id, callback, error = %err, "transaction listener failed");
        self.listener_errors.lock().push(err.to_string());
    }
}

/// Cheap to clone; clones share the same database.
#[derive(Clone)]
pub struct MemoryHost {
    state: Arc<HostState>,
}

impl MemoryHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(HostState {
                name: name.into(),
                next_tx_id: AtomicU64::new(1),
                commit_clock: AtomicU64::new(0),
                data: RwLock::new(BTreeMap::new()),
                listeners: DashMap::new(),
                registrations: AtomicUsize::new(0),
                unregistrations: AtomicUsize::new(0),
                listener_errors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Committed value of `key`.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.state.data.read().get(key).cloned()
    }

    /// Committed value of `key` as an integer, 0 when absent.
    pub fn counter(&self, key: &str) -> i64 {
        self.value(key).and_then(|v| v.as_i64()).unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.state.listeners().len()
    }

    pub fn registrations(&self) -> usize {
        self.state.registrations.load(Ordering::SeqCst)
    }

    pub fn unregistrations(&self) -> usize {
        self.state.unregistrations.load(Ordering::SeqCst)
    }

    /// Errors returned by after-commit and after-rollback listeners, drained.
    pub fn take_listener_errors(&self) -> Vec<String> {
        std::mem::take(&mut *self.state.listener_errors.lock())
    }

    /// Convenience: open, apply `writes`, commit.
    pub fn write(&self, writes: &[(&str, Value)]) -> TrigxResult<()> {
        let mut tx = self.begin_memory();
        for (key, value) in writes {
            tx.set(key, value.clone());
        }
        Box::new(tx).commit()
    }

    /// Open a transaction with the concrete type exposed.
    pub fn begin_memory(&self) -> MemoryTransaction {
        MemoryTransaction {
            id: self.state.next_tx_id.fetch_add(1, Ordering::SeqCst),
            state: Arc::clone(&self.state),
            metadata: Params::new(),
            writes: BTreeMap::new(),
        }
    }
}

impl HostDatabase for MemoryHost {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn begin(&self) -> TrigxResult<Box<dyn HostTransaction>> {
        Ok(Box::new(self.begin_memory()))
    }
}

impl TransactionEvents for MemoryHost {
    fn register(&self, database: &str, listener: Arc<dyn TransactionEventListener>) -> TrigxResult<()> {
        if database != self.state.name {
            return Err(TrigxError::DatabaseNotFound(database.to_string()));
        }
        self.state
            .listeners
            .entry(database.to_string())
            .or_default()
            .push(listener);
        self.state.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister(&self, database: &str, listener: &Arc<dyn TransactionEventListener>) -> TrigxResult<()> {
        if database != self.state.name {
            return Err(TrigxError::DatabaseNotFound(database.to_string()));
        }
        if let Some(mut entry) = self.state.listeners.get_mut(database) {
            entry.retain(|l| !same_listener(l, listener));
        }
        self.state.unregistrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Buffered transaction; writes become visible to others on commit.
pub struct MemoryTransaction {
    id: u64,
    state: Arc<HostState>,
    metadata: Params,
    writes: BTreeMap<String, Value>,
}

impl MemoryTransaction {
    pub fn set(&mut self, key: &str, value: Value) {
        self.writes.insert(key.to_string(), value);
    }

    /// Read through this transaction's own writes.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.writes
            .get(key)
            .cloned()
            .or_else(|| self.state.data.read().get(key).cloned())
    }

    pub fn increment(&mut self, key: &str, by: i64) -> i64 {
        let next = self.get(key).and_then(|v| v.as_i64()).unwrap_or(0) + by;
        self.set(key, Value::from(next));
        next
    }

    /// Append to an array value, creating it if needed.
    pub fn push(&mut self, key: &str, value: Value) {
        let mut items = match self.get(key) {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => Vec::new(),
        };
        items.push(value);
        self.set(key, Value::Array(items));
    }

    fn data(&self, commit_time: Option<u64>) -> TransactionData {
        TransactionData {
            tx_id: self.id,
            commit_time,
            metadata: self.metadata.clone(),
            changes: self
                .writes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn notify_rollback(&self, listeners: &[Arc<dyn TransactionEventListener>]) {
        let data = self.data(None);
        for listener in listeners {
            if let Err(e) = listener.after_rollback(&data) {
                self.state.record_listener_error("after_rollback", self.id, &e);
            }
        }
    }
}

impl HostTransaction for MemoryTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn metadata(&self) -> &Params {
        &self.metadata
    }

    fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    fn commit(self: Box<Self>) -> TrigxResult<()> {
        let mut tx = *self;
        let listeners = tx.state.listeners();

        let pending = tx.data(None);
        for listener in &listeners {
            if let Err(e) = listener.before_commit(&pending, &mut tx) {
                debug!(database = %tx.state.name, tx_id = tx.id, error = %e, "before-commit listener aborted transaction");
                tx.notify_rollback(&listeners);
                return Err(TrigxError::TransactionAborted {
                    reason: e.to_string(),
                });
            }
        }

        let commit_time = {
            let mut data = tx.state.data.write();
            data.extend(tx.writes.iter().map(|(k, v)| (k.clone(), v.clone())));
            tx.state.commit_clock.fetch_add(1, Ordering::SeqCst) + 1
        };

        let committed = tx.data(Some(commit_time));
        for listener in &listeners {
            if let Err(e) = listener.after_commit(&committed) {
                tx.state.record_listener_error("after_commit", tx.id, &e);
            }
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> TrigxResult<()> {
        let listeners = self.state.listeners();
        self.notify_rollback(&listeners);
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Tiny command language over [`MemoryTransaction`].
///
/// Commands are separated by `;`:
/// `INCR key`, `SET key value`, `PUSH key value`, `FAIL message`.
/// A value of `$name` reads a statement parameter; anything else is parsed
/// as JSON, falling back to a plain string. Returns the number of commands run.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStatementRunner;

impl MemoryStatementRunner {
    fn resolve(raw: &str, params: &Params) -> TrigxResult<Value> {
        if let Some(name) = raw.strip_prefix('$') {
            return params
                .get(name)
                .cloned()
                .ok_or_else(|| TrigxError::StatementFailed(format!("missing parameter '{name}'")));
        }
        Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
    }
}

impl StatementRunner for MemoryStatementRunner {
    fn run(&self, statement: &str, params: &Params, tx: &mut dyn HostTransaction) -> TrigxResult<u64> {
        let tx = tx
            .as_any_mut()
            .downcast_mut::<MemoryTransaction>()
            .ok_or_else(|| {
                TrigxError::StatementFailed("statement needs an in-memory transaction".into())
            })?;

        let mut count = 0;
        for command in statement.split(';').map(str::trim).filter(|c| !c.is_empty()) {
            let mut parts = command.splitn(3, char::is_whitespace);
            let verb = parts.next().unwrap_or_default();
            match (verb, parts.next(), parts.next()) {
                ("INCR", Some(key), None) => {
                    tx.increment(key, 1);
                }
                ("SET", Some(key), Some(raw)) => {
                    let value = Self::resolve(raw.trim(), params)?;
                    tx.set(key, value);
                }
                ("PUSH", Some(key), Some(raw)) => {
                    let value = Self::resolve(raw.trim(), params)?;
                    tx.push(key, value);
                }
                ("FAIL", message, rest) => {
                    let message = [message, rest].into_iter().flatten().collect::<Vec<_>>().join(" ");
                    return Err(TrigxError::StatementFailed(message));
                }
                _ => {
                    return Err(TrigxError::StatementFailed(format!(
                        "cannot run '{command}'"
                    )));
                }
            }
            count += 1;
        }
        Ok(count)
    }
}
