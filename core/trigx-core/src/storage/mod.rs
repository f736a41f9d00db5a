//! System store: the administrative data space holding trigger records.
//!
//! The trigger engine depends only on the [`SystemStore`] trait; the host
//! supplies the backend. Two are shipped: [`sled_store::SledSystemStore`]
//! for durable single-node use and [`memory_store::MemorySystemStore`] for
//! tests and embedding.
//!
//! # Contract
//!
//! - Records are addressed by `(label, key)` and carry string properties.
//! - Writes are buffered in the transaction and become visible atomically on
//!   `commit`. Dropping a transaction without committing discards them.
//! - Reads inside a transaction observe its own buffered writes.
//! - `scan` returns records in key order.
//! - Commits are optimistic. Every committed record a transaction read, and
//!   every prefix it scanned, must be unchanged at commit time, otherwise the
//!   commit fails with [`TrigxError::WriteConflict`] and applies nothing. The
//!   conflict is transient, so the retry policy re-runs the whole mutation.

pub mod memory_store;
pub mod sled_store;

use crate::error::{TrigxError, TrigxResult};
use std::cell::RefCell;
use std::collections::BTreeMap;

/// String-keyed, string-valued record properties.
pub type Properties = BTreeMap<String, String>;

/// A transaction against the system store.
pub trait SystemTransaction {
    /// Fetch one record.
    fn get(&self, label: &str, key: &str) -> TrigxResult<Option<Properties>>;

    /// All records under `label` whose key starts with `prefix`.
    fn scan(&self, label: &str, prefix: &str) -> TrigxResult<Vec<(String, Properties)>>;

    /// Create or overwrite a record.
    fn put(&mut self, label: &str, key: &str, props: Properties) -> TrigxResult<()>;

    /// Delete a record, returning whether it existed.
    fn remove(&mut self, label: &str, key: &str) -> TrigxResult<bool>;

    /// Apply buffered writes atomically.
    fn commit(self: Box<Self>) -> TrigxResult<()>;
}

/// Transactional access to the administrative store.
pub trait SystemStore: Send + Sync {
    fn begin(&self) -> TrigxResult<Box<dyn SystemTransaction + '_>>;

    /// Whether this process may write (e.g. false on a read replica).
    fn is_writable(&self) -> bool {
        true
    }
}

const KEY_SEPARATOR: char = '\u{0}';

pub(crate) fn encode_key(label: &str, key: &str) -> Vec<u8> {
    format!("{label}{KEY_SEPARATOR}{key}").into_bytes()
}

pub(crate) fn decode_key(raw: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(raw).ok()?;
    text.split_once(KEY_SEPARATOR)
        .map(|(_, key)| key.to_string())
}

pub(crate) fn encode_props(props: &Properties) -> TrigxResult<Vec<u8>> {
    Ok(serde_json::to_vec(props)?)
}

pub(crate) fn decode_props(raw: &[u8]) -> TrigxResult<Properties> {
    Ok(serde_json::from_slice(raw)?)
}

/// Uncommitted writes of one transaction; `None` marks a delete.
#[derive(Debug, Default)]
pub(crate) struct WriteBuffer {
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl WriteBuffer {
    pub(crate) fn get(&self, key: &[u8]) -> Option<&Option<Vec<u8>>> {
        self.writes.get(key)
    }

    pub(crate) fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    pub(crate) fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub(crate) fn into_writes(self) -> BTreeMap<Vec<u8>, Option<Vec<u8>>> {
        self.writes
    }

    /// Overlay buffered writes onto committed rows sharing `prefix`.
    pub(crate) fn overlay(
        &self,
        prefix: &[u8],
        committed: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = committed.into_iter().collect();
        for (key, value) in self
            .writes
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match value {
                Some(v) => merged.insert(key.clone(), v.clone()),
                None => merged.remove(key),
            };
        }
        merged.into_iter().collect()
    }
}

type Rows = Vec<(Vec<u8>, Vec<u8>)>;

/// Committed state a transaction observed, checked again at commit.
#[derive(Debug, Default)]
pub(crate) struct ReadSet {
    keys: RefCell<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    prefixes: RefCell<BTreeMap<Vec<u8>, Rows>>,
}

impl ReadSet {
    /// First observation of a key wins; later reads see the same snapshot anyway.
    pub(crate) fn record_get(&self, key: &[u8], committed: Option<&[u8]>) {
        self.keys
            .borrow_mut()
            .entry(key.to_vec())
            .or_insert_with(|| committed.map(<[u8]>::to_vec));
    }

    pub(crate) fn record_scan(&self, prefix: &[u8], committed: &[(Vec<u8>, Vec<u8>)]) {
        self.prefixes
            .borrow_mut()
            .entry(prefix.to_vec())
            .or_insert_with(|| committed.to_vec());
    }

    /// Fail with a conflict if any observed key or prefix has changed.
    ///
    /// Must run under the same exclusion as the commit that follows it.
    pub(crate) fn validate<G, S>(&self, mut current: G, mut current_prefix: S) -> TrigxResult<()>
    where
        G: FnMut(&[u8]) -> TrigxResult<Option<Vec<u8>>>,
        S: FnMut(&[u8]) -> TrigxResult<Rows>,
    {
        for (key, seen) in self.keys.borrow().iter() {
            if current(key)? != *seen {
                return Err(conflict(key));
            }
        }
        for (prefix, seen) in self.prefixes.borrow().iter() {
            if current_prefix(prefix)? != *seen {
                return Err(conflict(prefix));
            }
        }
        Ok(())
    }
}

fn conflict(key: &[u8]) -> TrigxError {
    let readable = decode_key(key).unwrap_or_else(|| String::from_utf8_lossy(key).into_owned());
    TrigxError::WriteConflict(format!("'{readable}' changed since it was read"))
}

/// Decode raw `(key, value)` rows into `(record key, properties)`.
pub(crate) fn decode_rows(rows: Vec<(Vec<u8>, Vec<u8>)>) -> TrigxResult<Vec<(String, Properties)>> {
    let mut out = Vec::with_capacity(rows.len());
    for (raw_key, raw_value) in rows {
        if let Some(key) = decode_key(&raw_key) {
            out.push((key, decode_props(&raw_value)?));
        }
    }
    Ok(out)
}
