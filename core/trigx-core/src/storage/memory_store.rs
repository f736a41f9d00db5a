//! In-memory system store using BTreeMap
//!
//! Supports fault injection so callers can exercise the retry path: the next
//! N `begin`/`commit` calls can be made to fail as transiently unavailable.

use crate::error::{TrigxError, TrigxResult};
use crate::storage::{
    Properties, ReadSet, SystemStore, SystemTransaction, WriteBuffer, decode_props, decode_rows,
    encode_key, encode_props,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// In-memory system store.
pub struct MemorySystemStore {
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    writable: AtomicBool,
    failures_left: AtomicU32,
    commits: AtomicU64,
}

impl MemorySystemStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            writable: AtomicBool::new(true),
            failures_left: AtomicU32::new(0),
            commits: AtomicU64::new(0),
        }
    }

    /// Make the next `count` begin/commit calls fail with `StoreUnavailable`.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Simulate a read replica.
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    /// Number of commits that applied writes.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> TrigxResult<()> {
        let consumed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(TrigxError::StoreUnavailable(
                "no writer elected for the system store".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }
}

impl Default for MemorySystemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemStore for MemorySystemStore {
    fn begin(&self) -> TrigxResult<Box<dyn SystemTransaction + '_>> {
        self.injected_failure()?;
        Ok(Box::new(MemorySystemTransaction {
            store: self,
            buffer: WriteBuffer::default(),
            reads: ReadSet::default(),
        }))
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }
}

struct MemorySystemTransaction<'a> {
    store: &'a MemorySystemStore,
    buffer: WriteBuffer,
    reads: ReadSet,
}

fn prefix_rows(rows: &BTreeMap<Vec<u8>, Vec<u8>>, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    rows.range(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl SystemTransaction for MemorySystemTransaction<'_> {
    fn get(&self, label: &str, key: &str) -> TrigxResult<Option<Properties>> {
        let raw_key = encode_key(label, key);
        if let Some(buffered) = self.buffer.get(&raw_key) {
            return buffered.as_deref().map(decode_props).transpose();
        }
        let committed = self.store.rows.read().get(&raw_key).cloned();
        self.reads.record_get(&raw_key, committed.as_deref());
        committed.as_deref().map(decode_props).transpose()
    }

    fn scan(&self, label: &str, prefix: &str) -> TrigxResult<Vec<(String, Properties)>> {
        let raw_prefix = encode_key(label, prefix);
        let committed = prefix_rows(&self.store.rows.read(), &raw_prefix);
        self.reads.record_scan(&raw_prefix, &committed);
        decode_rows(self.buffer.overlay(&raw_prefix, committed))
    }

    fn put(&mut self, label: &str, key: &str, props: Properties) -> TrigxResult<()> {
        self.buffer.put(encode_key(label, key), encode_props(&props)?);
        Ok(())
    }

    fn remove(&mut self, label: &str, key: &str) -> TrigxResult<bool> {
        let existed = self.get(label, key)?.is_some();
        self.buffer.delete(encode_key(label, key));
        Ok(existed)
    }

    fn commit(self: Box<Self>) -> TrigxResult<()> {
        let MemorySystemTransaction {
            store,
            buffer,
            reads,
        } = *self;
        store.injected_failure()?;
        if buffer.is_empty() {
            return Ok(());
        }
        let mut rows = store.rows.write();
        reads.validate(
            |key| Ok(rows.get(key).cloned()),
            |prefix| Ok(prefix_rows(&rows, prefix)),
        )?;
        for (key, value) in buffer.into_writes() {
            match value {
                Some(v) => rows.insert(key, v),
                None => rows.remove(&key),
            };
        }
        store.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(statement: &str) -> Properties {
        Properties::from([("statement".to_string(), statement.to_string())])
    }

    #[test]
    fn put_commit_scan() {
        let store = MemorySystemStore::new();
        let mut tx = store.begin().unwrap();
        tx.put("Trigger", "db/a", Properties::new()).unwrap();
        tx.put("Trigger", "db/b", Properties::new()).unwrap();
        tx.commit().unwrap();

        let tx = store.begin().unwrap();
        assert_eq!(tx.scan("Trigger", "db/").unwrap().len(), 2);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn injected_failures_are_transient_and_consumed() {
        let store = MemorySystemStore::new();
        store.fail_next(2);

        let first = store.begin().err().unwrap();
        assert!(first.is_transient());
        assert!(store.begin().is_err());
        assert!(store.begin().is_ok());
    }

    #[test]
    fn failed_commit_leaves_store_untouched() {
        let store = MemorySystemStore::new();
        let mut tx = store.begin().unwrap();
        tx.put("Trigger", "db/a", Properties::new()).unwrap();
        store.fail_next(1);
        assert!(tx.commit().is_err());

        let tx = store.begin().unwrap();
        assert!(tx.scan("Trigger", "db/").unwrap().is_empty());
        assert_eq!(store.commit_count(), 0);
    }

    #[test]
    fn stale_read_modify_write_is_rejected() {
        let store = MemorySystemStore::new();
        let mut seed = store.begin().unwrap();
        seed.put("Trigger", "db/t1", props("OLD")).unwrap();
        seed.commit().unwrap();

        let mut pause = store.begin().unwrap();
        assert_eq!(pause.get("Trigger", "db/t1").unwrap().unwrap()["statement"], "OLD");

        let mut install = store.begin().unwrap();
        install.put("Trigger", "db/t1", props("NEW")).unwrap();
        install.commit().unwrap();

        pause.put("Trigger", "db/t1", props("OLD")).unwrap();
        let err = pause.commit().unwrap_err();
        assert!(matches!(err, TrigxError::WriteConflict(_)));
        assert!(err.is_transient());

        let tx = store.begin().unwrap();
        assert_eq!(tx.get("Trigger", "db/t1").unwrap().unwrap()["statement"], "NEW");
        assert_eq!(store.commit_count(), 2);
    }

    #[test]
    fn scan_conflicts_with_new_records_under_the_prefix() {
        let store = MemorySystemStore::new();
        let mut drop_all = store.begin().unwrap();
        assert!(drop_all.scan("Trigger", "db/").unwrap().is_empty());

        let mut install = store.begin().unwrap();
        install.put("Trigger", "db/t1", props("S")).unwrap();
        install.commit().unwrap();

        drop_all.put("Meta", "db", Properties::new()).unwrap();
        assert!(drop_all.commit().is_err());
    }

    #[test]
    fn blind_writes_do_not_conflict() {
        let store = MemorySystemStore::new();
        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();
        first.put("Meta", "db", props("1")).unwrap();
        second.put("Meta", "db", props("2")).unwrap();
        first.commit().unwrap();
        second.commit().unwrap();
    }

    #[test]
    fn writable_flag() {
        let store = MemorySystemStore::new();
        assert!(store.is_writable());
        store.set_writable(false);
        assert!(!store.is_writable());
    }
}
