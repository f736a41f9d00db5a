//! sled-backed system store.
//!
//! All records live in a single sled `Tree` so one `apply_batch` commits a
//! transaction atomically across labels. sled locks its directory to one
//! process, so a commit mutex is enough to make read validation and the
//! batch a single step.

use crate::error::TrigxResult;
use crate::storage::{
    Properties, ReadSet, SystemStore, SystemTransaction, WriteBuffer, decode_props, decode_rows,
    encode_key, encode_props,
};
use parking_lot::Mutex;
use std::path::Path;

const SYSTEM_TREE: &str = "system";

/// Durable system store.
pub struct SledSystemStore {
    db: sled::Db,
    tree: sled::Tree,
    commit_lock: Mutex<()>,
}

impl SledSystemStore {
    /// Open the store at the given directory path.
    pub fn open(path: &Path) -> TrigxResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// Open a temporary store (for testing). Data is deleted on drop.
    pub fn open_temporary() -> TrigxResult<Self> {
        let config = sled::Config::new().temporary(true);
        Self::from_db(config.open()?)
    }

    fn from_db(db: sled::Db) -> TrigxResult<Self> {
        let tree = db.open_tree(SYSTEM_TREE)?;
        Ok(Self {
            db,
            tree,
            commit_lock: Mutex::new(()),
        })
    }

    /// Flush to disk.
    pub fn flush(&self) -> TrigxResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl SystemStore for SledSystemStore {
    fn begin(&self) -> TrigxResult<Box<dyn SystemTransaction + '_>> {
        Ok(Box::new(SledSystemTransaction {
            tree: &self.tree,
            commit_lock: &self.commit_lock,
            buffer: WriteBuffer::default(),
            reads: ReadSet::default(),
        }))
    }
}

struct SledSystemTransaction<'a> {
    tree: &'a sled::Tree,
    commit_lock: &'a Mutex<()>,
    buffer: WriteBuffer,
    reads: ReadSet,
}

fn prefix_rows(tree: &sled::Tree, prefix: &[u8]) -> TrigxResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut rows = Vec::new();
    for item in tree.scan_prefix(prefix) {
        let (k, v) = item?;
        rows.push((k.to_vec(), v.to_vec()));
    }
    Ok(rows)
}

impl SystemTransaction for SledSystemTransaction<'_> {
    fn get(&self, label: &str, key: &str) -> TrigxResult<Option<Properties>> {
        let raw_key = encode_key(label, key);
        if let Some(buffered) = self.buffer.get(&raw_key) {
            return buffered.as_deref().map(decode_props).transpose();
        }
        let committed = self.tree.get(&raw_key)?;
        self.reads.record_get(&raw_key, committed.as_deref());
        committed.map(|ivec| decode_props(&ivec)).transpose()
    }

    fn scan(&self, label: &str, prefix: &str) -> TrigxResult<Vec<(String, Properties)>> {
        let raw_prefix = encode_key(label, prefix);
        let committed = prefix_rows(self.tree, &raw_prefix)?;
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
        let SledSystemTransaction {
            tree,
            commit_lock,
            buffer,
            reads,
        } = *self;
        if buffer.is_empty() {
            return Ok(());
        }
        let _guard = commit_lock.lock();
        reads.validate(
            |key| Ok(tree.get(key)?.map(|ivec| ivec.to_vec())),
            |prefix| prefix_rows(tree, prefix),
        )?;
        let mut batch = sled::Batch::default();
        for (key, value) in buffer.into_writes() {
            match value {
                Some(v) => batch.insert(key, v),
                None => batch.remove(key),
            }
        }
        tree.apply_batch(batch)?;
        tree.flush()?;
        Ok(())
    }
}
