//! Trigger persistence
//!
//! One `Trigger` record per definition, keyed `"{database}/{name}"`, and one
//! `TriggerMeta` record per database holding `lastUpdated`. Every operation
//! runs in its own system-store transaction under the retry policy.

use super::definition::{Selector, TriggerDefinition};
use super::snapshot::TriggerSnapshot;
use crate::clock::Clock;
use crate::error::{TrigxError, TrigxResult};
use crate::host::Params;
use crate::retry::RetryPolicy;
use crate::storage::{Properties, SystemStore, SystemTransaction};
use std::sync::Arc;
use tracing::warn;

pub const TRIGGER_LABEL: &str = "Trigger";
pub const META_LABEL: &str = "TriggerMeta";

const PROP_DATABASE: &str = "database";
const PROP_NAME: &str = "name";
const PROP_STATEMENT: &str = "statement";
const PROP_SELECTOR: &str = "selector";
const PROP_PARAMS: &str = "params";
const PROP_PAUSED: &str = "paused";
const PROP_LAST_UPDATED: &str = "lastUpdated";

fn record_prefix(database: &str) -> String {
    format!("{database}/")
}

fn record_key(database: &str, name: &str) -> String {
    format!("{database}/{name}")
}

pub(crate) fn encode_definition(database: &str, def: &TriggerDefinition) -> TrigxResult<Properties> {
    let mut props = Properties::new();
    props.insert(PROP_DATABASE.into(), database.to_string());
    props.insert(PROP_NAME.into(), def.name.clone());
    props.insert(PROP_STATEMENT.into(), def.statement.clone());
    props.insert(
        PROP_SELECTOR.into(),
        serde_json::to_string(&def.selector.to_map())?,
    );
    props.insert(PROP_PARAMS.into(), serde_json::to_string(&def.params)?);
    props.insert(PROP_PAUSED.into(), def.paused.to_string());
    Ok(props)
}

pub(crate) fn decode_definition(props: &Properties) -> TrigxResult<TriggerDefinition> {
    let field = |key: &str| {
        props
            .get(key)
            .ok_or_else(|| TrigxError::Serialization(format!("trigger record is missing '{key}'")))
    };
    let selector: Params = serde_json::from_str(field(PROP_SELECTOR)?)?;
    let params: Params = serde_json::from_str(field(PROP_PARAMS)?)?;
    Ok(TriggerDefinition {
        name: field(PROP_NAME)?.clone(),
        statement: field(PROP_STATEMENT)?.clone(),
        selector: Selector::from_map(selector)?,
        params,
        paused: field(PROP_PAUSED)? == "true",
    })
}

/// Typed view of one database's trigger records inside a write transaction.
pub struct TriggerRecords<'a> {
    tx: &'a mut dyn SystemTransaction,
    database: &'a str,
}

impl TriggerRecords<'_> {
    pub fn get(&self, name: &str) -> TrigxResult<Option<TriggerDefinition>> {
        self.tx
            .get(TRIGGER_LABEL, &record_key(self.database, name))?
            .map(|props| decode_definition(&props))
            .transpose()
    }

    pub fn all(&self) -> TrigxResult<Vec<TriggerDefinition>> {
        scan_definitions(&*self.tx, self.database)
    }

    pub fn put(&mut self, def: &TriggerDefinition) -> TrigxResult<()> {
        let props = encode_definition(self.database, def)?;
        self.tx
            .put(TRIGGER_LABEL, &record_key(self.database, &def.name), props)
    }

    /// Delete a definition, returning what was there.
    pub fn remove(&mut self, name: &str) -> TrigxResult<Option<TriggerDefinition>> {
        let previous = self.get(name)?;
        if previous.is_some() {
            self.tx
                .remove(TRIGGER_LABEL, &record_key(self.database, name))?;
        }
        Ok(previous)
    }
}

fn scan_definitions(tx: &dyn SystemTransaction, database: &str) -> TrigxResult<Vec<TriggerDefinition>> {
    let mut definitions = Vec::new();
    for (key, props) in tx.scan(TRIGGER_LABEL, &record_prefix(database))? {
        if props.get(PROP_DATABASE).map(String::as_str) != Some(database) {
            continue;
        }
        match decode_definition(&props) {
            Ok(def) => definitions.push(def),
            Err(e) => warn!(database, record = %key, error = %e, "skipping unreadable trigger record"),
        }
    }
    Ok(definitions)
}

/// Persistence accessor for trigger definitions.
pub struct TriggerStore {
    store: Arc<dyn SystemStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl TriggerStore {
    pub fn new(store: Arc<dyn SystemStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    /// Load every definition of `database` into a fresh snapshot.
    pub fn read(&self, database: &str) -> TrigxResult<TriggerSnapshot> {
        self.retry.run(&*self.clock, "trigger.read", || {
            let tx = self.store.begin()?;
            let definitions = scan_definitions(&*tx, database)?;
            Ok(TriggerSnapshot::from_definitions(definitions))
        })
    }

    /// Run `mutation` and stamp `lastUpdated` in one committed transaction.
    ///
    /// The mutation may run more than once if the store is unavailable.
    pub fn write<T, F>(&self, database: &str, mut mutation: F) -> TrigxResult<T>
    where
        F: FnMut(&mut TriggerRecords<'_>) -> TrigxResult<T>,
    {
        if !self.store.is_writable() {
            return Err(TrigxError::NotWritable(format!(
                "cannot modify triggers of '{database}' from a read-only member"
            )));
        }
        self.retry.run(&*self.clock, "trigger.write", || {
            let mut tx = self.store.begin()?;
            let out = {
                let mut records = TriggerRecords {
                    tx: tx.as_mut(),
                    database,
                };
                mutation(&mut records)?
            };
            let mut meta = Properties::new();
            meta.insert(
                PROP_LAST_UPDATED.into(),
                self.clock.now_millis().to_string(),
            );
            tx.put(META_LABEL, database, meta)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Millisecond stamp of the last write to `database`, 0 if never written.
    pub fn read_last_updated(&self, database: &str) -> TrigxResult<u64> {
        self.retry.run(&*self.clock, "trigger.lastUpdated", || {
            let tx = self.store.begin()?;
            let stamp = tx
                .get(META_LABEL, database)?
                .and_then(|props| props.get(PROP_LAST_UPDATED).and_then(|v| v.parse().ok()))
                .unwrap_or(0);
            Ok(stamp)
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
