//! Multi-database front door
//!
//! Holds one started coordinator per target database and routes
//! administrative calls to it by name.

use crate::config::TriggerConfig;
use crate::coordinator::{Collaborators, SYSTEM_DATABASE, TriggerCoordinator};
use crate::error::{TrigxError, TrigxResult};
use crate::host::Params;
use crate::trigger::{TriggerChange, TriggerSnapshot};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TriggerService {
    config: TriggerConfig,
    coordinators: DashMap<String, Arc<TriggerCoordinator>>,
}

impl TriggerService {
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            config,
            coordinators: DashMap::new(),
        }
    }

    /// Build and start a coordinator for `database`; returns the existing one if present.
    ///
    /// Starting does store I/O, so it happens before the map is locked. If two
    /// callers race, the loser's coordinator is stopped and the winner's returned.
    pub fn add_database(
        &self,
        database: &str,
        collaborators: Collaborators,
    ) -> TrigxResult<Arc<TriggerCoordinator>> {
        if let Some(existing) = self.coordinators.get(database) {
            debug!(database, "coordinator already running");
            return Ok(Arc::clone(existing.value()));
        }

        let coordinator = Arc::new(TriggerCoordinator::new(
            database,
            self.config.clone(),
            collaborators,
        )?);
        coordinator.start()?;

        let winner = match self.coordinators.entry(database.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&coordinator));
                info!(database, "trigger coordinator added");
                return Ok(coordinator);
            }
        };
        debug!(database, "lost coordinator start race, discarding duplicate");
        coordinator.stop()?;
        Ok(winner)
    }

    /// Stop and forget the coordinator for `database`.
    pub fn remove_database(&self, database: &str) -> TrigxResult<()> {
        let (_, coordinator) = self
            .coordinators
            .remove(database)
            .ok_or_else(|| TrigxError::DatabaseNotFound(database.to_string()))?;
        coordinator.stop()?;
        info!(database, "trigger coordinator removed");
        Ok(())
    }

    pub fn coordinator(&self, database: &str) -> TrigxResult<Arc<TriggerCoordinator>> {
        if database == SYSTEM_DATABASE {
            return Err(TrigxError::SystemDatabase(database.to_string()));
        }
        self.coordinators
            .get(database)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TrigxError::DatabaseNotFound(database.to_string()))
    }

    /// Served databases, sorted.
    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.coordinators.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn install(
        &self,
        database: &str,
        name: &str,
        statement: &str,
        selector: Params,
        params: Params,
    ) -> TrigxResult<TriggerChange> {
        self.coordinator(database)?
            .install(database, name, statement, selector, params)
    }

    pub fn drop_trigger(&self, database: &str, name: &str) -> TrigxResult<TriggerChange> {
        self.coordinator(database)?.drop_trigger(database, name)
    }

    pub fn drop_all(&self, database: &str) -> TrigxResult<Vec<TriggerChange>> {
        self.coordinator(database)?.drop_all(database)
    }

    pub fn update_paused(&self, database: &str, name: &str, paused: bool) -> TrigxResult<TriggerChange> {
        self.coordinator(database)?
            .update_paused(database, name, paused)
    }

    pub fn pause(&self, database: &str, name: &str) -> TrigxResult<TriggerChange> {
        self.update_paused(database, name, true)
    }

    pub fn resume(&self, database: &str, name: &str) -> TrigxResult<TriggerChange> {
        self.update_paused(database, name, false)
    }

    pub fn list(&self, database: &str) -> TrigxResult<Arc<TriggerSnapshot>> {
        self.coordinator(database)?.list(database)
    }

    pub fn show(&self, database: &str) -> TrigxResult<TriggerSnapshot> {
        self.coordinator(database)?.show(database)
    }

    /// Stop every coordinator. Keeps going past failures and returns the first.
    pub fn shutdown(&self) -> TrigxResult<()> {
        let mut first_error = None;
        for database in self.databases() {
            let Some((_, coordinator)) = self.coordinators.remove(&database) else {
                continue;
            };
            if let Err(e) = coordinator.stop() {
                warn!(database = %database, error = %e, "failed to stop trigger coordinator");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryHost;
    use crate::storage::SystemStore;
    use crate::storage::memory_store::MemorySystemStore;
    use serde_json::json;

    fn service_with(databases: &[&str]) -> (Arc<dyn SystemStore>, Vec<MemoryHost>, TriggerService) {
        let system: Arc<dyn SystemStore> = Arc::new(MemorySystemStore::new());
        let service = TriggerService::new(TriggerConfig {
            async_pool_size: 2,
            ..TriggerConfig::default()
        });
        let hosts: Vec<MemoryHost> = databases.iter().map(|db| MemoryHost::new(*db)).collect();
        for (db, host) in databases.iter().zip(&hosts) {
            service
                .add_database(db, Collaborators::in_memory(host, Arc::clone(&system)))
                .unwrap();
        }
        (system, hosts, service)
    }

    fn after() -> Params {
        let mut map = Params::new();
        map.insert("phase".into(), json!("after"));
        map
    }

    #[test]
    fn routes_by_database() {
        let (_, hosts, service) = service_with(&["neo4j", "sales"]);
        assert_eq!(service.databases(), vec!["neo4j", "sales"]);

        service
            .install("sales", "audit", "INCR audited", after(), Params::new())
            .unwrap();
        assert!(service.list("neo4j").unwrap().is_empty());
        assert_eq!(service.list("sales").unwrap().names(), vec!["audit"]);

        hosts[1].write(&[("order", json!(1))]).unwrap();
        hosts[0].write(&[("order", json!(1))]).unwrap();
        assert_eq!(hosts[1].counter("audited"), 1);
        assert_eq!(hosts[0].counter("audited"), 0);
        service.shutdown().unwrap();
    }

    #[test]
    fn unknown_and_system_databases() {
        let (_, _, service) = service_with(&["neo4j"]);
        assert!(matches!(
            service.list("missing"),
            Err(TrigxError::DatabaseNotFound(_))
        ));
        assert!(matches!(
            service.install("system", "t", "INCR x", Params::new(), Params::new()),
            Err(TrigxError::SystemDatabase(_))
        ));
        service.shutdown().unwrap();
    }

    #[test]
    fn add_is_idempotent_and_remove_stops() {
        let (system, hosts, service) = service_with(&["neo4j"]);
        let again = service
            .add_database("neo4j", Collaborators::in_memory(&hosts[0], system))
            .unwrap();
        assert!(Arc::ptr_eq(&again, &service.coordinator("neo4j").unwrap()));

        service
            .install("neo4j", "t1", "INCR x", after(), Params::new())
            .unwrap();
        assert_eq!(hosts[0].listener_count(), 1);

        service.remove_database("neo4j").unwrap();
        assert_eq!(hosts[0].listener_count(), 0);
        assert!(service.databases().is_empty());
        assert!(matches!(
            service.remove_database("neo4j"),
            Err(TrigxError::DatabaseNotFound(_))
        ));
    }

    #[test]
    fn racing_adds_share_one_coordinator() {
        let system: Arc<dyn SystemStore> = Arc::new(MemorySystemStore::new());
        let host = MemoryHost::new("neo4j");
        let service = Arc::new(TriggerService::new(TriggerConfig {
            async_pool_size: 1,
            ..TriggerConfig::default()
        }));
        assert!(matches!(
            service.install("neo4j", "t1", "INCR x", after(), Params::new()),
            Err(TrigxError::DatabaseNotFound(_))
        ));

        let adders: Vec<_> = (0..4)
            .map(|_| {
                let service = Arc::clone(&service);
                let collaborators = Collaborators::in_memory(&host, Arc::clone(&system));
                std::thread::spawn(move || service.add_database("neo4j", collaborators).unwrap())
            })
            .collect();
        let added: Vec<Arc<TriggerCoordinator>> =
            adders.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(added.iter().all(|c| Arc::ptr_eq(c, &added[0])));
        assert_eq!(service.databases(), vec!["neo4j"]);

        service
            .install("neo4j", "t1", "INCR x", after(), Params::new())
            .unwrap();
        host.write(&[("name", json!("Ada"))]).unwrap();
        assert_eq!(host.counter("x"), 1);
        assert_eq!(host.listener_count(), 1);
        service.shutdown().unwrap();
    }

    #[test]
    fn pause_and_resume_route_through() {
        let (_, _, service) = service_with(&["neo4j"]);
        service
            .install("neo4j", "t1", "INCR x", after(), Params::new())
            .unwrap();
        assert!(service.pause("neo4j", "t1").unwrap().current.unwrap().paused);
        assert!(!service.resume("neo4j", "t1").unwrap().current.unwrap().paused);
        assert_eq!(service.show("neo4j").unwrap().names(), vec!["t1"]);
        assert_eq!(service.drop_all("neo4j").unwrap().len(), 1);
        assert!(service.drop_trigger("neo4j", "t1").unwrap().previous.is_none());
        service.shutdown().unwrap();
    }
}
