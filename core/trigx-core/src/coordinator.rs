//! Per-database trigger coordinator
//!
//! Owns the snapshot cache, the event hooks and the refresh job for a single
//! database, and exposes the administrative operations. Every mutation is
//! written to the administrative store and followed by a synchronous refresh,
//! so a `list` right after `install` sees the new definition.

use crate::clock::{Clock, SystemClock};
use crate::config::TriggerConfig;
use crate::error::{TrigxError, TrigxResult};
use crate::host::memory::{MemoryHost, MemoryStatementRunner};
use crate::host::{HostDatabase, Params, StatementRunner, TransactionEventListener, TransactionEvents};
use crate::storage::SystemStore;
use crate::trigger::{
    AsyncRunner, ExecutionMetrics, JobHandle, PhaseExecutor, RecurringScheduler, RefreshScheduler,
    RegistrationReconciler, Selector, SnapshotReader, ThreadScheduler, TriggerCache, TriggerChange,
    TriggerDefinition, TriggerHooks, TriggerSnapshot, TriggerStore,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// The administrative database; triggers cannot target it.
pub const SYSTEM_DATABASE: &str = "system";

/// How long `stop` waits for queued `afterAsync` batches.
const ASYNC_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Host services a coordinator is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub system_store: Arc<dyn SystemStore>,
    pub host: Arc<dyn HostDatabase>,
    pub events: Arc<dyn TransactionEvents>,
    pub runner: Arc<dyn StatementRunner>,
    pub scheduler: Arc<dyn RecurringScheduler>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Wire an in-memory host with the thread scheduler and system clock.
    pub fn in_memory(host: &MemoryHost, system_store: Arc<dyn SystemStore>) -> Self {
        Self {
            system_store,
            host: Arc::new(host.clone()),
            events: Arc::new(host.clone()),
            runner: Arc::new(MemoryStatementRunner),
            scheduler: Arc::new(ThreadScheduler),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn RecurringScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct TriggerCoordinator {
    database: String,
    config: TriggerConfig,
    store: Arc<TriggerStore>,
    cache: Arc<TriggerCache>,
    hooks: Arc<TriggerHooks>,
    refresher: Arc<RefreshScheduler>,
    scheduler: Arc<dyn RecurringScheduler>,
    job: Mutex<Option<JobHandle>>,
}

impl TriggerCoordinator {
    pub fn new(
        database: impl Into<String>,
        config: TriggerConfig,
        collaborators: Collaborators,
    ) -> TrigxResult<Self> {
        let database = database.into();
        if database == SYSTEM_DATABASE {
            return Err(TrigxError::SystemDatabase(database));
        }
        if collaborators.host.name() != database {
            return Err(TrigxError::WrongDatabase {
                expected: database,
                actual: collaborators.host.name().to_string(),
            });
        }

        let store = Arc::new(TriggerStore::new(
            collaborators.system_store,
            collaborators.clock,
            config.retry.clone(),
        ));
        let reader = SnapshotReader::new();
        let hooks = Arc::new(TriggerHooks::new(
            database.clone(),
            reader.clone(),
            Arc::new(PhaseExecutor::new(collaborators.runner)),
            Arc::new(AsyncRunner::new(config.async_pool_size)?),
            collaborators.host,
        ));
        let listener: Arc<dyn TransactionEventListener> = hooks.clone();
        let reconciler = RegistrationReconciler::new(database.clone(), collaborators.events, listener);
        let cache = Arc::new(TriggerCache::new(
            database.clone(),
            reader,
            Arc::clone(&store),
            reconciler,
            config.cache_refresh_attempts,
        ));
        let refresher = Arc::new(RefreshScheduler::new(
            database.clone(),
            Arc::clone(&store),
            Arc::clone(&cache),
        ));

        Ok(Self {
            database,
            config,
            store,
            cache,
            hooks,
            refresher,
            scheduler: collaborators.scheduler,
            job: Mutex::new(None),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    /// Load the current definitions and schedule the periodic refresh.
    ///
    /// With triggers disabled this does nothing and the host is never
    /// registered with.
    #[instrument(skip(self), fields(database = %self.database))]
    pub fn start(&self) -> TrigxResult<()> {
        if !self.config.enabled {
            info!("triggers disabled, not starting");
            return Ok(());
        }
        let mut job = self.job.lock();
        if job.is_some() {
            return Ok(());
        }
        self.cache.refresh()?;
        *job = Some(Arc::clone(&self.refresher).start(
            &*self.scheduler,
            self.config.initial_refresh_delay(),
            self.config.refresh_interval(),
        )?);
        info!(triggers = self.cache.get().len(), "trigger coordinator started");
        Ok(())
    }

    /// Cancel the refresh job, drain queued async batches and unregister.
    #[instrument(skip(self), fields(database = %self.database))]
    pub fn stop(&self) -> TrigxResult<()> {
        if let Some(job) = self.job.lock().take() {
            job.cancel();
        }
        if !self.hooks.async_runner().quiesce(ASYNC_DRAIN_TIMEOUT) {
            warn!(
                in_flight = self.hooks.async_runner().in_flight(),
                "stopping with afterAsync triggers still running"
            );
        }
        self.cache.release()?;
        info!("trigger coordinator stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.job.lock().is_some()
    }

    fn check(&self, database: &str) -> TrigxResult<()> {
        if !self.config.enabled {
            return Err(TrigxError::TriggersDisabled);
        }
        if database != self.database {
            return Err(TrigxError::WrongDatabase {
                expected: self.database.clone(),
                actual: database.to_string(),
            });
        }
        Ok(())
    }

    /// Create or replace a trigger. Installing always leaves it unpaused.
    #[instrument(skip(self, statement, selector, params))]
    pub fn install(
        &self,
        database: &str,
        name: &str,
        statement: &str,
        selector: Params,
        params: Params,
    ) -> TrigxResult<TriggerChange> {
        self.check(database)?;
        let definition = TriggerDefinition::new(name, statement)
            .with_selector(Selector::from_map(selector)?)
            .with_params(params);
        definition.validate()?;

        let previous = self.store.write(database, |records| {
            let previous = records.get(name)?;
            records.put(&definition)?;
            Ok(previous)
        })?;
        self.cache.refresh()?;

        info!(phase = %definition.phase(), replaced = previous.is_some(), "trigger installed");
        Ok(TriggerChange {
            name: name.to_string(),
            previous,
            current: Some(definition),
        })
    }

    /// Remove a trigger. Dropping an unknown name reports no previous definition.
    #[instrument(skip(self))]
    pub fn drop_trigger(&self, database: &str, name: &str) -> TrigxResult<TriggerChange> {
        self.check(database)?;
        let previous = self.store.write(database, |records| records.remove(name))?;
        self.cache.refresh()?;
        self.hooks.executor().retain_metrics(&self.cache.get());

        info!(existed = previous.is_some(), "trigger dropped");
        Ok(TriggerChange {
            name: name.to_string(),
            previous,
            current: None,
        })
    }

    /// Remove every trigger of `database`, in name order.
    #[instrument(skip(self))]
    pub fn drop_all(&self, database: &str) -> TrigxResult<Vec<TriggerChange>> {
        self.check(database)?;
        let removed = self.store.write(database, |records| {
            let mut removed = Vec::new();
            for definition in records.all()? {
                if let Some(previous) = records.remove(&definition.name)? {
                    removed.push(previous);
                }
            }
            Ok(removed)
        })?;
        self.cache.refresh()?;
        self.hooks.executor().retain_metrics(&self.cache.get());

        info!(count = removed.len(), "all triggers dropped");
        let mut changes: Vec<TriggerChange> = removed
            .into_iter()
            .map(|previous| TriggerChange {
                name: previous.name.clone(),
                previous: Some(previous),
                current: None,
            })
            .collect();
        changes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(changes)
    }

    /// Set the paused flag. An unknown name changes nothing.
    #[instrument(skip(self))]
    pub fn update_paused(&self, database: &str, name: &str, paused: bool) -> TrigxResult<TriggerChange> {
        self.check(database)?;
        let (previous, current) = self.store.write(database, |records| {
            let Some(previous) = records.get(name)? else {
                return Ok((None, None));
            };
            let current = previous.clone().with_paused(paused);
            records.put(&current)?;
            Ok((Some(previous), Some(current)))
        })?;
        self.cache.refresh()?;

        if current.is_none() {
            warn!("no such trigger");
        }
        Ok(TriggerChange {
            name: name.to_string(),
            previous,
            current,
        })
    }

    pub fn pause(&self, database: &str, name: &str) -> TrigxResult<TriggerChange> {
        self.update_paused(database, name, true)
    }

    pub fn resume(&self, database: &str, name: &str) -> TrigxResult<TriggerChange> {
        self.update_paused(database, name, false)
    }

    /// The locally cached snapshot.
    pub fn list(&self, database: &str) -> TrigxResult<Arc<TriggerSnapshot>> {
        self.check(database)?;
        Ok(self.cache.get())
    }

    /// Definitions as stored, bypassing the cache.
    pub fn show(&self, database: &str) -> TrigxResult<TriggerSnapshot> {
        self.check(database)?;
        self.store.read(database)
    }

    /// Force a reload. `Ok(false)` when the swap lost to concurrent refreshes.
    pub fn refresh(&self) -> TrigxResult<bool> {
        if !self.config.enabled {
            return Err(TrigxError::TriggersDisabled);
        }
        self.cache.refresh()
    }

    /// Refresh only if the store changed since the last applied snapshot.
    pub fn refresh_if_changed(&self) -> TrigxResult<bool> {
        if !self.config.enabled {
            return Err(TrigxError::TriggersDisabled);
        }
        self.refresher.tick()
    }

    pub fn is_registered(&self) -> bool {
        self.cache.is_registered()
    }

    /// Execution counters of the triggers currently cached.
    pub fn metrics(&self) -> ExecutionMetrics {
        let executor = self.hooks.executor();
        executor.retain_metrics(&self.cache.get());
        executor.metrics()
    }

    /// The listener registered with the host.
    pub fn hooks(&self) -> &Arc<TriggerHooks> {
        &self.hooks
    }

    /// Wait for queued `afterAsync` batches. Returns false on timeout.
    pub fn quiesce(&self, timeout: Duration) -> bool {
        self.hooks.async_runner().quiesce(timeout)
    }
}

impl Drop for TriggerCoordinator {
    fn drop(&mut self) {
        if let Some(job) = self.job.get_mut().take() {
            job.cancel();
        }
        // The host holds the hooks, not us; without this they outlive the coordinator
        if let Err(e) = self.cache.release() {
            warn!(database = %self.database, error = %e, "failed to unregister dropped trigger coordinator");
        }
    }
}
