//! Transaction event hooks
//!
//! The listener registered with the host. Each callback reads the published
//! snapshot once and hands the eligible triggers to the executor.
//!
//! Transactions opened here to run `after`, `afterAsync` and `rollback`
//! triggers carry [`TRIGGER_TX_KEY`] in their metadata. The after-commit and
//! after-rollback hooks return immediately for such transactions, so a
//! trigger's own writes never fire the same hooks again.

use super::async_runner::AsyncRunner;
use super::cache::SnapshotReader;
use super::definition::Phase;
use super::executor::PhaseExecutor;
use super::snapshot::TriggerSnapshot;
use crate::error::TrigxResult;
use crate::host::{HostDatabase, HostTransaction, Params, TransactionData, TransactionEventListener};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

/// Metadata key stamped on every transaction the trigger engine opens.
pub const TRIGGER_TX_KEY: &str = "trigx.trigger";

pub fn tag(tx: &mut dyn HostTransaction) {
    tx.set_metadata(TRIGGER_TX_KEY, Value::Bool(true));
}

pub fn is_tagged(metadata: &Params) -> bool {
    metadata
        .get(TRIGGER_TX_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Execution context for one observed transaction: the change-set, then
/// `transactionId`, `commitTime` and `metaData`.
pub fn context_params(data: &TransactionData) -> Params {
    let mut params = data.changes.clone();
    params.insert("transactionId".to_string(), Value::from(data.tx_id));
    params.insert(
        "commitTime".to_string(),
        data.commit_time.map(Value::from).unwrap_or(Value::Null),
    );
    params.insert(
        "metaData".to_string(),
        Value::Object(data.metadata.clone().into_iter().collect()),
    );
    params
}

/// Open a tagged transaction, run `phase` in it and commit.
///
/// The transaction commits even when some triggers failed; the aggregate
/// failure is returned afterwards.
fn run_in_own_transaction(
    host: &dyn HostDatabase,
    executor: &PhaseExecutor,
    phase: Phase,
    snapshot: &TriggerSnapshot,
    context: &Params,
) -> TrigxResult<()> {
    let mut tx = host.begin()?;
    tag(tx.as_mut());
    let outcome = executor.execute(phase, snapshot, tx.as_mut(), context);
    tx.commit()?;
    outcome.into_result()?;
    Ok(())
}

pub struct TriggerHooks {
    database: String,
    reader: SnapshotReader,
    executor: Arc<PhaseExecutor>,
    async_runner: Arc<AsyncRunner>,
    host: Arc<dyn HostDatabase>,
}

impl TriggerHooks {
    pub fn new(
        database: impl Into<String>,
        reader: SnapshotReader,
        executor: Arc<PhaseExecutor>,
        async_runner: Arc<AsyncRunner>,
        host: Arc<dyn HostDatabase>,
    ) -> Self {
        Self {
            database: database.into(),
            reader,
            executor,
            async_runner,
            host,
        }
    }

    pub fn executor(&self) -> &Arc<PhaseExecutor> {
        &self.executor
    }

    pub fn async_runner(&self) -> &Arc<AsyncRunner> {
        &self.async_runner
    }

    /// Queue the `afterAsync` phase; failures are only logged.
    fn run_async(&self, snapshot: Arc<TriggerSnapshot>, context: Params) {
        let database = self.database.clone();
        let host = Arc::clone(&self.host);
        let executor = Arc::clone(&self.executor);
        self.async_runner.submit(move || {
            let result =
                run_in_own_transaction(&*host, &executor, Phase::AfterAsync, &snapshot, &context);
            if let Err(e) = result {
                error!(database = %database, error = %e, "afterAsync triggers failed");
            }
        });
    }
}

impl TransactionEventListener for TriggerHooks {
    fn before_commit(&self, data: &TransactionData, tx: &mut dyn HostTransaction) -> TrigxResult<()> {
        let snapshot = self.reader.get();
        if !PhaseExecutor::has_phase(&snapshot, Phase::Before) {
            return Ok(());
        }
        let context = context_params(data);
        self.executor
            .execute(Phase::Before, &snapshot, tx, &context)
            .into_result()?;
        Ok(())
    }

    fn after_commit(&self, data: &TransactionData) -> TrigxResult<()> {
        if is_tagged(&data.metadata) {
            return Ok(());
        }
        let snapshot = self.reader.get();
        let run_after = PhaseExecutor::has_phase(&snapshot, Phase::After);
        let run_async = PhaseExecutor::has_phase(&snapshot, Phase::AfterAsync);
        if !run_after && !run_async {
            return Ok(());
        }

        let context = context_params(data);
        let result = if run_after {
            run_in_own_transaction(&*self.host, &self.executor, Phase::After, &snapshot, &context)
        } else {
            Ok(())
        };
        if run_async {
            debug!(database = %self.database, tx_id = data.tx_id, "queueing afterAsync triggers");
            self.run_async(snapshot, context);
        }
        result
    }

    fn after_rollback(&self, data: &TransactionData) -> TrigxResult<()> {
        if is_tagged(&data.metadata) {
            return Ok(());
        }
        let snapshot = self.reader.get();
        if !PhaseExecutor::has_phase(&snapshot, Phase::Rollback) {
            return Ok(());
        }
        let context = context_params(data);
        run_in_own_transaction(&*self.host, &self.executor, Phase::Rollback, &snapshot, &context)
    }
}
