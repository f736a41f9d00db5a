//! Phase executor
//!
//! Runs every eligible trigger of one phase against a transaction. A failing
//! trigger is recorded and skipped; its siblings still run.

use super::definition::{Phase, TriggerDefinition};
use super::snapshot::TriggerSnapshot;
use crate::error::{TriggerFailure, TriggerFailures};
use crate::host::{HostTransaction, Params, StatementRunner};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Parameter key carrying the trigger's own name.
pub const TRIGGER_PARAM: &str = "trigger";

/// One successful trigger run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRun {
    pub trigger: String,
    pub rows: u64,
}

/// Everything that happened in one phase execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub executed: Vec<TriggerRun>,
    pub failures: Vec<TriggerFailure>,
}

impl PhaseOutcome {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            executed: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Successful runs, or one aggregate naming every failed trigger.
    pub fn into_result(self) -> Result<Vec<TriggerRun>, TriggerFailures> {
        if self.failures.is_empty() {
            Ok(self.executed)
        } else {
            Err(TriggerFailures {
                phase: self.phase,
                failures: self.failures,
            })
        }
    }
}

/// Statement parameters: context, then the trigger's params, then its name.
pub fn build_params(context: &Params, def: &TriggerDefinition) -> Params {
    let mut params = context.clone();
    params.extend(def.params.iter().map(|(k, v)| (k.clone(), v.clone())));
    params.insert(TRIGGER_PARAM.to_string(), Value::String(def.name.clone()));
    params
}

pub struct PhaseExecutor {
    runner: Arc<dyn StatementRunner>,
    metrics: Mutex<ExecutionMetrics>,
}

impl PhaseExecutor {
    pub fn new(runner: Arc<dyn StatementRunner>) -> Self {
        Self {
            runner,
            metrics: Mutex::new(ExecutionMetrics::new()),
        }
    }

    /// Cheap pre-check so hooks can skip all work for an unused phase.
    pub fn has_phase(snapshot: &TriggerSnapshot, phase: Phase) -> bool {
        snapshot.has_phase(phase)
    }

    pub fn execute(
        &self,
        phase: Phase,
        snapshot: &TriggerSnapshot,
        tx: &mut dyn HostTransaction,
        context: &Params,
    ) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::new(phase);
        if !snapshot.has_phase(phase) {
            return outcome;
        }

        for def in snapshot.eligible(phase) {
            let params = build_params(context, def);
            let start = Instant::now();
            let result = self.runner.run(&def.statement, &params, tx);
            self.metrics
                .lock()
                .record(&def.name, start.elapsed(), result.is_ok());

            match result {
                Ok(rows) => {
                    debug!(trigger = %def.name, %phase, rows, "trigger executed");
                    outcome.executed.push(TriggerRun {
                        trigger: def.name.clone(),
                        rows,
                    });
                }
                Err(e) => {
                    warn!(trigger = %def.name, %phase, error = %e, "trigger failed");
                    outcome.failures.push(TriggerFailure {
                        trigger: def.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        outcome
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        self.metrics.lock().clone()
    }

    /// Drop metrics of triggers no longer in `snapshot`.
    pub fn retain_metrics(&self, snapshot: &TriggerSnapshot) {
        self.metrics.lock().retain(snapshot);
    }
}

/// Counters for one trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerStats {
    pub calls: u64,
    pub errors: u64,
    pub total: Duration,
}

/// Execution counters keyed by trigger name.
///
/// Entries for triggers that leave the snapshot are dropped by [`retain`](Self::retain).
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    triggers: BTreeMap<String, TriggerStats>,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, duration: Duration, success: bool) {
        let stats = self.triggers.entry(name.to_string()).or_default();
        stats.calls += 1;
        stats.total += duration;
        if !success {
            stats.errors += 1;
        }
    }

    pub fn get(&self, name: &str) -> Option<TriggerStats> {
        self.triggers.get(name).copied()
    }

    /// Names with recorded runs, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.triggers.keys().map(String::as_str).collect()
    }

    /// Forget every trigger not in `snapshot`.
    pub fn retain(&mut self, snapshot: &TriggerSnapshot) {
        self.triggers.retain(|name, _| snapshot.get(name).is_some());
    }

    pub fn avg_duration(&self, name: &str) -> Option<Duration> {
        let stats = self.triggers.get(name)?;
        if stats.calls == 0 {
            return None;
        }
        Some(stats.total.div_f64(stats.calls as f64))
    }

    pub fn success_rate(&self, name: &str) -> Option<f64> {
        let stats = self.triggers.get(name)?;
        if stats.calls == 0 {
            return None;
        }
        Some((stats.calls - stats.errors) as f64 / stats.calls as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TrigxError, TrigxResult};
    use crate::host::HostDatabase;
    use crate::host::memory::{MemoryHost, MemoryStatementRunner};
    use crate::trigger::Selector;
    use serde_json::json;

    /// Records every call; statements starting with "FAIL" error out.
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<(String, Params)>>,
    }

    impl StatementRunner for RecordingRunner {
        fn run(&self, statement: &str, params: &Params, _tx: &mut dyn HostTransaction) -> TrigxResult<u64> {
            self.calls.lock().push((statement.to_string(), params.clone()));
            if statement.starts_with("FAIL") {
                Err(TrigxError::StatementFailed(format!("{statement} exploded")))
            } else {
                Ok(1)
            }
        }
    }

    fn trigger(name: &str, statement: &str, phase: Phase) -> TriggerDefinition {
        TriggerDefinition::new(name, statement).with_selector(Selector::for_phase(phase))
    }

    #[test]
    fn runs_only_eligible_triggers_in_name_order() {
        let runner = Arc::new(RecordingRunner::default());
        let executor = PhaseExecutor::new(runner.clone());
        let snapshot = TriggerSnapshot::from_definitions(vec![
            trigger("b", "S-b", Phase::After),
            trigger("a", "S-a", Phase::After),
            trigger("c", "S-c", Phase::Before),
            trigger("d", "S-d", Phase::After).with_paused(true),
        ]);
        let host = MemoryHost::new("neo4j");
        let mut tx = host.begin().unwrap();

        let outcome = executor.execute(Phase::After, &snapshot, tx.as_mut(), &Params::new());

        assert!(outcome.is_success());
        let statements: Vec<String> = runner.calls.lock().iter().map(|(s, _)| s.clone()).collect();
        assert_eq!(statements, vec!["S-a", "S-b"]);
    }

    #[test]
    fn failures_are_isolated_and_aggregated() {
        let runner = Arc::new(RecordingRunner::default());
        let executor = PhaseExecutor::new(runner.clone());
        let snapshot = TriggerSnapshot::from_definitions(vec![
            trigger("t1", "OK", Phase::After),
            trigger("t2", "FAIL two", Phase::After),
            trigger("t3", "OK", Phase::After),
            trigger("t4", "FAIL four", Phase::After),
            trigger("t5", "OK", Phase::After),
        ]);
        let host = MemoryHost::new("neo4j");
        let mut tx = host.begin().unwrap();

        let outcome = executor.execute(Phase::After, &snapshot, tx.as_mut(), &Params::new());

        assert_eq!(runner.calls.lock().len(), 5);
        let ran: Vec<&str> = outcome.executed.iter().map(|r| r.trigger.as_str()).collect();
        assert_eq!(ran, vec!["t1", "t3", "t5"]);

        let failures = outcome.into_result().unwrap_err();
        assert_eq!(failures.phase, Phase::After);
        assert_eq!(failures.names(), vec!["t2", "t4"]);
        assert!(failures.failures[0].message.contains("FAIL two exploded"));
    }

    #[test]
    fn params_merge_context_definition_and_name() {
        let runner = Arc::new(RecordingRunner::default());
        let executor = PhaseExecutor::new(runner.clone());
        let mut def_params = Params::new();
        def_params.insert("limit".into(), json!(5));
        def_params.insert("transactionId".into(), json!("overridden"));
        let snapshot = TriggerSnapshot::from_definitions(vec![
            trigger("audit", "S", Phase::Before).with_params(def_params),
        ]);
        let mut context = Params::new();
        context.insert("transactionId".into(), json!(7));
        context.insert("commitTime".into(), json!(null));
        context.insert(TRIGGER_PARAM.into(), json!("spoofed"));

        let host = MemoryHost::new("neo4j");
        let mut tx = host.begin().unwrap();
        executor.execute(Phase::Before, &snapshot, tx.as_mut(), &context);

        let calls = runner.calls.lock();
        let params = &calls[0].1;
        assert_eq!(params["limit"], json!(5));
        assert_eq!(params["transactionId"], json!("overridden"));
        assert_eq!(params["commitTime"], json!(null));
        assert_eq!(params[TRIGGER_PARAM], json!("audit"));
    }

    #[test]
    fn unused_phase_does_no_work() {
        let runner = Arc::new(RecordingRunner::default());
        let executor = PhaseExecutor::new(runner.clone());
        let snapshot = TriggerSnapshot::from_definitions(vec![trigger("a", "S", Phase::After)]);
        let host = MemoryHost::new("neo4j");
        let mut tx = host.begin().unwrap();

        assert!(!PhaseExecutor::has_phase(&snapshot, Phase::Before));
        let outcome = executor.execute(Phase::Before, &snapshot, tx.as_mut(), &Params::new());
        assert!(outcome.executed.is_empty());
        assert!(runner.calls.lock().is_empty());
    }

    #[test]
    fn statements_write_through_the_transaction() {
        let executor = PhaseExecutor::new(Arc::new(MemoryStatementRunner));
        let snapshot = TriggerSnapshot::from_definitions(vec![trigger(
            "counter",
            "INCR audit; SET last $trigger",
            Phase::Before,
        )]);
        let host = MemoryHost::new("neo4j");
        let mut tx = host.begin().unwrap();

        let runs = executor
            .execute(Phase::Before, &snapshot, tx.as_mut(), &Params::new())
            .into_result()
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(runs[0].rows, 2);
        assert_eq!(host.value("audit"), Some(json!(1)));
        assert_eq!(host.value("last"), Some(json!("counter")));
    }

    #[test]
    fn metrics_track_calls_and_errors() {
        let executor = PhaseExecutor::new(Arc::new(RecordingRunner::default()));
        let snapshot = TriggerSnapshot::from_definitions(vec![
            trigger("ok", "OK", Phase::After),
            trigger("bad", "FAIL", Phase::After),
        ]);
        let host = MemoryHost::new("neo4j");
        for _ in 0..3 {
            let mut tx = host.begin().unwrap();
            executor.execute(Phase::After, &snapshot, tx.as_mut(), &Params::new());
        }

        let metrics = executor.metrics();
        assert_eq!(metrics.get("ok").map(|s| s.calls), Some(3));
        assert_eq!(metrics.get("bad").map(|s| s.errors), Some(3));
        assert_eq!(metrics.success_rate("ok"), Some(1.0));
        assert_eq!(metrics.success_rate("bad"), Some(0.0));
        assert!(metrics.avg_duration("ok").is_some());

        executor.retain_metrics(&TriggerSnapshot::from_definitions(vec![trigger(
            "ok",
            "OK",
            Phase::After,
        )]));
        assert_eq!(executor.metrics().names(), vec!["ok"]);
    }

    #[test]
    fn average_survives_huge_call_counts() {
        let mut metrics = ExecutionMetrics::new();
        metrics.triggers.insert(
            "t1".into(),
            TriggerStats {
                calls: 1 << 32,
                errors: 0,
                total: Duration::from_secs(1 << 32),
            },
        );

        assert_eq!(metrics.avg_duration("t1"), Some(Duration::from_secs(1)));
        assert_eq!(metrics.success_rate("t1"), Some(1.0));
        assert_eq!(metrics.avg_duration("missing"), None);
    }
}
