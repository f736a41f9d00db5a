//! Integration Tests
//!
//! Coordinator, hooks and host wired together end to end.

use crate::config::TriggerConfig;
use crate::coordinator::{Collaborators, TriggerCoordinator};
use crate::error::TrigxError;
use crate::host::memory::MemoryHost;
use crate::error::TrigxResult;
use crate::host::{HostDatabase, HostTransaction, Params, StatementRunner};
use crate::storage::SystemStore;
use crate::storage::memory_store::MemorySystemStore;
use crate::trigger::Phase;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

fn selector(phase: Phase) -> Params {
    let mut map = Params::new();
    map.insert("phase".into(), json!(phase.as_str()));
    map
}

fn config() -> TriggerConfig {
    TriggerConfig {
        async_pool_size: 2,
        ..TriggerConfig::default()
    }
}

fn setup() -> (MemoryHost, TriggerCoordinator) {
    let host = MemoryHost::new("neo4j");
    let system: Arc<dyn SystemStore> = Arc::new(MemorySystemStore::new());
    let coordinator =
        TriggerCoordinator::new("neo4j", config(), Collaborators::in_memory(&host, system)).unwrap();
    coordinator.start().unwrap();
    (host, coordinator)
}

fn install(coordinator: &TriggerCoordinator, name: &str, statement: &str, phase: Phase) {
    coordinator
        .install("neo4j", name, statement, selector(phase), Params::new())
        .unwrap();
}

/// Commit one unrelated write.
fn touch(host: &MemoryHost) -> Result<(), TrigxError> {
    host.write(&[("touched", json!(true))])
}

#[test]
fn install_pause_resume_drop_scenario() {
    let (host, coordinator) = setup();

    install(&coordinator, "t1", "INCR s1", Phase::After);
    touch(&host).unwrap();
    assert_eq!(host.counter("s1"), 1);

    coordinator.pause("neo4j", "t1").unwrap();
    touch(&host).unwrap();
    assert_eq!(host.counter("s1"), 1);

    coordinator.resume("neo4j", "t1").unwrap();
    let dropped = coordinator.drop_trigger("neo4j", "t2").unwrap();
    assert!(dropped.previous.is_none());

    install(&coordinator, "t3", "FAIL t3 is broken", Phase::After);
    install(&coordinator, "t4", "INCR s4", Phase::After);
    touch(&host).unwrap();

    assert_eq!(host.counter("s4"), 1);
    assert_eq!(host.counter("s1"), 2);
    let errors = host.take_listener_errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("1 trigger(s) failed in phase 'after'"));
    assert!(errors[0].contains("t3"));
    assert!(!errors[0].contains("t4"));
}

#[test]
fn trigger_writes_do_not_retrigger() {
    let (host, coordinator) = setup();
    install(&coordinator, "sync", "INCR after_runs", Phase::After);
    install(&coordinator, "deferred", "INCR async_runs", Phase::AfterAsync);

    touch(&host).unwrap();
    assert!(coordinator.quiesce(Duration::from_secs(5)));

    assert_eq!(host.counter("after_runs"), 1);
    assert_eq!(host.counter("async_runs"), 1);
    assert!(host.take_listener_errors().is_empty());
}

#[test]
fn after_triggers_see_the_committed_transaction() {
    let (host, coordinator) = setup();
    install(
        &coordinator,
        "audit",
        "SET seen_tx $transactionId; SET seen_meta $metaData; SET seen_name $trigger; SET seen_change $name",
        Phase::After,
    );

    let mut tx = host.begin_memory();
    let id = tx.id();
    tx.set_metadata("app", json!("billing"));
    tx.set("name", json!("Ada"));
    Box::new(tx).commit().unwrap();

    assert_eq!(host.value("seen_tx"), Some(json!(id)));
    assert_eq!(host.value("seen_meta"), Some(json!({"app": "billing"})));
    assert_eq!(host.value("seen_name"), Some(json!("audit")));
    assert_eq!(host.value("seen_change"), Some(json!("Ada")));
}

#[test]
fn before_triggers_write_into_the_committing_transaction() {
    let (host, coordinator) = setup();
    install(&coordinator, "stamp", "SET stamped $name", Phase::Before);

    host.write(&[("name", json!("Ada"))]).unwrap();
    assert_eq!(host.value("stamped"), Some(json!("Ada")));
}

#[test]
fn failing_before_trigger_aborts_the_commit() {
    let (host, coordinator) = setup();
    install(&coordinator, "guard", "FAIL writes are frozen", Phase::Before);

    let err = host.write(&[("name", json!("Ada"))]).unwrap_err();
    assert!(matches!(err, TrigxError::TransactionAborted { .. }));
    assert!(err.to_string().contains("guard"));
    assert_eq!(host.value("name"), None);
}

#[test]
fn rollback_triggers_run_on_rollback() {
    let (host, coordinator) = setup();
    install(&coordinator, "undo", "INCR rollbacks", Phase::Rollback);

    let tx = host.begin().unwrap();
    tx.rollback().unwrap();
    touch(&host).unwrap();

    assert_eq!(host.counter("rollbacks"), 1);
}

#[test]
fn failures_are_isolated_for_any_mix() {
    for (n, k) in [(1, 0), (2, 1), (5, 2), (6, 5), (8, 3)] {
        let (host, coordinator) = setup();
        let failing: Vec<String> = (0..k).map(|i| format!("t{i}")).collect();
        for i in 0..n {
            let name = format!("t{i}");
            let statement = if i < k {
                format!("FAIL {name} failed")
            } else {
                format!("INCR ok_{i}")
            };
            install(&coordinator, &name, &statement, Phase::After);
        }

        touch(&host).unwrap();

        for i in k..n {
            assert_eq!(host.counter(&format!("ok_{i}")), 1, "n={n} k={k} t{i}");
        }
        let errors = host.take_listener_errors();
        if k == 0 {
            assert!(errors.is_empty());
        } else {
            assert!(errors[0].starts_with(&format!("{k} trigger(s) failed")));
            for name in &failing {
                assert!(errors[0].contains(&format!("[{name}: ")));
            }
        }
    }
}

#[test]
fn async_failures_are_only_logged() {
    let (host, coordinator) = setup();
    install(&coordinator, "deferred", "FAIL nobody hears this", Phase::AfterAsync);

    touch(&host).unwrap();
    assert!(coordinator.quiesce(Duration::from_secs(5)));

    assert_eq!(host.value("touched"), Some(json!(true)));
    assert!(host.take_listener_errors().is_empty());
}

#[test]
fn registration_follows_the_snapshot() {
    let (host, coordinator) = setup();
    assert_eq!(host.listener_count(), 0);

    install(&coordinator, "t1", "INCR x", Phase::After);
    install(&coordinator, "t2", "INCR y", Phase::After);
    assert_eq!(host.listener_count(), 1);

    coordinator.drop_trigger("neo4j", "t1").unwrap();
    assert_eq!(host.listener_count(), 1);
    coordinator.drop_trigger("neo4j", "t2").unwrap();
    assert_eq!(host.listener_count(), 0);
    assert_eq!(host.registrations(), 1);
    assert_eq!(host.unregistrations(), 1);
}

#[test]
fn cooperating_coordinators_converge_through_the_store() {
    let system: Arc<dyn SystemStore> = Arc::new(MemorySystemStore::new());
    let host_a = MemoryHost::new("neo4j");
    let host_b = MemoryHost::new("neo4j");
    let a = TriggerCoordinator::new(
        "neo4j",
        config(),
        Collaborators::in_memory(&host_a, Arc::clone(&system)),
    )
    .unwrap();
    let b =
        TriggerCoordinator::new("neo4j", config(), Collaborators::in_memory(&host_b, system)).unwrap();
    a.start().unwrap();
    b.start().unwrap();

    install(&a, "t1", "INCR s1", Phase::After);
    assert!(b.list("neo4j").unwrap().is_empty());
    assert_eq!(host_b.listener_count(), 0);

    assert!(b.refresh_if_changed().unwrap());
    assert_eq!(b.list("neo4j").unwrap().names(), vec!["t1"]);
    touch(&host_b).unwrap();
    assert_eq!(host_b.counter("s1"), 1);

    a.stop().unwrap();
    b.stop().unwrap();
}

/// Records which triggers ran for which source transaction.
#[derive(Default)]
struct FiringLog {
    runs: Mutex<Vec<(u64, String)>>,
}

impl StatementRunner for FiringLog {
    fn run(&self, _statement: &str, params: &Params, _tx: &mut dyn HostTransaction) -> TrigxResult<u64> {
        let source = params["transactionId"].as_u64().unwrap_or_default();
        let trigger = params["trigger"].as_str().unwrap_or_default().to_string();
        self.runs.lock().push((source, trigger));
        Ok(1)
    }
}

#[test]
fn concurrent_commits_during_installs() {
    let host = MemoryHost::new("neo4j");
    let log = Arc::new(FiringLog::default());
    let mut collaborators = Collaborators::in_memory(&host, Arc::new(MemorySystemStore::new()));
    collaborators.runner = log.clone();
    let coordinator = TriggerCoordinator::new("neo4j", config(), collaborators).unwrap();
    coordinator.start().unwrap();

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let host = host.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    touch(&host).unwrap();
                }
            })
        })
        .collect();
    for i in 0..10 {
        install(&coordinator, &format!("t{i}"), "INCR fired", Phase::After);
    }
    for writer in writers {
        writer.join().unwrap();
    }
    touch(&host).unwrap();

    assert_eq!(coordinator.list("neo4j").unwrap().len(), 10);
    assert!(host.take_listener_errors().is_empty());

    let mut fired: BTreeMap<u64, BTreeSet<String>> = BTreeMap::new();
    for (source, trigger) in log.runs.lock().iter() {
        assert!(fired.entry(*source).or_default().insert(trigger.clone()));
    }
    // Installs publish t0, t0..t1, t0..t2 and so on; every commit saw exactly one of them
    for (source, triggers) in &fired {
        let published: BTreeSet<String> = (0..triggers.len()).map(|i| format!("t{i}")).collect();
        assert_eq!(triggers, &published, "commit {source} saw a partial snapshot");
    }
    assert!(fired.values().any(|triggers| triggers.len() == 10));
}
