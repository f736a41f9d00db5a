//! Trigger engine
//!
//! - Definitions and immutable snapshots
//! - Persistence in the administrative store
//! - Lock-free snapshot cache with host registration
//! - Phase execution, deferred execution, periodic refresh

pub mod async_runner;
pub mod cache;
pub mod definition;
pub mod executor;
pub mod hooks;
pub mod reconciler;
pub mod scheduler;
pub mod snapshot;
pub mod store;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
pub(crate) mod test_support;

pub use async_runner::AsyncRunner;
pub use cache::{SnapshotReader, TriggerCache};
pub use definition::{Phase, Selector, TriggerChange, TriggerDefinition};
pub use executor::{ExecutionMetrics, PhaseExecutor, PhaseOutcome, TriggerRun, TriggerStats};
pub use hooks::{TRIGGER_TX_KEY, TriggerHooks};
pub use reconciler::{RegistrationReconciler, Transition};
pub use scheduler::{JobHandle, RecurringScheduler, RefreshScheduler, Task, ThreadScheduler};
pub use snapshot::TriggerSnapshot;
pub use store::{TriggerRecords, TriggerStore};
