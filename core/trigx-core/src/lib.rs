//! # trigx: transaction triggers for multi-database deployments
//!
//! Operators register named triggers that run a statement when a matching
//! transaction commits, rolls back, or after it commits on a background pool.
//! Each target database gets its own [`TriggerCoordinator`], which keeps an
//! in-memory snapshot of the trigger definitions in step with a shared
//! administrative store.
//!
//! ## Quick start
//!
//! ```rust
//! use trigx_core::host::memory::MemoryHost;
//! use trigx_core::storage::memory_store::MemorySystemStore;
//! use trigx_core::{Collaborators, Params, TriggerConfig, TriggerCoordinator};
//! use std::sync::Arc;
//!
//! # fn main() -> trigx_core::TrigxResult<()> {
//! let host = MemoryHost::new("neo4j");
//! let store = Arc::new(MemorySystemStore::new());
//! let coordinator = TriggerCoordinator::new(
//!     "neo4j",
//!     TriggerConfig::default(),
//!     Collaborators::in_memory(&host, store),
//! )?;
//! coordinator.start()?;
//!
//! let mut selector = Params::new();
//! selector.insert("phase".into(), "after".into());
//! coordinator.install("neo4j", "audit", "INCR audited", selector, Params::new())?;
//!
//! host.write(&[("name", "Ada".into())])?;
//! assert_eq!(host.counter("audited"), 1);
//!
//! coordinator.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Phases
//!
//! | Phase        | Runs                                   | Failure                  |
//! |--------------|----------------------------------------|--------------------------|
//! | `before`     | inside the committing transaction      | aborts the commit        |
//! | `after`      | in a new transaction after commit      | returned to the host     |
//! | `rollback`   | in a new transaction after rollback    | returned to the host     |
//! | `afterAsync` | on the async pool after commit         | logged only              |
//!
//! ## Module structure
//!
//! - [`coordinator`]: one coordinator per target database
//! - [`service`]: routes administrative calls to coordinators by database
//! - [`trigger`]: definitions, snapshots, cache, execution, refresh
//! - [`storage`]: administrative store backends (sled, in-memory)
//! - [`host`]: host database seams and the in-memory host
//! - [`config`], [`retry`], [`clock`], [`logging`], [`error`]

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod retry;
pub mod service;
pub mod storage;
pub mod trigger;

// Logging utilities
pub mod logging;

// Re-export commonly used types
pub use config::TriggerConfig;
pub use coordinator::{Collaborators, SYSTEM_DATABASE, TriggerCoordinator};
pub use error::{TriggerFailure, TriggerFailures, TrigxError, TrigxResult};
pub use host::Params;
pub use service::TriggerService;
pub use trigger::{Phase, TriggerChange, TriggerDefinition, TriggerSnapshot};
