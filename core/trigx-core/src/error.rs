//! Error types for the trigger engine.
//!
//! All public APIs return `TrigxResult<T>`, library code does not panic.

use crate::trigger::Phase;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for all trigger engine operations.
#[derive(Debug, Error)]
pub enum TrigxError {
    /// Administrative store temporarily unreachable (no elected writer, I/O hiccup)
    #[error("system store unavailable: {0}")]
    StoreUnavailable(String),

    /// A record read by the transaction was changed by a concurrent commit
    #[error("write conflict: {0}")]
    WriteConflict(String),

    /// sled embedded database error
    #[error("sled error: {source}")]
    Sled {
        #[from]
        source: sled::Error,
    },

    /// Standard I/O error
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transient failures persisted past the retry window
    #[error("gave up after {attempts} attempts in {elapsed:?}: {last}")]
    RetryExhausted {
        attempts: u32,
        elapsed: Duration,
        last: Box<TrigxError>,
    },

    /// Triggers are switched off in the configuration
    #[error("triggers are disabled, set `enabled = true` to use them")]
    TriggersDisabled,

    /// Call routed to a coordinator owning a different database
    #[error("coordinator serves database '{expected}', not '{actual}'")]
    WrongDatabase { expected: String, actual: String },

    /// Triggers cannot target the administrative database itself
    #[error("triggers cannot be installed on the '{0}' database")]
    SystemDatabase(String),

    /// No coordinator exists for the requested database
    #[error("database '{0}' not found")]
    DatabaseNotFound(String),

    /// This process cannot write to the administrative store
    #[error("system store is not writable: {0}")]
    NotWritable(String),

    /// Malformed trigger definition
    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    /// Selector names an unknown phase or is not a map
    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    /// A single trigger statement failed
    #[error("statement failed: {0}")]
    StatementFailed(String),

    /// One or more triggers failed during a phase
    #[error("{0}")]
    TriggerExecution(TriggerFailures),

    /// Host transaction aborted
    #[error("transaction aborted: {reason}")]
    TransactionAborted { reason: String },

    /// Background scheduling error
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl TrigxError {
    /// Whether the retry policy may try the operation again.
    pub fn is_transient(&self) -> bool {
        match self {
            TrigxError::StoreUnavailable(_) | TrigxError::WriteConflict(_) => true,
            TrigxError::Sled { source } => matches!(source, sled::Error::Io(_)),
            _ => false,
        }
    }
}

/// Result type alias for all trigger engine operations.
pub type TrigxResult<T> = Result<T, TrigxError>;

impl From<serde_json::Error> for TrigxError {
    fn from(err: serde_json::Error) -> Self {
        TrigxError::Serialization(err.to_string())
    }
}

/// A trigger that failed during phase execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFailure {
    pub trigger: String,
    pub message: String,
}

/// Every failure collected while running one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFailures {
    pub phase: Phase,
    pub failures: Vec<TriggerFailure>,
}

impl TriggerFailures {
    /// Names of the failed triggers, in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.trigger.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for TriggerFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} trigger(s) failed in phase '{}':",
            self.failures.len(),
            self.phase
        )?;
        for failure in &self.failures {
            write!(f, " [{}: {}]", failure.trigger, failure.message)?;
        }
        Ok(())
    }
}

impl From<TriggerFailures> for TrigxError {
    fn from(failures: TriggerFailures) -> Self {
        TrigxError::TriggerExecution(failures)
    }
}
