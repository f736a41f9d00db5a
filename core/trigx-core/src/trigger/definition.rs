//! Trigger definitions
//!
//! A trigger binds a statement to the transaction phase it fires in.

use crate::error::{TrigxError, TrigxResult};
use crate::host::Params;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Selector key naming the phase.
pub const PHASE_KEY: &str = "phase";

/// Transaction lifecycle point at which a trigger runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Inside the committing transaction
    Before,
    /// After commit, synchronously
    After,
    /// After a rollback
    Rollback,
    /// After commit, on the async pool
    AfterAsync,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Before,
        Phase::After,
        Phase::Rollback,
        Phase::AfterAsync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Before => "before",
            Phase::After => "after",
            Phase::Rollback => "rollback",
            Phase::AfterAsync => "afterAsync",
        }
    }

    pub(crate) fn bit(&self) -> u8 {
        match self {
            Phase::Before => 1,
            Phase::After => 1 << 1,
            Phase::Rollback => 1 << 2,
            Phase::AfterAsync => 1 << 3,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = TrigxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                TrigxError::InvalidSelector(format!(
                    "unknown phase '{s}', expected one of before, after, rollback, afterAsync"
                ))
            })
    }
}

/// Which transactions a trigger fires on. The phase is parsed once; any other
/// keys are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    phase: Option<Phase>,
    extra: Params,
}

impl Selector {
    pub fn for_phase(phase: Phase) -> Self {
        Self {
            phase: Some(phase),
            extra: Params::new(),
        }
    }

    /// Parse a raw selector map.
    pub fn from_map(mut map: Params) -> TrigxResult<Self> {
        let phase = match map.remove(PHASE_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name.parse::<Phase>()?),
            Some(other) => {
                return Err(TrigxError::InvalidSelector(format!(
                    "'{PHASE_KEY}' must be a string, got {other}"
                )));
            }
        };
        Ok(Self { phase, extra: map })
    }

    /// Raw map form, as installed.
    pub fn to_map(&self) -> Params {
        let mut map = self.extra.clone();
        if let Some(phase) = self.phase {
            map.insert(PHASE_KEY.to_string(), Value::String(phase.as_str().to_string()));
        }
        map
    }

    /// Effective phase; an absent phase means `before`.
    pub fn phase(&self) -> Phase {
        self.phase.unwrap_or(Phase::Before)
    }

    pub fn explicit_phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn extra(&self) -> &Params {
        &self.extra
    }
}

/// A named trigger for one database.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerDefinition {
    pub name: String,
    pub statement: String,
    pub selector: Selector,
    pub params: Params,
    pub paused: bool,
}

impl TriggerDefinition {
    pub fn new(name: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statement: statement.into(),
            selector: Selector::default(),
            params: Params::new(),
            paused: false,
        }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    pub fn phase(&self) -> Phase {
        self.selector.phase()
    }

    /// Whether this trigger runs in `phase`.
    pub fn is_eligible(&self, phase: Phase) -> bool {
        !self.paused && self.phase() == phase
    }

    pub fn validate(&self) -> TrigxResult<()> {
        if self.name.trim().is_empty() {
            return Err(TrigxError::InvalidTrigger("name must not be empty".into()));
        }
        if self.statement.trim().is_empty() {
            return Err(TrigxError::InvalidTrigger(format!(
                "trigger '{}' has an empty statement",
                self.name
            )));
        }
        Ok(())
    }
}

/// Before/after pair reported by every administrative mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerChange {
    pub name: String,
    pub previous: Option<TriggerDefinition>,
    pub current: Option<TriggerDefinition>,
}

impl TriggerChange {
    /// True when the mutation left the definition as it was.
    pub fn is_unchanged(&self) -> bool {
        self.previous == self.current
    }
}
