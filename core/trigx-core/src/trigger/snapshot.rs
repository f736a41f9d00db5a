//! Immutable point-in-time view of one database's triggers.

use super::definition::{Phase, TriggerDefinition};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name-ordered trigger definitions. Never mutated after construction; a
/// refresh builds a new snapshot and swaps it in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerSnapshot {
    triggers: BTreeMap<String, Arc<TriggerDefinition>>,
    /// Bit per phase with at least one eligible trigger
    active_phases: u8,
}

impl TriggerSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_definitions(definitions: impl IntoIterator<Item = TriggerDefinition>) -> Self {
        let mut triggers = BTreeMap::new();
        let mut active_phases = 0u8;
        for def in definitions {
            if !def.paused {
                active_phases |= def.phase().bit();
            }
            triggers.insert(def.name.clone(), Arc::new(def));
        }
        Self {
            triggers,
            active_phases,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TriggerDefinition>> {
        self.triggers.get(name)
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.triggers.keys().map(String::as_str).collect()
    }

    /// All definitions, in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TriggerDefinition>> {
        self.triggers.values()
    }

    /// O(1) check for an unpaused trigger in `phase`.
    pub fn has_phase(&self, phase: Phase) -> bool {
        self.active_phases & phase.bit() != 0
    }

    /// Definitions that run in `phase`, in name order.
    pub fn eligible(&self, phase: Phase) -> impl Iterator<Item = &Arc<TriggerDefinition>> {
        self.triggers.values().filter(move |d| d.is_eligible(phase))
    }
}
