//! Agent registry: name → address and capability directory.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

/// A registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub agent_name: String,
    pub address: String,
    pub capability_tags: Vec<String>,
}

/// Shared directory of agents. Cloning shares the same entries.
///
/// Entries are replaced whole under a write lock, so readers never see a
/// half-applied registration.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    entries: Arc<RwLock<HashMap<String, RegistryEntry>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an agent.
    pub fn register(&self, name: &str, address: &str, capabilities: Vec<String>) {
        let entry = RegistryEntry {
            agent_name: name.to_string(),
            address: address.to_string(),
            capability_tags: capabilities,
        };
        let previous = self.write().insert(name.to_string(), entry);
        if previous.is_some() {
            tracing::debug!("Re-registered agent {} at {}", name, address);
        } else {
            tracing::debug!("Registered agent {} at {}", name, address);
        }
    }

    /// Remove an agent. Returns the removed entry, if any.
    pub fn unregister(&self, name: &str) -> Option<RegistryEntry> {
        let removed = self.write().remove(name);
        if removed.is_some() {
            tracing::debug!("Unregistered agent {}", name);
        }
        removed
    }

    /// Resolve an agent name to its address.
    pub fn lookup(&self, name: &str) -> Result<String> {
        self.read()
            .get(name)
            .map(|e| e.address.clone())
            .ok_or_else(|| Error::NotFound(format!("agent '{}' is not registered", name)))
    }

    pub fn entry(&self, name: &str) -> Option<RegistryEntry> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Agents advertising a capability tag, sorted by name.
    pub fn find_by_capability(&self, tag: &str) -> Vec<RegistryEntry> {
        let mut found: Vec<RegistryEntry> = self
            .read()
            .values()
            .filter(|e| e.capability_tags.iter().any(|t| t == tag))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        found
    }

    /// All entries, sorted by name.
    pub fn list(&self) -> Vec<RegistryEntry> {
        let mut all: Vec<RegistryEntry> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        all
    }

    // Writers never panic while holding the lock, so a poisoned map is still whole.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RegistryEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RegistryEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}
