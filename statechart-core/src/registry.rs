//! Versioned machine registry.
//!
//! Lets several callers share machines by `(id, version)` instead of
//! passing definitions around. Registering the same definition twice is an
//! idempotent success; registering a different definition under an existing
//! version is rejected.

use crate::definition::MachineDefinition;
use crate::error::CoreError;
use crate::instance::Instance;
use crate::machine::Machine;
use crate::setup::Implementations;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;

/// Result of registering a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub checksum: String,
    pub created: bool,
}

/// Machines indexed by `(id, version)`.
#[derive(Debug, Default)]
pub struct MachineRegistry {
    machines: DashMap<(String, u32), Machine>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition under its own id.
    pub fn put_machine(
        &self,
        version: u32,
        definition_json: &Value,
        implementations: Implementations,
    ) -> Result<PutResult, CoreError> {
        let definition = MachineDefinition::from_json(definition_json)?;
        let key = (definition.id.clone(), version);

        if let Some(existing) = self.machines.get(&key) {
            let checksum = existing.definition().checksum.clone();
            if checksum == definition.checksum {
                return Ok(PutResult {
                    checksum,
                    created: false,
                });
            }
            return Err(CoreError::MachineVersionExists {
                machine: key.0,
                version,
            });
        }

        let machine = Machine::new(definition, implementations)?;
        let checksum = machine.definition().checksum.clone();

        match self.machines.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                // Lost a race against an identical or conflicting registration.
                if entry.get().definition().checksum == checksum {
                    Ok(PutResult {
                        checksum,
                        created: false,
                    })
                } else {
                    Err(CoreError::MachineVersionExists {
                        machine: entry.key().0.clone(),
                        version,
                    })
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                tracing::info!(
                    "Registered machine '{}' v{} (checksum {})",
                    entry.key().0,
                    version,
                    checksum
                );
                entry.insert(machine);
                Ok(PutResult {
                    checksum,
                    created: true,
                })
            }
        }
    }

    /// Gets a machine by id and version.
    pub fn get_machine(&self, id: &str, version: u32) -> Result<Machine, CoreError> {
        self.machines
            .get(&(id.to_string(), version))
            .map(|r| r.clone())
            .ok_or_else(|| CoreError::MachineVersionNotFound {
                machine: id.to_string(),
                version,
            })
    }

    /// Gets the highest registered version of a machine.
    pub fn latest(&self, id: &str) -> Result<(u32, Machine), CoreError> {
        self.machines
            .iter()
            .filter(|entry| entry.key().0 == id)
            .max_by_key(|entry| entry.key().1)
            .map(|entry| (entry.key().1, entry.value().clone()))
            .ok_or_else(|| CoreError::MachineNotFound {
                machine: id.to_string(),
            })
    }

    /// Starts an instance of a registered machine.
    pub fn start(&self, id: &str, version: u32) -> Result<Instance, CoreError> {
        Ok(self.get_machine(id, version)?.start())
    }

    /// Lists all machines and their versions.
    pub fn list_machines(&self) -> HashMap<String, Vec<u32>> {
        let mut result: HashMap<String, Vec<u32>> = HashMap::new();
        for entry in self.machines.iter() {
            let (name, version) = entry.key();
            result.entry(name.clone()).or_default().push(*version);
        }
        for versions in result.values_mut() {
            versions.sort();
        }
        result
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}
