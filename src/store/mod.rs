//! In-memory machine record store with optimistic concurrency.
//!
//! Plays the control plane's part: users write desired state through
//! [`MachineStore::apply`], the reconcile loop reads a copy, mutates it and
//! writes it back with [`MachineStore::patch`], which fails if anything else
//! changed the record in between.

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::machine::{Machine, MachineMetadata, MachineSpec, MachineStatus};

#[derive(Default)]
pub struct MachineStore {
    machines: RwLock<HashMap<String, Machine>>,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl MachineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record or replace its desired state.
    ///
    /// `generation` only moves when the user-editable part of the spec
    /// changed. Fields the controller owns are carried over. A pending
    /// deletion is never undone, but an edit still lets a failed cleanup retry.
    pub async fn apply(
        &self,
        namespace: &str,
        name: &str,
        cluster_name: &str,
        spec: MachineSpec,
    ) -> Result<Machine, StoreError> {
        let mut machines = self.machines.write().await;
        let k = key(namespace, name);

        if let Some(existing) = machines.get_mut(&k) {
            let mut spec = spec;
            spec.machine_ref = existing.spec.machine_ref.clone();
            spec.provider_id = existing.spec.provider_id.clone();
            if spec.source_image.id.is_none() && spec.source_image.filters == existing.spec.source_image.filters {
                spec.source_image.id = existing.spec.source_image.id.clone();
            }
            if spec != existing.spec || cluster_name != existing.metadata.cluster_name {
                existing.spec = spec;
                existing.metadata.cluster_name = cluster_name.to_string();
                existing.metadata.generation += 1;
                existing.metadata.resource_version += 1;
                tracing::info!(
                    machine = %k,
                    generation = existing.metadata.generation,
                    "Machine spec updated"
                );
            }
            return Ok(existing.clone());
        }

        let machine = Machine {
            metadata: MachineMetadata {
                name: name.to_string(),
                namespace: namespace.to_string(),
                cluster_name: cluster_name.to_string(),
                uid: Uuid::new_v4(),
                generation: 1,
                resource_version: 1,
                deletion_requested: false,
            },
            spec,
            status: MachineStatus::default(),
        };
        tracing::info!(machine = %k, uid = %machine.metadata.uid, "Machine created");
        machines.insert(k, machine.clone());
        Ok(machine)
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Option<Machine> {
        self.machines.read().await.get(&key(namespace, name)).cloned()
    }

    pub async fn get_by_key(&self, key: &str) -> Option<Machine> {
        self.machines.read().await.get(key).cloned()
    }

    pub async fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.machines.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of every record, ordered by key.
    pub async fn list(&self) -> Vec<Machine> {
        let mut machines: Vec<Machine> = self.machines.read().await.values().cloned().collect();
        machines.sort_by_key(Machine::key);
        machines
    }

    pub async fn len(&self) -> usize {
        self.machines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.machines.read().await.is_empty()
    }

    /// Flag a record for removal; it stays until [`MachineStore::finalize`].
    ///
    /// Repeating the request on a record whose cleanup failed bumps
    /// `generation` so the controller retries.
    pub async fn mark_for_deletion(&self, namespace: &str, name: &str) -> Result<Machine, StoreError> {
        let mut machines = self.machines.write().await;
        let k = key(namespace, name);
        let machine = machines.get_mut(&k).ok_or_else(|| StoreError::NotFound(k.clone()))?;
        if !machine.metadata.deletion_requested {
            machine.metadata.deletion_requested = true;
            machine.metadata.resource_version += 1;
            tracing::info!(machine = %k, "Machine marked for deletion");
        } else if machine.has_error() {
            machine.metadata.generation += 1;
            machine.metadata.resource_version += 1;
            tracing::info!(
                machine = %k,
                generation = machine.metadata.generation,
                "Deletion retry requested"
            );
        }
        Ok(machine.clone())
    }

    /// Write back a record read earlier.
    ///
    /// Fails with [`StoreError::Conflict`] if the stored copy changed since.
    /// Metadata other than the version is never taken from the caller.
    pub async fn patch(&self, machine: &Machine) -> Result<Machine, StoreError> {
        let mut machines = self.machines.write().await;
        let k = machine.key();
        let stored = machines.get_mut(&k).ok_or_else(|| StoreError::NotFound(k.clone()))?;

        if stored.metadata.resource_version != machine.metadata.resource_version {
            return Err(StoreError::Conflict {
                key: k,
                expected: machine.metadata.resource_version,
                actual: stored.metadata.resource_version,
            });
        }

        stored.spec = machine.spec.clone();
        stored.status = machine.status.clone();
        stored.metadata.resource_version += 1;
        Ok(stored.clone())
    }

    /// Remove a record whose deletion has completed.
    pub async fn finalize(&self, machine: &Machine) -> Result<(), StoreError> {
        let mut machines = self.machines.write().await;
        let k = machine.key();
        match machines.get(&k) {
            None => Ok(()),
            Some(stored) if !stored.metadata.deletion_requested => Err(StoreError::NotDeleting(k)),
            Some(_) => {
                machines.remove(&k);
                tracing::info!(machine = %k, "Machine record removed");
                Ok(())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("machine {0} not found")]
    NotFound(String),

    #[error("machine {key} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("machine {0} is not marked for deletion")]
    NotDeleting(String),
}
