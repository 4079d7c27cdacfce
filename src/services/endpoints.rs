//! API endpoints of clusters, taken from their control plane machines.

use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};

use crate::models::cluster::ApiEndpoint;
use crate::models::machine::Machine;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("no IP addresses found for control plane machines of cluster {0}")]
    NoMachineAddress(String),
}

/// Endpoint from the first control plane machine with bootstrap data and an address.
pub fn api_endpoint<'a>(
    cluster: &str,
    machines: impl IntoIterator<Item = &'a Machine>,
) -> Result<ApiEndpoint, EndpointError> {
    for machine in machines.into_iter().filter(|m| m.spec.control_plane) {
        if machine.spec.bootstrap_data.is_none() {
            tracing::debug!(
                machine = %machine.key(),
                reason = "no bootstrap data",
                "Skipping machine while looking for IP address"
            );
            continue;
        }
        let Ok(host) = machine.preferred_address() else {
            continue;
        };
        let endpoint = ApiEndpoint::new(host);
        tracing::debug!(
            cluster = %cluster,
            host = %endpoint.host,
            port = endpoint.port,
            "Found API endpoint via control plane machine"
        );
        return Ok(endpoint);
    }
    Err(EndpointError::NoMachineAddress(cluster.to_string()))
}

fn cluster_key(namespace: &str, cluster: &str) -> String {
    format!("{namespace}/{cluster}")
}

/// Published API endpoint per `namespace/cluster`.
///
/// Once a cluster has an endpoint it is kept until the cluster has no
/// machines left.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<String, ApiEndpoint>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, cluster: &str) -> Option<ApiEndpoint> {
        self.endpoints
            .get(&cluster_key(namespace, cluster))
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Set the cluster's endpoint unless it already has one.
    pub fn reconcile<'a>(
        &self,
        namespace: &str,
        cluster: &str,
        machines: impl IntoIterator<Item = &'a Machine>,
    ) -> Result<ApiEndpoint, EndpointError> {
        let key = cluster_key(namespace, cluster);
        if let Some(existing) = self.endpoints.get(&key) {
            return Ok(existing.value().clone());
        }

        let endpoint = api_endpoint(&key, machines)?;
        tracing::info!(
            cluster = %key,
            host = %endpoint.host,
            port = endpoint.port,
            "API endpoint set"
        );
        Ok(self.endpoints.entry(key).or_insert(endpoint).value().clone())
    }

    /// Reconcile every cluster that has machines and forget the ones that don't.
    pub fn reconcile_all(&self, machines: &[Machine]) {
        let mut clusters: BTreeMap<(&str, &str), Vec<&Machine>> = BTreeMap::new();
        for machine in machines {
            clusters
                .entry((machine.metadata.namespace.as_str(), machine.metadata.cluster_name.as_str()))
                .or_default()
                .push(machine);
        }

        let present: HashSet<String> = clusters
            .keys()
            .map(|(namespace, cluster)| cluster_key(namespace, cluster))
            .collect();
        self.endpoints.retain(|key, _| present.contains(key));

        for ((namespace, cluster), members) in clusters {
            if let Err(e) = self.reconcile(namespace, cluster, members) {
                tracing::debug!(error = %e, "API endpoint not available yet");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::machine::{
        Address, ImageSelector, MachineMetadata, MachineSpec, MachineStatus,
    };
    use uuid::Uuid;

    fn machine(name: &str, cluster: &str, control_plane: bool, address: Option<&str>) -> Machine {
        let status = MachineStatus {
            addresses: address.map(Address::external).into_iter().collect(),
            ..MachineStatus::default()
        };
        Machine {
            metadata: MachineMetadata {
                name: name.to_string(),
                namespace: "default".to_string(),
                cluster_name: cluster.to_string(),
                uid: Uuid::new_v4(),
                generation: 1,
                resource_version: 1,
                deletion_requested: false,
            },
            spec: MachineSpec {
                cpus: 2,
                memory_gb: 4,
                disk_gb: 20,
                zone: None,
                source_image: ImageSelector::default(),
                bootstrap_data: Some("I2Nsb3VkLWNvbmZpZwo=".to_string()),
                control_plane,
                machine_ref: None,
                provider_id: None,
            },
            status,
        }
    }

    #[test]
    fn test_first_addressed_control_plane_machine_wins() {
        let machines = vec![
            machine("worker-0", "dev", false, Some("192.0.2.1")),
            machine("cp-0", "dev", true, None),
            machine("cp-1", "dev", true, Some("192.0.2.3")),
            machine("cp-2", "dev", true, Some("192.0.2.4")),
        ];

        let endpoint = api_endpoint("default/dev", &machines).unwrap();
        assert_eq!(endpoint.host, "192.0.2.3");
        assert_eq!(endpoint.port, 6443);
    }

    #[test]
    fn test_machine_without_bootstrap_data_is_skipped() {
        let mut waiting = machine("cp-0", "dev", true, Some("192.0.2.1"));
        waiting.spec.bootstrap_data = None;
        let machines = vec![waiting, machine("cp-1", "dev", true, Some("192.0.2.2"))];

        assert_eq!(api_endpoint("default/dev", &machines).unwrap().host, "192.0.2.2");
    }

    #[test]
    fn test_no_addressed_control_plane_is_an_error() {
        let machines = vec![
            machine("worker-0", "dev", false, Some("192.0.2.1")),
            machine("cp-0", "dev", true, None),
        ];

        assert_eq!(
            api_endpoint("default/dev", &machines),
            Err(EndpointError::NoMachineAddress("default/dev".to_string()))
        );
    }

    #[test]
    fn test_endpoint_is_not_replaced_once_set() {
        let registry = EndpointRegistry::new();
        let first = vec![machine("cp-0", "dev", true, Some("192.0.2.1"))];
        registry.reconcile("default", "dev", &first).unwrap();

        let moved = vec![machine("cp-0", "dev", true, Some("192.0.2.9"))];
        let endpoint = registry.reconcile("default", "dev", &moved).unwrap();
        assert_eq!(endpoint.host, "192.0.2.1");
    }

    #[test]
    fn test_reconcile_all_tracks_clusters_in_store() {
        let registry = EndpointRegistry::new();
        registry.reconcile_all(&[
            machine("cp-0", "dev", true, Some("192.0.2.1")),
            machine("cp-0", "prod", true, None),
        ]);
        assert_eq!(registry.get("default", "dev").unwrap().host, "192.0.2.1");
        assert!(registry.get("default", "prod").is_none());

        registry.reconcile_all(&[machine("cp-0", "prod", true, Some("192.0.2.7"))]);
        assert!(registry.get("default", "dev").is_none());
        assert_eq!(registry.get("default", "prod").unwrap().host, "192.0.2.7");
        assert_eq!(registry.len(), 1);
    }
}
