use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Observed lifecycle of the server backing a machine record.
///
/// Creation path: `Pending -> Provisioning -> Ready`.
/// Deletion path: `Pending | Provisioning | Ready -> Cleaning -> NotFound`.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Display, EnumString, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Cleaning,
    NotFound,
}

impl LifecycleState {
    /// Position along the normal progression.
    pub fn rank(self) -> u8 {
        match self {
            LifecycleState::Pending => 0,
            LifecycleState::Provisioning => 1,
            LifecycleState::Ready => 2,
            LifecycleState::Cleaning => 3,
            LifecycleState::NotFound => 4,
        }
    }

    pub fn is_pre_ready(self) -> bool {
        matches!(self, LifecycleState::Pending | LifecycleState::Provisioning)
    }
}

/// Succinct, machine-readable cause of a terminal error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineErrorReason {
    InvalidConfiguration,
    CreateMachine,
    DeleteMachine,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AddressKind {
    ExternalIP,
    InternalIP,
    Hostname,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Address {
    #[serde(rename = "type")]
    pub kind: AddressKind,
    pub address: String,
}

impl Address {
    pub fn external(address: impl Into<String>) -> Self {
        Self {
            kind: AddressKind::ExternalIP,
            address: address.into(),
        }
    }
}

/// Archive search filter; values are matched exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct Filter {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(length(min = 1))]
    pub values: Vec<String>,
}

/// Source archive either pinned by ID or looked up with filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Validate)]
pub struct ImageSelector {
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceImageInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineMetadata {
    pub name: String,
    pub namespace: String,
    pub cluster_name: String,
    pub uid: Uuid,
    /// Bumped by the store whenever the desired state changes.
    pub generation: u64,
    pub resource_version: u64,
    #[serde(default)]
    pub deletion_requested: bool,
}

/// Desired state of a machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct MachineSpec {
    #[garde(range(min = 1, max = 128))]
    pub cpus: u32,

    #[garde(range(min = 1, max = 1024))]
    pub memory_gb: u32,

    #[garde(range(min = 20, max = 4096))]
    pub disk_gb: u32,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    #[garde(dive)]
    #[serde(default)]
    pub source_image: ImageSelector,

    /// Base64-encoded cloud-init user data.
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_data: Option<String>,

    #[garde(skip)]
    #[serde(default)]
    pub control_plane: bool,

    /// Set by the controller once a server exists.
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_ref: Option<String>,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

/// Observed state of a machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MachineStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image: Option<SourceImageInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<MachineErrorReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub observed_generation: u64,
}

/// The declarative record for one machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub metadata: MachineMetadata,
    pub spec: MachineSpec,
    #[serde(default)]
    pub status: MachineStatus,
}

#[derive(Debug, thiserror::Error)]
#[error("no IP addresses found for machine {0}")]
pub struct NoMachineAddress(pub String);

impl Machine {
    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    pub fn set_error(&mut self, reason: MachineErrorReason, message: impl Into<String>) {
        self.status.error_reason = Some(reason);
        self.status.error_message = Some(message.into());
    }

    pub fn clear_error(&mut self) {
        self.status.error_reason = None;
        self.status.error_message = None;
    }

    pub fn has_error(&self) -> bool {
        self.status.error_reason.is_some() || self.status.error_message.is_some()
    }

    /// Whether the desired state was edited after the status last caught up.
    pub fn spec_changed(&self) -> bool {
        self.metadata.generation > self.status.observed_generation
    }

    /// The server reference, preferring the one recorded on the spec.
    pub fn server_ref(&self) -> Option<&str> {
        self.spec
            .machine_ref
            .as_deref()
            .or(self.status.server_ref.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn preferred_address(&self) -> Result<&str, NoMachineAddress> {
        self.status
            .addresses
            .iter()
            .find(|a| a.kind == AddressKind::ExternalIP)
            .map(|a| a.address.as_str())
            .ok_or_else(|| NoMachineAddress(self.key()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn machine() -> Machine {
        Machine {
            metadata: MachineMetadata {
                name: "node-0".to_string(),
                namespace: "default".to_string(),
                cluster_name: "dev".to_string(),
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
                bootstrap_data: None,
                control_plane: false,
                machine_ref: None,
                provider_id: None,
            },
            status: MachineStatus::default(),
        }
    }

    #[test]
    fn test_lifecycle_state_strings() {
        assert_eq!(LifecycleState::NotFound.to_string(), "not_found");
        assert_eq!(
            LifecycleState::from_str("provisioning").unwrap(),
            LifecycleState::Provisioning
        );
        assert_eq!(MachineErrorReason::CreateMachine.to_string(), "CREATE_MACHINE");
    }

    #[test]
    fn test_rank_orders_paths() {
        assert!(LifecycleState::Pending.rank() < LifecycleState::Provisioning.rank());
        assert!(LifecycleState::Provisioning.rank() < LifecycleState::Ready.rank());
        assert!(LifecycleState::Cleaning.rank() < LifecycleState::NotFound.rank());
    }

    #[test]
    fn test_error_helpers() {
        let mut m = machine();
        assert!(!m.has_error());
        m.set_error(MachineErrorReason::DeleteMachine, "backend unreachable");
        assert!(m.has_error());
        assert_eq!(m.status.error_message.as_deref(), Some("backend unreachable"));
        m.clear_error();
        assert!(!m.has_error());
    }

    #[test]
    fn test_preferred_address_picks_external_ip() {
        let mut m = machine();
        assert!(m.preferred_address().is_err());
        m.status.addresses = vec![
            Address {
                kind: AddressKind::InternalIP,
                address: "192.168.0.10".to_string(),
            },
            Address::external("203.0.113.5"),
        ];
        assert_eq!(m.preferred_address().unwrap(), "203.0.113.5");
    }

    #[test]
    fn test_spec_validation() {
        let mut m = machine();
        assert!(m.spec.validate().is_ok());
        m.spec.cpus = 0;
        assert!(m.spec.validate().is_err());
    }

    #[test]
    fn test_server_ref_prefers_spec() {
        let mut m = machine();
        assert_eq!(m.server_ref(), None);
        m.status.server_ref = Some("111".to_string());
        assert_eq!(m.server_ref(), Some("111"));
        m.spec.machine_ref = Some("222".to_string());
        assert_eq!(m.server_ref(), Some("222"));
    }
}
