//! Sample machine records for controller tests

#![allow(dead_code)]

use uuid::Uuid;

use sacloud_machine_controller::models::machine::{
    Filter, ImageSelector, Machine, MachineMetadata, MachineSpec, MachineStatus,
};

pub const ARCHIVE_ID: &str = "113300000001";
pub const ARCHIVE_NAME: &str = "ubuntu-22.04-k8s-1.29";

/// `#cloud-config\n` in base64.
pub const BOOTSTRAP_DATA: &str = "I2Nsb3VkLWNvbmZpZwo=";

pub fn spec() -> MachineSpec {
    MachineSpec {
        cpus: 2,
        memory_gb: 4,
        disk_gb: 40,
        zone: None,
        source_image: ImageSelector {
            id: Some(ARCHIVE_ID.to_string()),
            filters: vec![],
        },
        bootstrap_data: Some(BOOTSTRAP_DATA.to_string()),
        control_plane: false,
        machine_ref: None,
        provider_id: None,
    }
}

pub fn machine(name: &str) -> Machine {
    Machine {
        metadata: MachineMetadata {
            name: name.to_string(),
            namespace: "default".to_string(),
            cluster_name: "dev".to_string(),
            uid: Uuid::new_v4(),
            generation: 1,
            resource_version: 1,
            deletion_requested: false,
        },
        spec: spec(),
        status: MachineStatus::default(),
    }
}

/// A machine whose archive is looked up by name.
pub fn machine_with_filter(name: &str, archive_name: &str) -> Machine {
    let mut m = machine(name);
    m.spec.source_image = ImageSelector {
        id: None,
        filters: vec![Filter {
            name: "Name".to_string(),
            values: vec![archive_name.to_string()],
        }],
    };
    m
}

/// Simulate a user edit of the desired state.
pub fn edit_spec(machine: &mut Machine, f: impl FnOnce(&mut MachineSpec)) {
    f(&mut machine.spec);
    machine.metadata.generation += 1;
}
