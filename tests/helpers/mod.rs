//! Test helpers: an in-memory cloud backend and controller wiring.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use sacloud_machine_controller::app_state::AppState;
use sacloud_machine_controller::models::job::{JobId, JobStatus};
use sacloud_machine_controller::store::MachineStore;
use sacloud_machine_controller::models::machine::{Address, Filter, Machine};
use sacloud_machine_controller::services::backend::{
    Archive, BackendError, CloudBackend, PowerState, ServerSpec, ServerState, WaitSettings,
};
use sacloud_machine_controller::services::jobs::JobRegistry;
use sacloud_machine_controller::services::lifecycle::{
    ControllerSettings, MachineController, ReconcileOutcome,
};
use sacloud_machine_controller::services::metadata::{
    CloudInitSeed, MetadataPackager, PackagingError, ServerIdentity,
};
use sacloud_machine_controller::services::JobContext;

#[derive(Default)]
struct FakeCloud {
    next_id: u64,
    servers: HashMap<String, ServerState>,
    images: HashMap<String, Vec<u8>>,
    archives: Vec<Archive>,
    calls: Vec<String>,
    failures: HashMap<&'static str, String>,
    /// Servers that never reach the requested power state.
    stuck: Vec<String>,
    /// Servers removed by someone else as soon as they are shut down.
    vanishing: Vec<String>,
    create_gate: Option<Arc<Semaphore>>,
}

/// In-memory stand-in for the cloud API.
///
/// Every call is logged by operation name; any operation can be made to fail
/// with [`FakeBackend::fail_on`].
#[derive(Default)]
pub struct FakeBackend {
    cloud: Mutex<FakeCloud>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_archive(&self, id: &str, name: &str) {
        self.cloud.lock().unwrap().archives.push(Archive {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    /// Put a server in place as if an earlier run created it.
    pub fn add_server(&self, id: &str, power: PowerState, image_id: Option<&str>) {
        let mut cloud = self.cloud.lock().unwrap();
        cloud.servers.insert(
            id.to_string(),
            ServerState {
                id: id.to_string(),
                name: format!("server-{id}"),
                power,
                disk_ids: vec![format!("disk-{id}")],
                image_id: image_id.map(str::to_string),
                addresses: vec![Address::external("192.0.2.10")],
                tags: vec![],
            },
        );
        if let Some(image_id) = image_id {
            cloud.images.insert(image_id.to_string(), vec![]);
        }
    }

    pub fn fail_on(&self, op: &'static str, message: &str) {
        self.cloud
            .lock()
            .unwrap()
            .failures
            .insert(op, message.to_string());
    }

    pub fn clear_failures(&self) {
        self.cloud.lock().unwrap().failures.clear();
    }

    pub fn never_power(&self, server_id: &str) {
        self.cloud.lock().unwrap().stuck.push(server_id.to_string());
    }

    pub fn vanish_on_shutdown(&self, server_id: &str) {
        self.cloud.lock().unwrap().vanishing.push(server_id.to_string());
    }

    /// Make `create_server` wait until [`FakeBackend::release_create`] is called.
    pub fn hold_create(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.cloud.lock().unwrap().create_gate = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.cloud.lock().unwrap().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == op).count()
    }

    pub fn server(&self, id: &str) -> Option<ServerState> {
        self.cloud.lock().unwrap().servers.get(id).cloned()
    }

    pub fn server_count(&self) -> usize {
        self.cloud.lock().unwrap().servers.len()
    }

    pub fn image_count(&self) -> usize {
        self.cloud.lock().unwrap().images.len()
    }

    fn enter(&self, op: &'static str) -> Result<(), BackendError> {
        let mut cloud = self.cloud.lock().unwrap();
        cloud.calls.push(op.to_string());
        match cloud.failures.get(op) {
            Some(message) => Err(BackendError::Api {
                status: 500,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn archive_matches(archive: &Archive, filters: &[Filter]) -> bool {
    filters.iter().all(|f| match f.name.as_str() {
        "Name" => f.values.contains(&archive.name),
        "ID" => f.values.contains(&archive.id),
        _ => false,
    })
}

#[async_trait]
impl CloudBackend for FakeBackend {
    async fn create_server(&self, _zone: &str, spec: &ServerSpec) -> Result<String, BackendError> {
        self.enter("create_server")?;
        let gate = self.cloud.lock().unwrap().create_gate.clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        let mut cloud = self.cloud.lock().unwrap();
        cloud.next_id += 1;
        let n = cloud.next_id;
        let id = format!("11330000{n:04}");
        cloud.servers.insert(
            id.clone(),
            ServerState {
                id: id.clone(),
                name: spec.name.clone(),
                power: PowerState::Off,
                disk_ids: vec![format!("disk-{id}")],
                image_id: None,
                addresses: vec![Address::external(format!("192.0.2.{n}"))],
                tags: spec.tags.clone(),
            },
        );
        Ok(id)
    }

    async fn read_server(&self, _zone: &str, id: &str) -> Result<Option<ServerState>, BackendError> {
        self.enter("read_server")?;
        Ok(self.server(id))
    }

    async fn shutdown(&self, _zone: &str, id: &str) -> Result<(), BackendError> {
        self.enter("shutdown")?;
        let mut cloud = self.cloud.lock().unwrap();
        let stuck = cloud.stuck.iter().any(|s| s == id);
        let server = cloud
            .servers
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(format!("server {id}")))?;
        if !stuck {
            server.power = PowerState::Off;
        }
        if cloud.vanishing.iter().any(|s| s == id) {
            cloud.servers.remove(id);
        }
        Ok(())
    }

    async fn delete_server_with_disks(
        &self,
        _zone: &str,
        id: &str,
        _disk_ids: &[String],
    ) -> Result<(), BackendError> {
        self.enter("delete_server")?;
        self.cloud
            .lock()
            .unwrap()
            .servers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(format!("server {id}")))
    }

    async fn create_metadata_image(
        &self,
        _zone: &str,
        name: &str,
        _tags: &[String],
        payload: Vec<u8>,
    ) -> Result<String, BackendError> {
        self.enter("create_image")?;
        let id = format!("image-{name}");
        self.cloud.lock().unwrap().images.insert(id.clone(), payload);
        Ok(id)
    }

    async fn attach_image(
        &self,
        _zone: &str,
        server_id: &str,
        image_id: &str,
    ) -> Result<(), BackendError> {
        self.enter("attach_image")?;
        let mut cloud = self.cloud.lock().unwrap();
        let server = cloud
            .servers
            .get_mut(server_id)
            .ok_or_else(|| BackendError::NotFound(format!("server {server_id}")))?;
        server.image_id = Some(image_id.to_string());
        Ok(())
    }

    async fn delete_image(&self, _zone: &str, image_id: &str) -> Result<(), BackendError> {
        self.enter("delete_image")?;
        self.cloud.lock().unwrap().images.remove(image_id);
        Ok(())
    }

    async fn boot(&self, _zone: &str, id: &str) -> Result<(), BackendError> {
        self.enter("boot")?;
        let mut cloud = self.cloud.lock().unwrap();
        let stuck = cloud.stuck.iter().any(|s| s == id);
        let server = cloud
            .servers
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(format!("server {id}")))?;
        if !stuck {
            server.power = PowerState::On;
        }
        Ok(())
    }

    async fn find_archive(
        &self,
        _zone: &str,
        filters: &[Filter],
    ) -> Result<Option<Archive>, BackendError> {
        self.enter("find_archive")?;
        Ok(self
            .cloud
            .lock()
            .unwrap()
            .archives
            .iter()
            .find(|a| archive_matches(a, filters))
            .cloned())
    }

    async fn read_archive(&self, _zone: &str, id: &str) -> Result<Archive, BackendError> {
        self.enter("read_archive")?;
        self.cloud
            .lock()
            .unwrap()
            .archives
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("archive {id}")))
    }
}

/// Skips `mkisofs` but still validates the bootstrap payload.
#[derive(Default)]
pub struct FakePackager;

#[async_trait]
impl MetadataPackager for FakePackager {
    async fn build(
        &self,
        bootstrap_payload: &str,
        identity: &ServerIdentity,
    ) -> Result<Vec<u8>, PackagingError> {
        let seed = CloudInitSeed::new(bootstrap_payload, identity)?;
        let mut iso = seed.user_data;
        iso.extend_from_slice(&seed.meta_data);
        Ok(iso)
    }
}

pub fn fast_wait() -> WaitSettings {
    WaitSettings {
        timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(5),
    }
}

pub fn job_context(backend: Arc<FakeBackend>) -> JobContext {
    JobContext {
        backend,
        packager: Arc::new(FakePackager),
        registry: Arc::new(JobRegistry::new()),
        wait: fast_wait(),
    }
}

fn settings() -> ControllerSettings {
    ControllerSettings {
        requeue_after: Duration::from_millis(10),
        ..ControllerSettings::default()
    }
}

pub fn controller(backend: Arc<FakeBackend>) -> MachineController {
    MachineController::new(job_context(backend), settings())
}

/// Full application state around a fresh store.
pub fn app_state(backend: Arc<FakeBackend>) -> AppState {
    let ctx = job_context(backend);
    let registry = ctx.registry.clone();
    AppState::new(
        MachineController::new(ctx, settings()),
        registry,
        MachineStore::new(),
        4,
    )
}

/// Poll the registry until the job reaches `Done` or `Failed`.
pub async fn wait_for_terminal(registry: &JobRegistry, id: &JobId) -> JobStatus {
    for _ in 0..400 {
        if let Some(status) = registry.get(id) {
            if status.state.is_terminal() {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {id} did not finish: {:?}", registry.get(id));
}

/// Wait until the job a machine points at has finished.
pub async fn wait_for_machine_job(controller: &MachineController, machine: &Machine) -> JobStatus {
    let id = JobId::from(
        machine
            .status
            .job_ref
            .clone()
            .expect("machine has no job_ref"),
    );
    wait_for_terminal(controller.registry(), &id).await
}

/// Reconcile repeatedly until `done` returns true, with a short pause between passes.
///
/// Returns every outcome seen, in order.
pub async fn reconcile_until<F>(
    controller: &MachineController,
    machine: &mut Machine,
    max_passes: usize,
    done: F,
) -> Vec<ReconcileOutcome>
where
    F: Fn(&Machine, &ReconcileOutcome) -> bool,
{
    let mut outcomes = Vec::new();
    for _ in 0..max_passes {
        let outcome = controller
            .reconcile(machine)
            .await
            .unwrap_or(ReconcileOutcome::Halted);
        outcomes.push(outcome);
        if done(machine, &outcome) {
            return outcomes;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "machine {} did not settle after {max_passes} passes: {:?}",
        machine.key(),
        machine.status
    );
}
