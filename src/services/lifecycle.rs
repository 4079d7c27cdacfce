//! Convergence routine for machine records.
//!
//! Every call reads the record, looks at (or starts) at most one job, applies
//! at most one lifecycle transition and returns. Cloud work only ever happens
//! inside job tasks, so a pass never waits on a server to boot or stop.

use std::time::{Duration, Instant};

use crate::models::job::{JobId, JobKind, JobState, JobStatus};
use crate::models::machine::{LifecycleState, Machine, MachineErrorReason, SourceImageInfo};
use crate::services::backend::BackendError;
use crate::services::cleanup::start_cleanup;
use crate::services::jobs::JobRegistry;
use crate::services::provisioning::{start_provisioning, ProvisionRequest};
use crate::services::JobContext;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Zone used when a machine does not name one.
    pub default_zone: String,
    pub requeue_after: Duration,
    /// Scheme of `spec.provider_id`, e.g. `sakuracloud://<server id>`.
    pub provider_scheme: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            default_zone: "tk1v".to_string(),
            requeue_after: Duration::from_secs(20),
            provider_scheme: "sakuracloud".to_string(),
        }
    }
}

/// What the caller should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Observed state matches desired state.
    Converged,
    /// Not there yet; call again later.
    Requeue(Duration),
    /// A terminal error is recorded; nothing happens until the spec is edited.
    Halted,
    /// The server is gone and the record may be removed.
    Finalize,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to resolve source archive: {0}")]
    SourceArchive(#[source] BackendError),

    #[error("source archive not found")]
    ArchiveNotFound,

    #[error("machine {0} has no source archive")]
    MissingSourceImage(String),

    #[error("machine {0} has no bootstrap data")]
    MissingBootstrapData(String),
}

pub struct MachineController {
    jobs: JobContext,
    settings: ControllerSettings,
}

impl MachineController {
    pub fn new(jobs: JobContext, settings: ControllerSettings) -> Self {
        Self { jobs, settings }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.jobs.registry
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    fn zone(&self, machine: &Machine) -> String {
        machine
            .spec
            .zone
            .clone()
            .unwrap_or_else(|| self.settings.default_zone.clone())
    }

    /// One full reconciliation pass for a machine record.
    ///
    /// `machine` is mutated in place; the caller persists it whatever the result.
    pub async fn reconcile(&self, machine: &mut Machine) -> Result<ReconcileOutcome, ReconcileError> {
        let start = Instant::now();
        let result = self.reconcile_inner(machine).await;
        machine.status.observed_generation = machine.metadata.generation;

        metrics::histogram!("machine_reconcile_seconds").record(start.elapsed().as_secs_f64());
        match &result {
            Ok(outcome) => tracing::debug!(
                machine = %machine.key(),
                state = %machine.status.state,
                outcome = ?outcome,
                "Reconciled machine"
            ),
            Err(e) => tracing::warn!(machine = %machine.key(), error = %e, "Reconcile failed"),
        }
        result
    }

    async fn reconcile_inner(
        &self,
        machine: &mut Machine,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if machine.has_error() && machine.spec_changed() {
            self.restart_after_error(machine);
        }

        if machine.metadata.deletion_requested {
            return Ok(self.reconcile_delete(machine));
        }

        if machine.has_error() {
            tracing::info!(machine = %machine.key(), "Error state detected, skipping reconciliation");
            return Ok(ReconcileOutcome::Halted);
        }

        if self.resolve_source_image(machine).await? {
            return Ok(ReconcileOutcome::Requeue(self.settings.requeue_after));
        }

        if machine.spec.bootstrap_data.is_none() {
            tracing::info!(machine = %machine.key(), "Waiting for bootstrap data to be available");
            return Ok(ReconcileOutcome::Requeue(self.settings.requeue_after));
        }

        self.reconcile_server(machine)?;

        if machine.has_error() {
            return Ok(ReconcileOutcome::Halted);
        }
        if machine.status.state != LifecycleState::Ready {
            tracing::debug!(
                machine = %machine.key(),
                expected = %LifecycleState::Ready,
                actual = %machine.status.state,
                "Requeuing until server state is reconciled"
            );
            return Ok(ReconcileOutcome::Requeue(self.settings.requeue_after));
        }

        if let Some(server_id) = machine.server_ref().map(str::to_string) {
            let provider_id = format!("{}://{}", self.settings.provider_scheme, server_id);
            if machine.spec.provider_id.as_deref() != Some(provider_id.as_str()) {
                tracing::debug!(machine = %machine.key(), provider_id = %provider_id, "Updated provider ID");
                machine.spec.provider_id = Some(provider_id);
            }
        }
        machine.status.ready = true;

        Ok(ReconcileOutcome::Converged)
    }

    fn reconcile_delete(&self, machine: &mut Machine) -> ReconcileOutcome {
        tracing::debug!(machine = %machine.key(), "Handling deleted machine");
        machine.status.ready = false;
        self.destroy_server(machine);

        if machine.status.state == LifecycleState::NotFound {
            return ReconcileOutcome::Finalize;
        }
        if machine.has_error() {
            return ReconcileOutcome::Halted;
        }
        ReconcileOutcome::Requeue(self.settings.requeue_after)
    }

    /// Forget the failed attempt so the next pass starts a fresh job.
    fn restart_after_error(&self, machine: &mut Machine) {
        tracing::info!(
            machine = %machine.key(),
            generation = machine.metadata.generation,
            reason = ?machine.status.error_reason,
            "Desired state changed after error, retrying"
        );
        if let Some(job_ref) = machine.status.job_ref.take() {
            self.jobs.registry.discard(&JobId::from(job_ref));
        }
        machine.clear_error();
    }

    /// Fill in the source archive ID and info. Returns whether anything changed.
    async fn resolve_source_image(&self, machine: &mut Machine) -> Result<bool, ReconcileError> {
        let zone = self.zone(machine);
        let mut changed = false;

        if machine.spec.source_image.id.is_none() {
            let found = self
                .jobs
                .backend
                .find_archive(&zone, &machine.spec.source_image.filters)
                .await;
            match found {
                Ok(Some(archive)) => {
                    tracing::info!(
                        machine = %machine.key(),
                        archive_id = %archive.id,
                        archive = %archive.name,
                        "Resolved source archive"
                    );
                    machine.spec.source_image.id = Some(archive.id.clone());
                    machine.status.source_image = Some(SourceImageInfo {
                        id: archive.id,
                        name: archive.name,
                    });
                    changed = true;
                }
                Ok(None) => {
                    machine.set_error(MachineErrorReason::InvalidConfiguration, "archive not found");
                    return Err(ReconcileError::ArchiveNotFound);
                }
                Err(e) => {
                    machine.set_error(MachineErrorReason::InvalidConfiguration, e.to_string());
                    return Err(ReconcileError::SourceArchive(e));
                }
            }
        }

        if machine.status.source_image.is_none() {
            let Some(id) = machine.spec.source_image.id.clone() else {
                return Err(ReconcileError::MissingSourceImage(machine.key()));
            };
            match self.jobs.backend.read_archive(&zone, &id).await {
                Ok(archive) => {
                    machine.status.source_image = Some(SourceImageInfo {
                        id: archive.id,
                        name: archive.name,
                    });
                    changed = true;
                }
                Err(e) => {
                    machine.set_error(MachineErrorReason::InvalidConfiguration, e.to_string());
                    return Err(ReconcileError::SourceArchive(e));
                }
            }
        }

        Ok(changed)
    }

    fn provision_request(&self, machine: &Machine) -> Result<ProvisionRequest, ReconcileError> {
        let source_archive_id = machine
            .status
            .source_image
            .as_ref()
            .map(|s| s.id.clone())
            .or_else(|| machine.spec.source_image.id.clone())
            .ok_or_else(|| ReconcileError::MissingSourceImage(machine.key()))?;
        let bootstrap_data = machine
            .spec
            .bootstrap_data
            .clone()
            .ok_or_else(|| ReconcileError::MissingBootstrapData(machine.key()))?;

        Ok(ProvisionRequest {
            server_name: machine.metadata.name.clone(),
            cluster_name: machine.metadata.cluster_name.clone(),
            namespace: machine.metadata.namespace.clone(),
            control_plane: machine.spec.control_plane,
            source_archive_id,
            bootstrap_data,
            cpus: machine.spec.cpus,
            memory_gb: machine.spec.memory_gb,
            disk_gb: machine.spec.disk_gb,
        })
    }

    /// Creation path: advance toward `Ready` by at most one step.
    pub fn reconcile_server(&self, machine: &mut Machine) -> Result<(), ReconcileError> {
        let state = machine.status.state;
        if state == LifecycleState::Ready && machine.status.job_ref.is_none() {
            return Ok(());
        }

        let Some(job_ref) = machine.status.job_ref.clone() else {
            if !state.is_pre_ready() {
                return Ok(());
            }
            if let Some(build_id) = self.tracked_build(machine) {
                tracing::info!(machine = %machine.key(), job_id = %build_id, "Resuming tracked provisioning job");
                machine.status.job_ref = Some(build_id.to_string());
                machine.status.state = LifecycleState::Provisioning;
                return Ok(());
            }

            let zone = self.zone(machine);

            // A failed attempt left a server behind; remove it before building again.
            if let Some(server_id) = machine.server_ref().map(str::to_string) {
                let job_id = start_cleanup(&self.jobs, &zone, &server_id);
                tracing::info!(
                    machine = %machine.key(),
                    job_id = %job_id,
                    server_id = %server_id,
                    "Cleaning up server left by a failed attempt"
                );
                machine.status.job_ref = Some(job_id.to_string());
                return Ok(());
            }

            let request = self.provision_request(machine)?;
            let job_id = start_provisioning(&self.jobs, &zone, request);
            tracing::info!(machine = %machine.key(), job_id = %job_id, "Provisioning started");
            machine.status.job_ref = Some(job_id.to_string());
            machine.status.state = LifecycleState::Provisioning;
            return Ok(());
        };

        let job_id = JobId::from(job_ref);
        let Some(job) = self.jobs.registry.get(&job_id) else {
            tracing::debug!(machine = %machine.key(), job_id = %job_id, "Waiting for job to start");
            return Ok(());
        };

        if job.error.is_some() || job.state == JobState::Failed {
            record_leftover_server(machine, &job);
            record_job_error(machine, &job, MachineErrorReason::CreateMachine);
            return Ok(());
        }

        match (job.kind, job.state) {
            // Failed jobs were handled above.
            (_, JobState::Pending | JobState::InFlight | JobState::Failed) => {}
            (JobKind::Provisioning, JobState::Done) => {
                if let Some(reference) = job.reference {
                    machine.spec.machine_ref = Some(reference.server_id.clone());
                    machine.status.server_ref = Some(reference.server_id);
                    machine.status.image_ref = reference.image_id;
                    machine.status.addresses = reference.addresses;
                }
                self.jobs.registry.delete(&job_id);
                machine.status.job_ref = None;
                machine.status.state = LifecycleState::Ready;
                tracing::info!(
                    machine = %machine.key(),
                    server_id = ?machine.status.server_ref,
                    "Server is ready"
                );
            }
            (JobKind::Cleaning, JobState::Done) => {
                clear_server_refs(machine);
                self.jobs.registry.delete(&job_id);
                machine.status.job_ref = None;
                tracing::info!(machine = %machine.key(), "Leftover server removed");
            }
        }

        Ok(())
    }

    /// A provisioning job for this machine that its record lost track of.
    ///
    /// An earlier pass may have started it and then failed to write back.
    fn tracked_build(&self, machine: &Machine) -> Option<JobId> {
        let id = JobId::provisioning(
            &machine.metadata.namespace,
            &machine.metadata.cluster_name,
            &machine.metadata.name,
        );
        self.jobs.registry.get(&id).map(|_| id)
    }

    /// Deletion path: advance toward `NotFound` by at most one step.
    pub fn destroy_server(&self, machine: &mut Machine) {
        if machine.status.state == LifecycleState::NotFound {
            return;
        }

        let Some(job_ref) = machine.status.job_ref.clone() else {
            if machine.server_ref().is_none() {
                if let Some(build_id) = self.tracked_build(machine) {
                    // Discarded as stale next pass, which keeps any server it made.
                    tracing::info!(machine = %machine.key(), job_id = %build_id, "Found untracked provisioning job");
                    machine.status.job_ref = Some(build_id.to_string());
                    return;
                }
            }
            match machine.server_ref().map(str::to_string) {
                None => {
                    tracing::info!(machine = %machine.key(), "No server to remove");
                    machine.status.state = LifecycleState::NotFound;
                }
                Some(server_id) => {
                    let zone = self.zone(machine);
                    let job_id = start_cleanup(&self.jobs, &zone, &server_id);
                    tracing::info!(machine = %machine.key(), job_id = %job_id, "Cleanup started");
                    machine.status.job_ref = Some(job_id.to_string());
                    machine.status.state = LifecycleState::Cleaning;
                }
            }
            return;
        };

        let job_id = JobId::from(job_ref);
        let Some(job) = self.jobs.registry.get(&job_id) else {
            tracing::debug!(machine = %machine.key(), job_id = %job_id, "Waiting for job to start");
            return;
        };

        if job.kind != JobKind::Cleaning {
            tracing::info!(
                machine = %machine.key(),
                job_id = %job_id,
                kind = ?job.kind,
                "Discarding stale job"
            );
            record_leftover_server(machine, &job);
            self.jobs.registry.discard(&job_id);
            machine.status.job_ref = None;
            return;
        }

        if job.error.is_some() || job.state == JobState::Failed {
            record_job_error(machine, &job, MachineErrorReason::DeleteMachine);
            return;
        }

        if job.state == JobState::Done {
            clear_server_refs(machine);
            self.jobs.registry.delete(&job_id);
            machine.status.job_ref = None;
            machine.status.state = LifecycleState::NotFound;
            tracing::info!(machine = %machine.key(), "Server removed");
        }
    }
}

fn record_job_error(machine: &mut Machine, job: &JobStatus, fallback: MachineErrorReason) {
    let (reason, message) = match &job.error {
        Some(err) => (err.reason, err.message.clone()),
        None => (fallback, format!("job {} failed", job.id)),
    };
    tracing::warn!(machine = %machine.key(), job_id = %job.id, error = %message, "Job failed");
    machine.set_error(reason, message);
}

/// Keep track of a server a job created even if the job did not finish.
fn record_leftover_server(machine: &mut Machine, job: &JobStatus) {
    if job.kind != JobKind::Provisioning || machine.server_ref().is_some() {
        return;
    }
    if let Some(server_id) = job.server_id() {
        machine.spec.machine_ref = Some(server_id.to_string());
        machine.status.server_ref = Some(server_id.to_string());
    }
}

fn clear_server_refs(machine: &mut Machine) {
    machine.spec.machine_ref = None;
    machine.spec.provider_id = None;
    machine.status.server_ref = None;
    machine.status.image_ref = None;
    machine.status.addresses.clear();
}
