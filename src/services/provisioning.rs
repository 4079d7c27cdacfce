use std::time::Instant;

use crate::models::job::{JobId, JobKind, JobStatus};
use crate::models::machine::MachineErrorReason;
use crate::services::backend::{machine_tags, PowerState, ServerSpec};
use crate::services::jobs::JobPublisher;
use crate::services::metadata::ServerIdentity;
use crate::services::{checkpoint, JobContext, StepError};

/// Everything needed to build one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    pub server_name: String,
    pub cluster_name: String,
    pub namespace: String,
    pub control_plane: bool,
    pub source_archive_id: String,
    /// Base64-encoded cloud-init user data.
    pub bootstrap_data: String,
    pub cpus: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
}

impl ProvisionRequest {
    pub fn job_id(&self) -> JobId {
        JobId::provisioning(&self.namespace, &self.cluster_name, &self.server_name)
    }

    fn tags(&self) -> Vec<String> {
        machine_tags(&self.cluster_name, &self.namespace, self.control_plane)
    }

    fn server_spec(&self) -> ServerSpec {
        ServerSpec {
            name: self.server_name.clone(),
            cpus: self.cpus,
            memory_gb: self.memory_gb,
            disk_gb: self.disk_gb,
            source_archive_id: self.source_archive_id.clone(),
            tags: self.tags(),
            description: String::new(),
        }
    }
}

/// Start building a server in the background and return its job ID.
///
/// If a job with the same ID is still pending or in flight, nothing new is
/// started and the existing ID is returned.
pub fn start_provisioning(ctx: &JobContext, zone: &str, request: ProvisionRequest) -> JobId {
    let job_id = request.job_id();
    let status = JobStatus::new(job_id.clone(), JobKind::Provisioning);

    let Some(job) = ctx.registry.try_begin(status) else {
        tracing::debug!(job_id = %job_id, "Provisioning job already running");
        return job_id;
    };

    metrics::counter!("machine_jobs_started_total", "kind" => "provisioning").increment(1);
    tracing::info!(
        job_id = %job_id,
        zone = %zone,
        server = %request.server_name,
        cpus = request.cpus,
        memory_gb = request.memory_gb,
        disk_gb = request.disk_gb,
        "Starting provisioning job"
    );

    let ctx = ctx.clone();
    let zone = zone.to_string();
    tokio::spawn(async move { run(ctx, zone, request, job).await });

    job_id
}

async fn run(ctx: JobContext, zone: String, request: ProvisionRequest, mut job: JobPublisher) {
    let start = Instant::now();
    job.in_flight();

    match provision(&ctx, &zone, &request, &mut job).await {
        Ok(()) => {
            job.done();
            metrics::counter!("machine_jobs_completed_total", "kind" => "provisioning")
                .increment(1);
            tracing::info!(
                job_id = %job.id(),
                duration_ms = start.elapsed().as_millis() as u64,
                "Provisioning job completed"
            );
        }
        Err(StepError::Cancelled) => {
            tracing::warn!(
                job_id = %job.id(),
                server_id = job.status().server_id().unwrap_or_default(),
                "Provisioning job stopped after discard"
            );
        }
        Err(e) => {
            tracing::error!(job_id = %job.id(), error = %e, "Provisioning job failed");
            job.fail(MachineErrorReason::CreateMachine, &e);
            metrics::counter!("machine_jobs_failed_total", "kind" => "provisioning").increment(1);
        }
    }

    metrics::histogram!("machine_job_seconds", "kind" => "provisioning")
        .record(start.elapsed().as_secs_f64());
}

async fn provision(
    ctx: &JobContext,
    zone: &str,
    request: &ProvisionRequest,
    job: &mut JobPublisher,
) -> Result<(), StepError> {
    // 1. server + disk, created stopped so the seed image can be inserted first
    let server_id = ctx
        .backend
        .create_server(zone, &request.server_spec())
        .await?;
    job.record_server(&server_id);
    tracing::debug!(job_id = %job.id(), server_id = %server_id, "Server created");
    checkpoint(job)?;

    // 2. cloud-init seed image
    let identity = ServerIdentity {
        id: server_id.clone(),
        name: request.server_name.clone(),
    };
    let payload = ctx
        .packager
        .build(&request.bootstrap_data, &identity)
        .await?;
    let image_id = ctx
        .backend
        .create_metadata_image(zone, &request.server_name, &request.tags(), payload)
        .await?;
    job.record_image(&image_id);
    tracing::debug!(job_id = %job.id(), image_id = %image_id, "Metadata image uploaded");
    checkpoint(job)?;

    // 3. insert and boot
    ctx.backend.attach_image(zone, &server_id, &image_id).await?;
    ctx.backend.boot(zone, &server_id).await?;

    // 4. wait for power-on
    if let Some(server) = ctx
        .backend
        .wait_until_powered(zone, &server_id, PowerState::On, ctx.wait)
        .await?
    {
        job.record_addresses(server.addresses);
    }

    Ok(())
}
