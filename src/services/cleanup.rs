use std::time::Instant;

use crate::models::job::{BackendReference, JobId, JobKind, JobStatus};
use crate::models::machine::MachineErrorReason;
use crate::services::backend::PowerState;
use crate::services::jobs::JobPublisher;
use crate::services::{checkpoint, JobContext, StepError};

/// Start removing a server and everything attached to it; returns the job ID.
///
/// A cleanup job already running for the same server is reused.
pub fn start_cleanup(ctx: &JobContext, zone: &str, server_id: &str) -> JobId {
    let job_id = JobId::cleanup(zone, server_id);
    let status = JobStatus::new(job_id.clone(), JobKind::Cleaning)
        .with_reference(BackendReference::server(server_id));

    let Some(job) = ctx.registry.try_begin(status) else {
        tracing::debug!(job_id = %job_id, "Cleanup job already running");
        return job_id;
    };

    metrics::counter!("machine_jobs_started_total", "kind" => "cleaning").increment(1);
    tracing::info!(job_id = %job_id, zone = %zone, server_id = %server_id, "Starting cleanup job");

    let ctx = ctx.clone();
    let zone = zone.to_string();
    let server_id = server_id.to_string();
    tokio::spawn(async move { run(ctx, zone, server_id, job).await });

    job_id
}

async fn run(ctx: JobContext, zone: String, server_id: String, mut job: JobPublisher) {
    let start = Instant::now();
    job.in_flight();

    match cleanup(&ctx, &zone, &server_id, &mut job).await {
        Ok(()) => {
            job.done();
            metrics::counter!("machine_jobs_completed_total", "kind" => "cleaning").increment(1);
            tracing::info!(
                job_id = %job.id(),
                duration_ms = start.elapsed().as_millis() as u64,
                "Cleanup job completed"
            );
        }
        Err(StepError::Cancelled) => {
            tracing::info!(job_id = %job.id(), "Cleanup job stopped after discard");
        }
        Err(e) => {
            tracing::error!(job_id = %job.id(), error = %e, "Cleanup job failed");
            job.fail(MachineErrorReason::DeleteMachine, &e);
            metrics::counter!("machine_jobs_failed_total", "kind" => "cleaning").increment(1);
        }
    }

    metrics::histogram!("machine_job_seconds", "kind" => "cleaning")
        .record(start.elapsed().as_secs_f64());
}

async fn cleanup(
    ctx: &JobContext,
    zone: &str,
    server_id: &str,
    job: &mut JobPublisher,
) -> Result<(), StepError> {
    let Some(server) = ctx.backend.read_server(zone, server_id).await? else {
        // An earlier attempt may already have removed it.
        tracing::info!(job_id = %job.id(), server_id = %server_id, "Server already gone");
        return Ok(());
    };
    checkpoint(job)?;

    if server.power == PowerState::On {
        ctx.backend.shutdown(zone, server_id).await?;
        let stopped = ctx
            .backend
            .wait_until_powered(zone, server_id, PowerState::Off, ctx.wait)
            .await?;
        if stopped.is_none() {
            tracing::info!(job_id = %job.id(), server_id = %server_id, "Server disappeared during shutdown");
            return delete_image(ctx, zone, server.image_id.as_deref(), job).await;
        }
        tracing::debug!(job_id = %job.id(), server_id = %server_id, "Server powered off");
        checkpoint(job)?;
    }

    ctx.backend
        .delete_server_with_disks(zone, server_id, &server.disk_ids)
        .await?;
    tracing::debug!(
        job_id = %job.id(),
        server_id = %server_id,
        disks = server.disk_ids.len(),
        "Server and disks deleted"
    );

    delete_image(ctx, zone, server.image_id.as_deref(), job).await
}

async fn delete_image(
    ctx: &JobContext,
    zone: &str,
    image_id: Option<&str>,
    job: &JobPublisher,
) -> Result<(), StepError> {
    if let Some(image_id) = image_id {
        ctx.backend.delete_image(zone, image_id).await?;
        tracing::debug!(job_id = %job.id(), image_id = %image_id, "Metadata image deleted");
    }
    Ok(())
}
