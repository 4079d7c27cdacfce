//! Job engine, cloud gateway and the machine lifecycle controller.

pub mod backend;
pub mod cleanup;
pub mod endpoints;
pub mod jobs;
pub mod lifecycle;
pub mod metadata;
pub mod orchestrator;
pub mod provisioning;
pub mod sacloud;

use std::sync::Arc;

use backend::{BackendError, CloudBackend, WaitSettings};
use jobs::{JobPublisher, JobRegistry};
use metadata::{MetadataPackager, PackagingError};

/// Everything a background job needs; cheap to clone into a task.
#[derive(Clone)]
pub struct JobContext {
    pub backend: Arc<dyn CloudBackend>,
    pub packager: Arc<dyn MetadataPackager>,
    pub registry: Arc<JobRegistry>,
    pub wait: WaitSettings,
}

/// Why a job step did not complete.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Packaging(#[from] PackagingError),

    #[error("job was discarded")]
    Cancelled,
}

/// Step boundary: stop once the registry has discarded the job.
pub(crate) fn checkpoint(job: &JobPublisher) -> Result<(), StepError> {
    if job.is_cancelled() {
        return Err(StepError::Cancelled);
    }
    Ok(())
}
