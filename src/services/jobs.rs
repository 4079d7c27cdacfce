use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::models::job::{BackendReference, JobError, JobId, JobKind, JobState, JobStatus};
use crate::models::machine::{Address, MachineErrorReason};

struct JobEntry {
    status: JobStatus,
    epoch: u64,
    cancel: CancellationToken,
}

/// Concurrency-safe store of job status records.
///
/// Each key has a single writer: the [`JobPublisher`] handed out when the
/// job was registered. Readers get a snapshot of the latest write.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, JobEntry>,
    epochs: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a status record.
    pub fn set(&self, id: JobId, status: JobStatus) {
        let epoch = self.next_epoch();
        match self.jobs.entry(id) {
            Entry::Occupied(mut e) => e.get_mut().status = status,
            Entry::Vacant(e) => {
                e.insert(JobEntry {
                    status,
                    epoch,
                    cancel: CancellationToken::new(),
                });
            }
        }
    }

    pub fn get(&self, id: &JobId) -> Option<JobStatus> {
        self.jobs.get(id).map(|e| e.status.clone())
    }

    /// Remove an entry. No-op when already gone.
    pub fn delete(&self, id: &JobId) {
        self.jobs.remove(id);
    }

    /// Remove an entry and tell its task to stop at the next step boundary.
    pub fn discard(&self, id: &JobId) {
        if let Some((_, entry)) = self.jobs.remove(id) {
            entry.cancel.cancel();
            tracing::info!(job_id = %id, state = ?entry.status.state, "Discarded job");
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Register a new job unless one with the same ID is still running.
    ///
    /// Returns `None` when a `Pending`/`InFlight` job already owns the ID. A
    /// terminal entry under the same ID is replaced.
    pub fn try_begin(self: &Arc<Self>, status: JobStatus) -> Option<JobPublisher> {
        let epoch = self.next_epoch();
        let cancel = CancellationToken::new();
        let entry = JobEntry {
            status: status.clone(),
            epoch,
            cancel: cancel.clone(),
        };
        match self.jobs.entry(status.id.clone()) {
            Entry::Occupied(mut e) => {
                if !e.get().status.state.is_terminal() {
                    return None;
                }
                e.insert(entry);
            }
            Entry::Vacant(e) => {
                e.insert(entry);
            }
        }
        Some(JobPublisher {
            registry: Arc::clone(self),
            status,
            epoch,
            cancel,
        })
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed)
    }

    /// Overwrite `status` only if the entry still belongs to `epoch`.
    fn publish(&self, epoch: u64, status: &JobStatus) -> bool {
        match self.jobs.get_mut(&status.id) {
            Some(mut entry) if entry.epoch == epoch => {
                entry.status = status.clone();
                true
            }
            _ => false,
        }
    }
}

/// Exclusive writer for one job's status; moved into the job's task.
pub struct JobPublisher {
    registry: Arc<JobRegistry>,
    status: JobStatus,
    epoch: u64,
    cancel: CancellationToken,
}

impl JobPublisher {
    pub fn id(&self) -> &JobId {
        &self.status.id
    }

    pub fn kind(&self) -> JobKind {
        self.status.kind
    }

    pub fn status(&self) -> &JobStatus {
        &self.status
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn in_flight(&mut self) {
        self.advance(JobState::InFlight);
    }

    pub fn record_server(&mut self, server_id: &str) {
        self.reference_mut().server_id = server_id.to_string();
        self.publish();
    }

    pub fn record_image(&mut self, image_id: &str) {
        self.reference_mut().image_id = Some(image_id.to_string());
        self.publish();
    }

    pub fn record_addresses(&mut self, addresses: Vec<Address>) {
        self.reference_mut().addresses = addresses;
        self.publish();
    }

    pub fn done(&mut self) {
        self.advance(JobState::Done);
    }

    pub fn fail(&mut self, reason: MachineErrorReason, err: &dyn std::fmt::Display) {
        if self.status.state.is_terminal() {
            return;
        }
        self.status.error = Some(JobError {
            reason,
            message: err.to_string(),
        });
        self.advance(JobState::Failed);
    }

    fn reference_mut(&mut self) -> &mut BackendReference {
        self.status
            .reference
            .get_or_insert_with(BackendReference::default)
    }

    fn advance(&mut self, next: JobState) {
        if !self.status.state.can_advance_to(next) {
            tracing::warn!(
                job_id = %self.status.id,
                from = ?self.status.state,
                to = ?next,
                "Ignoring job state regression"
            );
            return;
        }
        self.status.state = next;
        self.publish();
    }

    fn publish(&mut self) {
        self.status.updated_at = Utc::now();
        if !self.registry.publish(self.epoch, &self.status) {
            tracing::debug!(job_id = %self.status.id, "Job entry no longer owned, dropping update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: &str) -> JobStatus {
        JobStatus::new(JobId::from(id), JobKind::Provisioning)
    }

    #[test]
    fn test_set_get_delete() {
        let registry = JobRegistry::new();
        let id = JobId::from("build/a");
        assert!(registry.get(&id).is_none());

        registry.set(id.clone(), status("build/a"));
        assert_eq!(registry.get(&id).unwrap().state, JobState::Pending);

        registry.delete(&id);
        assert!(registry.get(&id).is_none());
        // Deleting twice is fine.
        registry.delete(&id);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_try_begin_rejects_running_duplicate() {
        let registry = Arc::new(JobRegistry::new());
        let first = registry.try_begin(status("build/a"));
        assert!(first.is_some());
        assert!(registry.try_begin(status("build/a")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_try_begin_replaces_terminal_entry() {
        let registry = Arc::new(JobRegistry::new());
        let mut done = status("build/a");
        done.state = JobState::Failed;
        registry.set(done.id.clone(), done);

        assert!(registry.try_begin(status("build/a")).is_some());
        assert_eq!(
            registry.get(&JobId::from("build/a")).unwrap().state,
            JobState::Pending
        );
    }

    #[test]
    fn test_publisher_writes_are_monotonic() {
        let registry = Arc::new(JobRegistry::new());
        let mut publisher = registry.try_begin(status("build/a")).unwrap();
        let id = publisher.id().clone();

        publisher.in_flight();
        publisher.record_server("123");
        publisher.done();
        publisher.fail(MachineErrorReason::CreateMachine, &"late failure");

        let seen = registry.get(&id).unwrap();
        assert_eq!(seen.state, JobState::Done);
        assert!(seen.error.is_none());
        assert_eq!(seen.server_id(), Some("123"));
    }

    #[test]
    fn test_discarded_publisher_stops_writing() {
        let registry = Arc::new(JobRegistry::new());
        let mut publisher = registry.try_begin(status("build/a")).unwrap();
        let id = publisher.id().clone();

        registry.discard(&id);
        assert!(publisher.is_cancelled());

        publisher.in_flight();
        assert!(registry.get(&id).is_none());
    }
}
