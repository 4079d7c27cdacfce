use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::machine::{Address, MachineErrorReason};

/// Identity of a background job.
///
/// Derived from the operation kind and the resource identity, so deriving it
/// twice for the same machine yields the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// `build/<namespace>/<cluster>/<name>`
    pub fn provisioning(namespace: &str, cluster: &str, name: &str) -> Self {
        Self(format!("build/{namespace}/{cluster}/{name}"))
    }

    /// `cleanup/<zone>/<server id>`
    pub fn cleanup(zone: &str, server_id: &str) -> Self {
        Self(format!("cleanup/{zone}/{server_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Provisioning,
    Cleaning,
}

/// Progress of a background job. Only ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_advance_to(self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Pending, JobState::InFlight) => true,
            (JobState::Pending | JobState::InFlight, JobState::Done | JobState::Failed) => true,
            _ => false,
        }
    }
}

/// Cloud-assigned identifiers produced while a job runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BackendReference {
    pub server_id: String,
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<Address>,
}

impl BackendReference {
    pub fn server(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub reason: MachineErrorReason,
    pub message: String,
}

/// Status record of one provisioning or cleanup job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub reference: Option<BackendReference>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    pub fn new(id: JobId, kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            state: JobState::Pending,
            reference: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_reference(mut self, reference: BackendReference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn server_id(&self) -> Option<&str> {
        self.reference
            .as_ref()
            .map(|r| r.server_id.as_str())
            .filter(|id| !id.is_empty())
    }
}
