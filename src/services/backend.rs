use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::machine::{Address, Filter};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
}

/// Request for a new server with a single disk cloned from an archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSpec {
    pub name: String,
    pub cpus: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
    pub source_archive_id: String,
    pub tags: Vec<String>,
    pub description: String,
}

/// What the backend reports about an existing server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerState {
    pub id: String,
    pub name: String,
    pub power: PowerState,
    pub disk_ids: Vec<String>,
    /// Metadata image currently attached, if any.
    pub image_id: Option<String>,
    pub addresses: Vec<Address>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Archive {
    pub id: String,
    pub name: String,
}

/// Bounds for the blocking power-state wait.
#[derive(Debug, Clone, Copy)]
pub struct WaitSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Tags put on every server and disk created for a machine.
pub fn machine_tags(cluster_name: &str, namespace: &str, control_plane: bool) -> Vec<String> {
    vec![
        format!("cluster={cluster_name}"),
        format!("ns={namespace}"),
        format!("control-plane={control_plane}"),
    ]
}

/// Call surface over the cloud provider's server, ISO image and archive APIs.
///
/// Implementations perform no retries; a failed call is reported to the caller.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Create a stopped server; returns its ID.
    async fn create_server(&self, zone: &str, spec: &ServerSpec) -> Result<String, BackendError>;

    /// `Ok(None)` when the server does not exist.
    async fn read_server(&self, zone: &str, id: &str) -> Result<Option<ServerState>, BackendError>;

    /// Forced shutdown.
    async fn shutdown(&self, zone: &str, id: &str) -> Result<(), BackendError>;

    async fn delete_server_with_disks(
        &self,
        zone: &str,
        id: &str,
        disk_ids: &[String],
    ) -> Result<(), BackendError>;

    /// Create an ISO image holding `payload`; returns the image ID.
    async fn create_metadata_image(
        &self,
        zone: &str,
        name: &str,
        tags: &[String],
        payload: Vec<u8>,
    ) -> Result<String, BackendError>;

    async fn attach_image(&self, zone: &str, server_id: &str, image_id: &str)
        -> Result<(), BackendError>;

    async fn delete_image(&self, zone: &str, image_id: &str) -> Result<(), BackendError>;

    async fn boot(&self, zone: &str, id: &str) -> Result<(), BackendError>;

    /// First archive whose fields exactly match every filter.
    async fn find_archive(&self, zone: &str, filters: &[Filter])
        -> Result<Option<Archive>, BackendError>;

    async fn read_archive(&self, zone: &str, id: &str) -> Result<Archive, BackendError>;

    /// Poll until the server reports `want`, bounded by `settings.timeout`.
    ///
    /// A server that disappears counts as powered off and yields `None`.
    async fn wait_until_powered(
        &self,
        zone: &str,
        id: &str,
        want: PowerState,
        settings: WaitSettings,
    ) -> Result<Option<ServerState>, BackendError> {
        tokio::time::timeout(
            settings.timeout,
            poll_power(self, zone, id, want, settings.poll_interval),
        )
        .await
        .map_err(|_| BackendError::Timeout {
            what: format!("server {id} to power {want:?}"),
            after: settings.timeout,
        })?
    }
}

async fn poll_power<B: CloudBackend + ?Sized>(
    backend: &B,
    zone: &str,
    id: &str,
    want: PowerState,
    interval: Duration,
) -> Result<Option<ServerState>, BackendError> {
    loop {
        match backend.read_server(zone, id).await? {
            Some(server) if server.power == want => return Ok(Some(server)),
            Some(_) => {}
            None if want == PowerState::Off => return Ok(None),
            None => return Err(BackendError::NotFound(format!("server {id}"))),
        }
        tokio::time::sleep(interval).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Failed to decode API response: {0}")]
    Decode(#[from] serde_json::Error),
}
