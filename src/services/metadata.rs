use async_trait::async_trait;
use base64::Engine;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::process::Command;

/// Size of the ISO image slot reserved on the backend, in MB.
pub const METADATA_IMAGE_SIZE_MB: u32 = 5 * 1024;

const ISO_FILE_NAME: &str = "cloud-init.iso";
const VOLUME_LABEL: &str = "cidata";

/// Identity the server reports about itself through cloud-init meta-data.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerIdentity {
    pub id: String,
    pub name: String,
}

/// The two files of a cloud-init NoCloud seed.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudInitSeed {
    pub user_data: Vec<u8>,
    pub meta_data: Vec<u8>,
}

impl CloudInitSeed {
    /// `bootstrap_payload` is the base64-encoded user data.
    pub fn new(bootstrap_payload: &str, identity: &ServerIdentity) -> Result<Self, PackagingError> {
        let user_data = base64::engine::general_purpose::STANDARD
            .decode(bootstrap_payload.trim())
            .map_err(PackagingError::InvalidBootstrapData)?;

        let meta_data = serde_json::to_vec_pretty(&serde_json::json!({
            "instance-id": identity.id,
            "hostname": identity.name,
            "local-hostname": identity.name,
        }))
        .map_err(PackagingError::MetaData)?;

        Ok(Self {
            user_data,
            meta_data,
        })
    }
}

/// Turns a bootstrap payload into the bytes of a bootable data volume.
#[async_trait]
pub trait MetadataPackager: Send + Sync {
    async fn build(
        &self,
        bootstrap_payload: &str,
        identity: &ServerIdentity,
    ) -> Result<Vec<u8>, PackagingError>;
}

/// Builds the seed ISO with an external `mkisofs`.
pub struct MkisofsPackager {
    command: PathBuf,
}

impl MkisofsPackager {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl MetadataPackager for MkisofsPackager {
    async fn build(
        &self,
        bootstrap_payload: &str,
        identity: &ServerIdentity,
    ) -> Result<Vec<u8>, PackagingError> {
        let seed = CloudInitSeed::new(bootstrap_payload, identity)?;

        // Removed on drop.
        let work_dir: TempDir = tempfile::Builder::new()
            .prefix("caps-")
            .tempdir()
            .map_err(PackagingError::Io)?;
        let seed_dir = work_dir.path().join("seed");
        tokio::fs::create_dir_all(&seed_dir)
            .await
            .map_err(PackagingError::Io)?;
        tokio::fs::write(seed_dir.join("user-data"), &seed.user_data)
            .await
            .map_err(PackagingError::Io)?;
        tokio::fs::write(seed_dir.join("meta-data"), &seed.meta_data)
            .await
            .map_err(PackagingError::Io)?;

        let iso_path = work_dir.path().join(ISO_FILE_NAME);
        let output = Command::new(&self.command)
            .arg("-R")
            .arg("-V")
            .arg(VOLUME_LABEL)
            .arg("-o")
            .arg(&iso_path)
            .arg(&seed_dir)
            .output()
            .await
            .map_err(PackagingError::Io)?;

        if !output.status.success() {
            return Err(PackagingError::Command {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::debug!(server_id = %identity.id, "Built cloud-init seed image");

        tokio::fs::read(&iso_path).await.map_err(PackagingError::Io)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    #[error("Bootstrap data is not valid base64: {0}")]
    InvalidBootstrapData(#[from] base64::DecodeError),

    #[error("Failed to render meta-data: {0}")]
    MetaData(#[from] serde_json::Error),

    #[error("I/O error while packaging metadata image: {0}")]
    Io(#[from] std::io::Error),

    #[error("mkisofs exited with {status:?}: {stderr}")]
    Command { status: Option<i32>, stderr: String },
}
