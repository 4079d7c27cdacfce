use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::models::machine::{Address, Filter};
use crate::services::backend::{
    Archive, BackendError, CloudBackend, PowerState, ServerSpec, ServerState,
};
use crate::services::metadata::METADATA_IMAGE_SIZE_MB;

const USER_AGENT: &str = concat!("sacloud-machine-controller/", env!("CARGO_PKG_VERSION"));

/// SSD disk plan.
const DISK_PLAN_SSD: u32 = 4;

const ISO_FILE_NAME: &str = "cloud-init.iso";

/// Client for the SakuraCloud REST API.
pub struct SakuraCloudClient {
    http: Client,
    root_url: String,
    access_token: String,
    access_token_secret: String,
    /// Bounds the wait for a freshly copied disk to become available.
    disk_wait: Duration,
    poll_interval: Duration,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Str(String),
    Num(u64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Str(s) => s,
            RawId::Num(n) => n.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdOnly {
    #[serde(rename = "ID")]
    id: RawId,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServerEnvelope {
    server: RawServer,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawServer {
    #[serde(rename = "ID")]
    id: RawId,
    name: String,
    #[serde(default)]
    instance: Option<RawInstance>,
    #[serde(default)]
    disks: Vec<IdOnly>,
    #[serde(default)]
    interfaces: Vec<RawInterface>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInstance {
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "CDROM", default)]
    cdrom: Option<IdOnly>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInterface {
    #[serde(rename = "IPAddress", default)]
    ip_address: Option<String>,
    #[serde(rename = "UserIPAddress", default)]
    user_ip_address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiskEnvelope {
    disk: RawDisk,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawDisk {
    #[serde(rename = "ID")]
    id: RawId,
    #[serde(default)]
    availability: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CdromCreated {
    #[serde(rename = "CDROM")]
    cdrom: IdOnly,
    #[serde(rename = "FTPServer")]
    ftp_server: FtpServer,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FtpServer {
    host_name: String,
    user: String,
    password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawArchive {
    #[serde(rename = "ID")]
    id: RawId,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveEnvelope {
    archive: RawArchive,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveList {
    #[serde(default)]
    archives: Vec<RawArchive>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_msg: Option<String>,
}

impl From<RawArchive> for Archive {
    fn from(raw: RawArchive) -> Self {
        Archive {
            id: raw.id.into_string(),
            name: raw.name,
        }
    }
}

impl From<RawServer> for ServerState {
    fn from(raw: RawServer) -> Self {
        let (power, image_id) = match raw.instance {
            Some(instance) => (
                match instance.status.as_deref() {
                    Some("up") => PowerState::On,
                    _ => PowerState::Off,
                },
                instance.cdrom.map(|c| c.id.into_string()),
            ),
            None => (PowerState::Off, None),
        };
        let addresses = raw
            .interfaces
            .into_iter()
            .filter_map(|i| i.ip_address.or(i.user_ip_address))
            .filter(|ip| !ip.is_empty())
            .map(Address::external)
            .collect();

        ServerState {
            id: raw.id.into_string(),
            name: raw.name,
            power,
            disk_ids: raw.disks.into_iter().map(|d| d.id.into_string()).collect(),
            image_id,
            addresses,
            tags: raw.tags,
        }
    }
}

impl SakuraCloudClient {
    pub fn new(
        root_url: impl Into<String>,
        access_token: impl Into<String>,
        access_token_secret: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            http,
            root_url: root_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            access_token_secret: access_token_secret.into(),
            disk_wait: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
        })
    }

    pub fn with_disk_wait(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.disk_wait = timeout;
        self.poll_interval = poll_interval;
        self
    }

    fn url(&self, zone: &str, path: &str) -> String {
        format!("{}/{}/api/cloud/1.1/{}", self.root_url, zone, path)
    }

    fn request(&self, method: Method, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.access_token, Some(&self.access_token_secret))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        what: &str,
        builder: RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = builder.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(what.to_string()));
        }
        let body = response.bytes().await?;
        if !status.is_success() {
            let message = serde_json::from_slice::<ApiErrorBody>(&body)
                .ok()
                .and_then(|b| b.error_msg)
                .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
            return Err(BackendError::Api {
                status: status.as_u16(),
                message,
            });
        }
        if body.is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn wait_disk_available(&self, zone: &str, disk_id: &str) -> Result<(), BackendError> {
        tokio::time::timeout(self.disk_wait, self.poll_disk_available(zone, disk_id))
            .await
            .map_err(|_| BackendError::Timeout {
                what: format!("disk {disk_id} to become available"),
                after: self.disk_wait,
            })?
    }

    async fn poll_disk_available(&self, zone: &str, disk_id: &str) -> Result<(), BackendError> {
        loop {
            let envelope: DiskEnvelope = self
                .send(
                    &format!("disk {disk_id}"),
                    self.request(Method::GET, self.url(zone, &format!("disk/{disk_id}"))),
                )
                .await?;
            if envelope.disk.availability.as_deref() == Some("available") {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl CloudBackend for SakuraCloudClient {
    async fn create_server(&self, zone: &str, spec: &ServerSpec) -> Result<String, BackendError> {
        let body = json!({
            "Server": {
                "Name": spec.name,
                "Description": spec.description,
                "Tags": spec.tags,
                "ServerPlan": {
                    "CPU": spec.cpus,
                    "MemoryMB": spec.memory_gb * 1024,
                    "Commitment": "standard",
                    "Generation": 100,
                },
                "InterfaceDriver": "virtio",
                "ConnectedSwitches": [{ "Scope": "shared" }],
            }
        });
        let created: ServerEnvelope = self
            .send(
                "server",
                self.request(Method::POST, self.url(zone, "server")).json(&body),
            )
            .await?;
        let server_id = created.server.id.into_string();

        let disk_body = json!({
            "Disk": {
                "Name": spec.name,
                "Description": spec.description,
                "Tags": spec.tags,
                "Plan": { "ID": DISK_PLAN_SSD },
                "SizeMB": spec.disk_gb * 1024,
                "Connection": "virtio",
                "SourceArchive": { "ID": spec.source_archive_id },
                "Server": { "ID": server_id },
            }
        });
        let disk: DiskEnvelope = self
            .send(
                "disk",
                self.request(Method::POST, self.url(zone, "disk")).json(&disk_body),
            )
            .await?;
        self.wait_disk_available(zone, &disk.disk.id.into_string())
            .await?;

        Ok(server_id)
    }

    async fn read_server(&self, zone: &str, id: &str) -> Result<Option<ServerState>, BackendError> {
        let result: Result<ServerEnvelope, _> = self
            .send(
                &format!("server {id}"),
                self.request(Method::GET, self.url(zone, &format!("server/{id}"))),
            )
            .await;
        match result {
            Ok(envelope) => Ok(Some(envelope.server.into())),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&self, zone: &str, id: &str) -> Result<(), BackendError> {
        let _: Value = self
            .send(
                &format!("server {id}"),
                self.request(Method::DELETE, self.url(zone, &format!("server/{id}/power")))
                    .json(&json!({ "Force": true })),
            )
            .await?;
        Ok(())
    }

    async fn delete_server_with_disks(
        &self,
        zone: &str,
        id: &str,
        disk_ids: &[String],
    ) -> Result<(), BackendError> {
        let _: Value = self
            .send(
                &format!("server {id}"),
                self.request(Method::DELETE, self.url(zone, &format!("server/{id}")))
                    .json(&json!({ "WithDisk": disk_ids })),
            )
            .await?;
        Ok(())
    }

    async fn create_metadata_image(
        &self,
        zone: &str,
        name: &str,
        tags: &[String],
        payload: Vec<u8>,
    ) -> Result<String, BackendError> {
        let body = json!({
            "CDROM": {
                "Name": name,
                "Description": "",
                "Tags": tags,
                "SizeMB": METADATA_IMAGE_SIZE_MB,
            }
        });
        let created: CdromCreated = self
            .send(
                "cdrom",
                self.request(Method::POST, self.url(zone, "cdrom")).json(&body),
            )
            .await?;
        let image_id = created.cdrom.id.into_string();

        let ftp = created.ftp_server;
        let upload = self
            .http
            .put(format!("https://{}/{}", ftp.host_name, ISO_FILE_NAME))
            .basic_auth(ftp.user, Some(ftp.password))
            .body(payload)
            .send()
            .await?;
        if !upload.status().is_success() {
            return Err(BackendError::Api {
                status: upload.status().as_u16(),
                message: format!("upload of {ISO_FILE_NAME} to image {image_id} failed"),
            });
        }

        let _: Value = self
            .send(
                &format!("cdrom {image_id}"),
                self.request(Method::DELETE, self.url(zone, &format!("cdrom/{image_id}/ftp"))),
            )
            .await?;

        Ok(image_id)
    }

    async fn attach_image(
        &self,
        zone: &str,
        server_id: &str,
        image_id: &str,
    ) -> Result<(), BackendError> {
        let _: Value = self
            .send(
                &format!("server {server_id}"),
                self.request(Method::PUT, self.url(zone, &format!("server/{server_id}/cdrom")))
                    .json(&json!({ "CDROM": { "ID": image_id } })),
            )
            .await?;
        Ok(())
    }

    async fn delete_image(&self, zone: &str, image_id: &str) -> Result<(), BackendError> {
        let _: Value = self
            .send(
                &format!("cdrom {image_id}"),
                self.request(Method::DELETE, self.url(zone, &format!("cdrom/{image_id}"))),
            )
            .await?;
        Ok(())
    }

    async fn boot(&self, zone: &str, id: &str) -> Result<(), BackendError> {
        let _: Value = self
            .send(
                &format!("server {id}"),
                self.request(Method::PUT, self.url(zone, &format!("server/{id}/power"))),
            )
            .await?;
        Ok(())
    }

    async fn find_archive(
        &self,
        zone: &str,
        filters: &[Filter],
    ) -> Result<Option<Archive>, BackendError> {
        let filter: serde_json::Map<String, Value> = filters
            .iter()
            .map(|f| (f.name.clone(), json!(f.values)))
            .collect();
        let query = json!({ "Filter": filter }).to_string();

        let mut url = Url::parse(&self.url(zone, "archive"))
            .map_err(|e| BackendError::Api {
                status: 0,
                message: format!("invalid API URL: {e}"),
            })?;
        url.set_query(Some(&query));

        let list: ArchiveList = self
            .send("archive", self.request(Method::GET, url))
            .await?;
        Ok(list.archives.into_iter().next().map(Archive::from))
    }

    async fn read_archive(&self, zone: &str, id: &str) -> Result<Archive, BackendError> {
        let envelope: ArchiveEnvelope = self
            .send(
                &format!("archive {id}"),
                self.request(Method::GET, self.url(zone, &format!("archive/{id}"))),
            )
            .await?;
        Ok(envelope.archive.into())
    }
}
