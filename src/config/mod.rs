use serde::Deserialize;
use std::time::Duration;

use crate::services::backend::WaitSettings;
use crate::services::lifecycle::ControllerSettings;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// HTTP bind address (e.g., "0.0.0.0:8080")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SakuraCloud API access token
    pub sakuracloud_access_token: String,

    /// SakuraCloud API access token secret
    pub sakuracloud_access_token_secret: String,

    /// API root up to the zone segment
    #[serde(default = "default_api_root_url")]
    pub sakuracloud_api_root_url: String,

    /// Zone used when a machine does not name one
    #[serde(default = "default_zone")]
    pub default_zone: String,

    #[serde(default = "default_requeue_interval_secs")]
    pub requeue_interval_secs: u64,

    /// Upper bound for a server to reach the requested power state
    #[serde(default = "default_power_wait_timeout_secs")]
    pub power_wait_timeout_secs: u64,

    #[serde(default = "default_power_poll_interval_secs")]
    pub power_poll_interval_secs: u64,

    /// Machines reconciled in parallel per pass
    #[serde(default = "default_reconcile_concurrency")]
    pub reconcile_concurrency: usize,

    /// ISO builder executable
    #[serde(default = "default_mkisofs_path")]
    pub mkisofs_path: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_api_root_url() -> String {
    "https://secure.sakura.ad.jp/cloud/zone".to_string()
}

fn default_zone() -> String {
    "tk1v".to_string()
}

fn default_requeue_interval_secs() -> u64 {
    20
}

fn default_power_wait_timeout_secs() -> u64 {
    600
}

fn default_power_poll_interval_secs() -> u64 {
    5
}

fn default_reconcile_concurrency() -> usize {
    8
}

fn default_mkisofs_path() -> String {
    "mkisofs".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_interval_secs)
    }

    pub fn wait_settings(&self) -> WaitSettings {
        WaitSettings {
            timeout: Duration::from_secs(self.power_wait_timeout_secs),
            poll_interval: Duration::from_secs(self.power_poll_interval_secs),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            default_zone: self.default_zone.clone(),
            requeue_after: self.requeue_interval(),
            ..ControllerSettings::default()
        }
    }
}
