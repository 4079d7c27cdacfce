use serde::{Deserialize, Serialize};

/// Port the control plane API server listens on.
pub const API_ENDPOINT_PORT: u16 = 6443;

/// Where a cluster's API server can be reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

impl ApiEndpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: API_ENDPOINT_PORT,
        }
    }
}
