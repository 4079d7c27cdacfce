use std::sync::Arc;

use crate::services::endpoints::EndpointRegistry;
use crate::services::jobs::JobRegistry;
use crate::services::lifecycle::MachineController;
use crate::store::MachineStore;

/// Shared application state passed to route handlers and the reconcile loop.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<MachineController>,
    pub registry: Arc<JobRegistry>,
    pub store: Arc<MachineStore>,
    pub endpoints: Arc<EndpointRegistry>,
    /// Machines reconciled in parallel per pass.
    pub concurrency: usize,
}

impl AppState {
    pub fn new(
        controller: MachineController,
        registry: Arc<JobRegistry>,
        store: MachineStore,
        concurrency: usize,
    ) -> Self {
        Self {
            controller: Arc::new(controller),
            registry,
            store: Arc::new(store),
            endpoints: Arc::new(EndpointRegistry::new()),
            concurrency: concurrency.max(1),
        }
    }
}
