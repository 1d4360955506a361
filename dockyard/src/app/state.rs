//! Application state management

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::options::AppOptions;
use crate::deploy::supervisor::{ServiceManager, SystemdManager};
use crate::deploy::Orchestrator;
use crate::errors::EngineError;
use crate::proxy::{DisabledProxy, HttpProxyClient, ReverseProxy};
use crate::storage::db::{Database, DbHandle};

/// How often shutdown checks whether builds have wound down
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Main application state
pub struct AppState {
    /// Build and lifecycle coordinator
    pub orchestrator: Arc<Orchestrator>,

    /// Parent of every build's cancellation token
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Prepare storage, open the database and wire the collaborators
    pub async fn init(options: &AppOptions) -> Result<Self, EngineError> {
        info!("Initializing application state...");

        options.layout.setup().await?;

        let db_path = options.layout.database_file().path().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Database::open(&db_path)).await??;
        let db = DbHandle::new(db);

        let services: Arc<dyn ServiceManager> =
            Arc::new(SystemdManager::new(options.unit_dir.clone()));

        let proxy: Arc<dyn ReverseProxy> = match &options.proxy.base_url {
            Some(base_url) => {
                info!("Registering routes through {}", base_url);
                Arc::new(HttpProxyClient::new(
                    base_url,
                    options.proxy.api_token.clone(),
                )?)
            }
            None => {
                info!("No reverse proxy configured, routes will not be registered");
                Arc::new(DisabledProxy)
            }
        };

        let shutdown = CancellationToken::new();
        let orchestrator = Arc::new(Orchestrator::new(
            db,
            options.layout.clone(),
            services,
            proxy,
            options.engine.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            orchestrator,
            shutdown,
        })
    }

    /// Cancel running builds and wait for their pipelines to record the outcome
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        info!("Shutting down application state...");
        self.shutdown.cancel();
        loop {
            let remaining = self.orchestrator.builds_in_flight();
            if remaining == 0 {
                return Ok(());
            }
            debug!("Waiting for {} build(s) to stop...", remaining);
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}
