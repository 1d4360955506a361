//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::EngineError;
use crate::server::serve::serve;
use crate::server::state::ServerState;

/// Run the dockyard engine until `shutdown_signal` resolves
pub async fn run(
    version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), EngineError> {
    info!("Initializing dockyard {}...", version);

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start dockyard: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), EngineError> {
    let app_state = Arc::new(AppState::init(options).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    // No build lock survives a restart, so anything still building was interrupted.
    let recovered = app_state.orchestrator.recover_interrupted().await?;
    if recovered > 0 {
        warn!("{} project(s) were building when the engine stopped", recovered);
    }

    init_socket_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await
}

async fn init_socket_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), EngineError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(app_state.orchestrator.clone());

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_socket_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    socket_server_handle: Option<JoinHandle<Result<(), EngineError>>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            socket_server_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), EngineError> {
        if self.app_state.is_some() {
            return Err(EngineError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_socket_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), EngineError>>,
    ) -> Result<(), EngineError> {
        if self.socket_server_handle.is_some() {
            return Err(EngineError::ShutdownError("server_handle already set".to_string()));
        }
        self.socket_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), EngineError> {
        info!("Shutting down dockyard...");

        // 1. Cancel builds and let them settle; this also ends live log streams
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        // 2. Socket server
        if let Some(handle) = self.socket_server_handle.take() {
            handle.await.map_err(|e| EngineError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
