//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::EngineConfig;
use crate::storage::layout::StorageLayout;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Server configuration
    pub server: ServerOptions,

    /// Build pipeline tunables
    pub engine: EngineConfig,

    /// Where systemd unit files are written
    pub unit_dir: PathBuf,

    /// Reverse proxy collaborator
    pub proxy: ProxyOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout: StorageLayout::default(),
            server: ServerOptions::default(),
            engine: EngineConfig::default(),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            proxy: ProxyOptions::default(),
        }
    }
}

/// Lifecycle options for the engine process
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8420,
        }
    }
}

/// Reverse proxy options. Routes are never registered without a base URL.
#[derive(Clone, Default)]
pub struct ProxyOptions {
    pub base_url: Option<String>,
    pub api_token: Option<String>,
}

impl std::fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "***"))
            .finish()
    }
}
