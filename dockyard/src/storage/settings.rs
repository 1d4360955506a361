//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Engine settings, read from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageSettings,

    /// Build and supervision configuration
    #[serde(default)]
    pub engine: EngineSettings,

    /// Reverse proxy collaborator
    #[serde(default)]
    pub proxy: ProxySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            server: ServerSettings::default(),
            storage: StorageSettings::default(),
            engine: EngineSettings::default(),
            proxy: ProxySettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `file`, falling back to defaults when it does not exist
    pub async fn load_or_default(file: &File) -> Result<Self, EngineError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        let contents = file.read_string().await?;
        serde_json::from_str(&contents)
            .map_err(|e| EngineError::ConfigError(format!("{}: {}", file.path().display(), e)))
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8420
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root of the database, working trees and logs
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/dockyard")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
        }
    }
}

/// Build pipeline and service supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// First port of the deterministic allocation range
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Hard ceiling for one build, in seconds
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,

    /// How long a freshly started process must survive, in seconds
    #[serde(default = "default_start_grace_secs")]
    pub start_grace_secs: u64,

    /// Where unit files are written
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,

    /// Unit name prefix: `<prefix>-<project id>.service`
    #[serde(default = "default_unit_prefix")]
    pub unit_prefix: String,

    /// Shell used for install and build commands
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_base_port() -> u16 {
    10000
}

fn default_build_timeout_secs() -> u64 {
    30 * 60
}

fn default_start_grace_secs() -> u64 {
    3
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

fn default_unit_prefix() -> String {
    "dockyard".to_string()
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            build_timeout_secs: default_build_timeout_secs(),
            start_grace_secs: default_start_grace_secs(),
            unit_dir: default_unit_dir(),
            unit_prefix: default_unit_prefix(),
            shell: default_shell(),
        }
    }
}

/// Reverse proxy collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Base URL of the hosts API; routes are not registered when absent
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token for the hosts API
    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default = "default_true")]
    pub tls: bool,

    #[serde(default = "default_true")]
    pub http_redirect: bool,

    #[serde(default = "default_true")]
    pub websocket: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            tls: true,
            http_redirect: true,
            websocket: true,
        }
    }
}
