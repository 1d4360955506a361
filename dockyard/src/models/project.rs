//! Project models

use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Lifecycle status of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Created, never built
    Pending,
    /// A build is in flight
    Building,
    /// Process is up, or the static build succeeded
    Running,
    /// Process was stopped, or found not running on read
    Stopped,
    /// The last build or start failed
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "building" => Ok(Self::Building),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

/// One environment variable injected at build and run time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Encode environment variables into the blob stored with the project
pub fn encode_env(vars: &[EnvVar]) -> Result<String, EngineError> {
    Ok(serde_json::to_string(vars)?)
}

/// Decode the stored environment blob. An empty blob decodes to no variables.
pub fn decode_env(blob: &str) -> Result<Vec<EnvVar>, EngineError> {
    if blob.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(blob)?)
}

/// Reject keys that cannot be passed through a shell environment or a unit file
pub fn validate_env(vars: &[EnvVar]) -> Result<(), EngineError> {
    for var in vars {
        let valid = !var.key.is_empty()
            && !var.key.starts_with(|c: char| c.is_ascii_digit())
            && var.key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(EngineError::ValidationError(format!(
                "invalid environment variable name: {:?}",
                var.key
            )));
        }
        if var.value.contains('\n') {
            return Err(EngineError::ValidationError(format!(
                "environment variable {} contains a newline",
                var.key
            )));
        }
    }
    Ok(())
}

/// Reject fields that end up on a single line of a unit file
fn validate_single_line(field: &str, value: &str) -> Result<(), EngineError> {
    if value.contains(|c: char| c == '\n' || c == '\r') {
        return Err(EngineError::ValidationError(format!(
            "{} must be a single line",
            field
        )));
    }
    Ok(())
}

/// A deployable unit: repository, commands, runtime configuration and status.
///
/// Secrets (deploy key, environment values) live here but are never part of
/// any API response; see `server::handlers::ProjectResponse`.
#[derive(Debug)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub domain: Option<String>,
    pub repo_url: String,
    pub branch: String,
    pub deploy_key: Option<SecretString>,
    pub install_command: String,
    pub build_command: String,
    pub start_command: String,
    pub port: u16,
    pub env_vars: Vec<EnvVar>,
    pub status: ProjectStatus,
    pub error_message: Option<String>,
    pub current_build: i64,
    pub auto_deploy: bool,
    pub webhook_token: String,
    pub host_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Project {
    /// Projects without a start command are built but never supervised
    pub fn is_static(&self) -> bool {
        self.start_command.trim().is_empty()
    }

    pub fn deploy_key(&self) -> Option<&str> {
        self.deploy_key
            .as_ref()
            .map(|key| key.expose_secret())
            .filter(|key| !key.trim().is_empty())
    }
}

impl Clone for Project {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            domain: self.domain.clone(),
            repo_url: self.repo_url.clone(),
            branch: self.branch.clone(),
            deploy_key: self
                .deploy_key
                .as_ref()
                .map(|key| SecretString::from(key.expose_secret().to_owned())),
            install_command: self.install_command.clone(),
            build_command: self.build_command.clone(),
            start_command: self.start_command.clone(),
            port: self.port,
            env_vars: self.env_vars.clone(),
            status: self.status,
            error_message: self.error_message.clone(),
            current_build: self.current_build,
            auto_deploy: self.auto_deploy,
            webhook_token: self.webhook_token.clone(),
            host_id: self.host_id,
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

fn default_branch() -> String {
    "main".to_string()
}

/// Input to `Orchestrator::create_project`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub deploy_key: Option<String>,
    #[serde(default)]
    pub install_command: String,
    #[serde(default)]
    pub build_command: String,
    #[serde(default)]
    pub start_command: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
    #[serde(default)]
    pub auto_deploy: bool,
}

impl NewProject {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::ValidationError("name is required".to_string()));
        }
        validate_single_line("name", &self.name)?;
        validate_single_line("start_command", &self.start_command)?;
        if self.repo_url.trim().is_empty() {
            return Err(EngineError::ValidationError(
                "repo_url is required".to_string(),
            ));
        }
        if self.branch.trim().is_empty() || self.branch.starts_with('-') {
            return Err(EngineError::ValidationError(format!(
                "invalid branch: {:?}",
                self.branch
            )));
        }
        validate_env(&self.env_vars)
    }
}

/// Partial update applied by `Orchestrator::update_project`.
///
/// `deploy_key: Some("")` and `domain: Some("")` clear the value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub domain: Option<String>,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub deploy_key: Option<String>,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub port: Option<u16>,
    pub env_vars: Option<Vec<EnvVar>>,
    pub auto_deploy: Option<bool>,
}

impl ProjectUpdate {
    /// Apply the patch to `project` in memory
    pub fn apply(self, project: &mut Project) -> Result<(), EngineError> {
        if let Some(name) = self.name {
            if name.trim().is_empty() {
                return Err(EngineError::ValidationError("name is required".to_string()));
            }
            validate_single_line("name", &name)?;
            project.name = name;
        }
        if let Some(domain) = self.domain {
            project.domain = Some(domain).filter(|d| !d.trim().is_empty());
        }
        if let Some(repo_url) = self.repo_url {
            if repo_url.trim().is_empty() {
                return Err(EngineError::ValidationError(
                    "repo_url is required".to_string(),
                ));
            }
            project.repo_url = repo_url;
        }
        if let Some(branch) = self.branch {
            if branch.trim().is_empty() || branch.starts_with('-') {
                return Err(EngineError::ValidationError(format!(
                    "invalid branch: {:?}",
                    branch
                )));
            }
            project.branch = branch;
        }
        if let Some(key) = self.deploy_key {
            project.deploy_key = Some(key)
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from);
        }
        if let Some(cmd) = self.install_command {
            project.install_command = cmd;
        }
        if let Some(cmd) = self.build_command {
            project.build_command = cmd;
        }
        if let Some(cmd) = self.start_command {
            validate_single_line("start_command", &cmd)?;
            project.start_command = cmd;
        }
        if let Some(port) = self.port {
            project.port = port;
        }
        if let Some(vars) = self.env_vars {
            validate_env(&vars)?;
            project.env_vars = vars;
        }
        if let Some(auto_deploy) = self.auto_deploy {
            project.auto_deploy = auto_deploy;
        }
        Ok(())
    }
}
