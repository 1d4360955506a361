//! Service supervision through the host's service manager

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::deploy::unit::{render_unit, UnitSpec};
use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::models::Project;
use crate::storage::layout::StorageLayout;

/// Capability the supervisor needs from an init system
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Write (or overwrite) the unit definition
    async fn write_unit(&self, unit: &str, contents: &str) -> Result<(), EngineError>;

    /// Delete the unit definition if present
    async fn remove_unit(&self, unit: &str) -> Result<(), EngineError>;

    /// Reload the manager's unit cache
    async fn reload(&self) -> Result<(), EngineError>;

    async fn enable(&self, unit: &str) -> Result<(), EngineError>;

    async fn disable(&self, unit: &str) -> Result<(), EngineError>;

    async fn start(&self, unit: &str) -> Result<(), EngineError>;

    async fn stop(&self, unit: &str) -> Result<(), EngineError>;

    async fn restart(&self, unit: &str) -> Result<(), EngineError>;

    /// Whether the unit is currently active
    async fn is_active(&self, unit: &str) -> bool;
}

/// `ServiceManager` backed by systemd and `systemctl`
#[derive(Debug, Clone)]
pub struct SystemdManager {
    unit_dir: PathBuf,
}

impl SystemdManager {
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
        }
    }

    fn unit_file(&self, unit: &str) -> File {
        File::new(self.unit_dir.join(unit))
    }

    async fn systemctl(&self, args: &[&str]) -> Result<(), EngineError> {
        debug!("systemctl {}", args.join(" "));
        let output = Command::new("systemctl")
            .args(args)
            .output()
            .await
            .map_err(|e| EngineError::ServiceError(format!("failed to run systemctl: {}", e)))?;
        if !output.status.success() {
            return Err(EngineError::ServiceError(format!(
                "systemctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for SystemdManager {
    async fn write_unit(&self, unit: &str, contents: &str) -> Result<(), EngineError> {
        self.unit_file(unit).write_string(contents).await
    }

    async fn remove_unit(&self, unit: &str) -> Result<(), EngineError> {
        self.unit_file(unit).delete().await
    }

    async fn reload(&self) -> Result<(), EngineError> {
        self.systemctl(&["daemon-reload"]).await
    }

    async fn enable(&self, unit: &str) -> Result<(), EngineError> {
        self.systemctl(&["enable", unit]).await
    }

    async fn disable(&self, unit: &str) -> Result<(), EngineError> {
        self.systemctl(&["disable", unit]).await
    }

    async fn start(&self, unit: &str) -> Result<(), EngineError> {
        self.systemctl(&["start", unit]).await
    }

    async fn stop(&self, unit: &str) -> Result<(), EngineError> {
        self.systemctl(&["stop", unit]).await
    }

    async fn restart(&self, unit: &str) -> Result<(), EngineError> {
        self.systemctl(&["restart", unit]).await
    }

    async fn is_active(&self, unit: &str) -> bool {
        Command::new("systemctl")
            .args(["is-active", "--quiet", unit])
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Installs and controls one supervised unit per project
#[derive(Clone)]
pub struct ServiceSupervisor {
    manager: Arc<dyn ServiceManager>,
    layout: StorageLayout,
    shell: String,
    unit_prefix: String,
}

impl ServiceSupervisor {
    pub fn new(
        manager: Arc<dyn ServiceManager>,
        layout: StorageLayout,
        shell: impl Into<String>,
        unit_prefix: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            layout,
            shell: shell.into(),
            unit_prefix: unit_prefix.into(),
        }
    }

    /// `<prefix>-<id>.service`
    pub fn unit_name(&self, project_id: i64) -> String {
        format!("{}-{}.service", self.unit_prefix, project_id)
    }

    /// Render and write the unit, reload the manager and enable it at boot
    pub async fn install(&self, project: &Project, work_dir: &Path) -> Result<(), EngineError> {
        let unit = self.unit_name(project.id);
        self.layout.project_logs_dir(project.id).create().await?;
        let log_file = self.layout.runtime_log_file(project.id);

        let spec = UnitSpec::for_project(project, work_dir, &self.shell, log_file.path());
        self.manager.write_unit(&unit, &render_unit(&spec)).await?;
        self.manager.reload().await?;
        self.manager.enable(&unit).await?;
        info!("Installed unit {}", unit);
        Ok(())
    }

    pub async fn start(&self, project_id: i64) -> Result<(), EngineError> {
        self.manager.start(&self.unit_name(project_id)).await
    }

    pub async fn stop(&self, project_id: i64) -> Result<(), EngineError> {
        self.manager.stop(&self.unit_name(project_id)).await
    }

    pub async fn restart(&self, project_id: i64) -> Result<(), EngineError> {
        self.manager.restart(&self.unit_name(project_id)).await
    }

    /// Stop, disable, delete and reload; every step is attempted
    pub async fn uninstall(&self, project_id: i64) {
        let unit = self.unit_name(project_id);
        if let Err(e) = self.manager.stop(&unit).await {
            debug!("Stopping {} during uninstall: {}", unit, e);
        }
        if let Err(e) = self.manager.disable(&unit).await {
            debug!("Disabling {} during uninstall: {}", unit, e);
        }
        if let Err(e) = self.manager.remove_unit(&unit).await {
            warn!("Failed to remove unit {}: {}", unit, e);
        }
        if let Err(e) = self.manager.reload().await {
            warn!("Failed to reload service manager: {}", e);
        }
    }

    pub async fn is_running(&self, project_id: i64) -> bool {
        self.manager.is_active(&self.unit_name(project_id)).await
    }

    /// Last `lines` lines of the process output; empty before the first start
    pub async fn read_runtime_log(&self, project_id: i64, lines: usize) -> Result<String, EngineError> {
        self.layout.runtime_log_file(project_id).tail(lines).await
    }
}
