//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of everything the engine owns, rooted at one base directory
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Get the SQLite database path
    pub fn database_file(&self) -> File {
        File::new(self.base_dir.join("dockyard.db"))
    }

    /// Root of all project working trees
    pub fn sources_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("sources"))
    }

    /// Working tree of one project
    pub fn project_source_dir(&self, project_id: i64) -> Dir {
        self.sources_dir().subdir(&project_id.to_string())
    }

    /// Root of all build and runtime logs
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Log directory of one project
    pub fn project_logs_dir(&self, project_id: i64) -> Dir {
        self.logs_dir().subdir(&project_id.to_string())
    }

    /// Log file of a single build attempt
    pub fn build_log_file(&self, project_id: i64, build_num: i64) -> File {
        self.project_logs_dir(project_id)
            .file(&format!("build-{}.log", build_num))
    }

    /// stdout/stderr of the supervised process, appended by the service manager
    pub fn runtime_log_file(&self, project_id: i64) -> File {
        self.project_logs_dir(project_id).file("runtime.log")
    }

    /// Scratch directory for deploy keys while git runs
    pub fn keys_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("keys"))
    }

    /// Directory for the engine's own rotated log
    pub fn engine_logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("engine-logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), crate::errors::EngineError> {
        self.sources_dir().create().await?;
        self.logs_dir().create().await?;
        self.keys_dir().create().await?;
        self.engine_logs_dir().create().await?;
        keys_dir_private(&self.keys_dir()).await
    }
}

#[cfg(unix)]
async fn keys_dir_private(dir: &Dir) -> Result<(), crate::errors::EngineError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn keys_dir_private(_dir: &Dir) -> Result<(), crate::errors::EngineError> {
    Ok(())
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/var/lib/dockyard")
    }
}
