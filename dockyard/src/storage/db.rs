//! SQLite persistence for projects and deployments

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use secrecy::{ExposeSecret, SecretString};

use crate::errors::EngineError;
use crate::models::project::{decode_env, encode_env};
use crate::models::{Deployment, DeploymentStatus, NewProject, Project, ProjectStatus};

/// Async-safe handle to the engine database.
///
/// All access runs on tokio's blocking pool so SQLite I/O never stalls the
/// async workers. The mutex serializes every statement, which also makes
/// `unchecked_transaction` safe.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Database>>,
}

impl DbHandle {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run `f` against the database on a blocking thread
    pub async fn call<F, R>(&self, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&Database) -> Result<R, EngineError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| EngineError::Internal(format!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await?
    }
}

const PROJECT_COLUMNS: &str = "id, name, domain, repo_url, branch, deploy_key, install_command, \
     build_command, start_command, port, env_vars, status, error_message, current_build, \
     auto_deploy, webhook_token, host_id, created_at, updated_at";

const DEPLOYMENT_COLUMNS: &str =
    "id, project_id, build_num, commit_hash, status, log_path, duration_ms, error, created_at, finished_at";

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), EngineError> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                domain TEXT,
                repo_url TEXT NOT NULL,
                branch TEXT NOT NULL DEFAULT 'main',
                deploy_key TEXT,
                install_command TEXT NOT NULL DEFAULT '',
                build_command TEXT NOT NULL DEFAULT '',
                start_command TEXT NOT NULL DEFAULT '',
                port INTEGER NOT NULL DEFAULT 0,
                env_vars TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                current_build INTEGER NOT NULL DEFAULT 0,
                auto_deploy INTEGER NOT NULL DEFAULT 0,
                webhook_token TEXT NOT NULL UNIQUE,
                host_id INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id),
                build_num INTEGER NOT NULL,
                commit_hash TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'building',
                log_path TEXT NOT NULL DEFAULT '',
                duration_ms INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                finished_at TEXT,
                UNIQUE(project_id, build_num)
            );

            CREATE INDEX IF NOT EXISTS idx_deployments_project ON deployments(project_id);
            CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments(status);
            ",
        )?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn insert_project(&self, req: &NewProject, webhook_token: &str) -> Result<i64, EngineError> {
        let env_blob = encode_env(&req.env_vars)?;
        let domain = req.domain.as_deref().filter(|d| !d.trim().is_empty());
        let deploy_key = req.deploy_key.as_deref().filter(|k| !k.trim().is_empty());
        self.conn.execute(
            "INSERT INTO projects (name, domain, repo_url, branch, deploy_key, install_command,
                build_command, start_command, port, env_vars, auto_deploy, webhook_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                req.name,
                domain,
                req.repo_url,
                req.branch,
                deploy_key,
                req.install_command,
                req.build_command,
                req.start_command,
                req.port,
                env_blob,
                req.auto_deploy,
                webhook_token,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>, EngineError> {
        let sql = format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], ProjectRow::from_row)
            .optional()?;
        row.map(ProjectRow::into_project).transpose()
    }

    /// Like `get_project`, but a missing row is an error
    pub fn require_project(&self, id: i64) -> Result<Project, EngineError> {
        self.get_project(id)?
            .ok_or_else(|| EngineError::NotFound(format!("project {}", id)))
    }

    pub fn list_projects(&self) -> Result<Vec<Project>, EngineError> {
        let sql = format!("SELECT {} FROM projects ORDER BY id", PROJECT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], ProjectRow::from_row)?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row?.into_project()?);
        }
        Ok(projects)
    }

    /// Only projects that accept webhook builds match
    pub fn find_project_by_webhook_token(&self, token: &str) -> Result<Option<Project>, EngineError> {
        let sql = format!(
            "SELECT {} FROM projects WHERE webhook_token = ?1 AND auto_deploy = 1",
            PROJECT_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![token], ProjectRow::from_row)
            .optional()?;
        row.map(ProjectRow::into_project).transpose()
    }

    /// Persist the user-editable configuration of `project`
    pub fn save_project_config(&self, project: &Project) -> Result<(), EngineError> {
        let env_blob = encode_env(&project.env_vars)?;
        let deploy_key = project.deploy_key.as_ref().map(|k| k.expose_secret());
        self.conn.execute(
            "UPDATE projects SET name = ?1, domain = ?2, repo_url = ?3, branch = ?4,
                deploy_key = ?5, install_command = ?6, build_command = ?7, start_command = ?8,
                port = ?9, env_vars = ?10, auto_deploy = ?11, updated_at = datetime('now')
             WHERE id = ?12",
            params![
                project.name,
                project.domain,
                project.repo_url,
                project.branch,
                deploy_key,
                project.install_command,
                project.build_command,
                project.start_command,
                project.port,
                env_blob,
                project.auto_deploy,
                project.id,
            ],
        )?;
        Ok(())
    }

    pub fn set_project_port(&self, id: i64, port: u16) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE projects SET port = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![port, id],
        )?;
        Ok(())
    }

    pub fn set_webhook_token(&self, id: i64, token: &str) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE projects SET webhook_token = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![token, id],
        )?;
        Ok(())
    }

    pub fn set_project_status(
        &self,
        id: i64,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE projects SET status = ?1, error_message = ?2, updated_at = datetime('now')
             WHERE id = ?3",
            params![status.as_str(), error_message, id],
        )?;
        Ok(())
    }

    /// Record an auto-created proxy route. Returns false if one was already recorded.
    pub fn set_host_id_once(&self, id: i64, host_id: i64) -> Result<bool, EngineError> {
        let changed = self.conn.execute(
            "UPDATE projects SET host_id = ?1, updated_at = datetime('now')
             WHERE id = ?2 AND host_id = 0",
            params![host_id, id],
        )?;
        Ok(changed == 1)
    }

    /// Remove the project and every deployment it owns
    pub fn delete_project(&self, id: i64) -> Result<(), EngineError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM deployments WHERE project_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(EngineError::NotFound(format!("project {}", id)));
        }
        tx.commit()?;
        Ok(())
    }

    // ── Deployments ───────────────────────────────────────────────────

    /// Allocate the next build number, insert a `building` deployment and
    /// move the project to `building`, all in one transaction.
    ///
    /// The number is one past both `current_build` and every recorded build,
    /// so numbers stay unique after a rollback lowered `current_build`.
    pub fn begin_build<F>(&self, project_id: i64, log_path_for: F) -> Result<Deployment, EngineError>
    where
        F: FnOnce(i64) -> String,
    {
        let tx = self.conn.unchecked_transaction()?;

        let (current_build, max_build): (i64, i64) = tx
            .query_row(
                "SELECT p.current_build,
                        COALESCE((SELECT MAX(build_num) FROM deployments WHERE project_id = p.id), 0)
                 FROM projects p WHERE p.id = ?1",
                params![project_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("project {}", project_id)))?;

        let build_num = current_build.max(max_build) + 1;
        let log_path = log_path_for(build_num);

        tx.execute(
            "INSERT INTO deployments (project_id, build_num, status, log_path)
             VALUES (?1, ?2, 'building', ?3)",
            params![project_id, build_num, log_path],
        )?;
        let deployment_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE projects SET status = 'building', error_message = NULL, current_build = ?1,
                updated_at = datetime('now')
             WHERE id = ?2",
            params![build_num, project_id],
        )?;

        tx.commit()?;
        self.get_deployment(deployment_id)?
            .ok_or_else(|| EngineError::Internal("deployment missing after insert".to_string()))
    }

    pub fn set_deployment_commit(&self, id: i64, commit_hash: &str) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE deployments SET commit_hash = ?1 WHERE id = ?2",
            params![commit_hash, id],
        )?;
        Ok(())
    }

    /// Settle a `building` deployment. Returns false if it had already settled.
    pub fn finish_deployment(
        &self,
        id: i64,
        status: DeploymentStatus,
        duration_ms: i64,
        error: Option<&str>,
    ) -> Result<bool, EngineError> {
        let changed = self.conn.execute(
            "UPDATE deployments SET status = ?1, duration_ms = ?2, error = ?3,
                finished_at = datetime('now')
             WHERE id = ?4 AND status = 'building'",
            params![status.as_str(), duration_ms, error, id],
        )?;
        Ok(changed == 1)
    }

    pub fn get_deployment(&self, id: i64) -> Result<Option<Deployment>, EngineError> {
        let sql = format!("SELECT {} FROM deployments WHERE id = ?1", DEPLOYMENT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], DeploymentRow::from_row)
            .optional()?;
        row.map(DeploymentRow::into_deployment).transpose()
    }

    pub fn find_deployment(
        &self,
        project_id: i64,
        build_num: i64,
    ) -> Result<Option<Deployment>, EngineError> {
        let sql = format!(
            "SELECT {} FROM deployments WHERE project_id = ?1 AND build_num = ?2",
            DEPLOYMENT_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![project_id, build_num], DeploymentRow::from_row)
            .optional()?;
        row.map(DeploymentRow::into_deployment).transpose()
    }

    /// Deployments of a project, newest first
    pub fn list_deployments(&self, project_id: i64) -> Result<Vec<Deployment>, EngineError> {
        let sql = format!(
            "SELECT {} FROM deployments WHERE project_id = ?1 ORDER BY build_num DESC",
            DEPLOYMENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id], DeploymentRow::from_row)?;
        let mut deployments = Vec::new();
        for row in rows {
            deployments.push(row?.into_deployment()?);
        }
        Ok(deployments)
    }

    /// Mark every build after `target` as rolled back and make `target` current.
    /// Returns the number of deployments that changed.
    pub fn rollback_to(&self, project_id: i64, target: i64) -> Result<usize, EngineError> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE deployments SET status = 'rolled_back'
             WHERE project_id = ?1 AND build_num > ?2 AND status != 'rolled_back'",
            params![project_id, target],
        )?;
        tx.execute(
            "UPDATE projects SET current_build = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![target, project_id],
        )?;
        tx.commit()?;
        Ok(changed)
    }

    /// Fail every deployment left `building` by a previous engine process
    pub fn fail_unfinished_deployments(&self, message: &str) -> Result<usize, EngineError> {
        let changed = self.conn.execute(
            "UPDATE deployments SET status = 'failed', error = ?1, finished_at = datetime('now')
             WHERE status = 'building'",
            params![message],
        )?;
        Ok(changed)
    }
}

/// Raw projects row
struct ProjectRow {
    id: i64,
    name: String,
    domain: Option<String>,
    repo_url: String,
    branch: String,
    deploy_key: Option<String>,
    install_command: String,
    build_command: String,
    start_command: String,
    port: i64,
    env_vars: String,
    status: String,
    error_message: Option<String>,
    current_build: i64,
    auto_deploy: bool,
    webhook_token: String,
    host_id: i64,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            domain: row.get(2)?,
            repo_url: row.get(3)?,
            branch: row.get(4)?,
            deploy_key: row.get(5)?,
            install_command: row.get(6)?,
            build_command: row.get(7)?,
            start_command: row.get(8)?,
            port: row.get(9)?,
            env_vars: row.get(10)?,
            status: row.get(11)?,
            error_message: row.get(12)?,
            current_build: row.get(13)?,
            auto_deploy: row.get(14)?,
            webhook_token: row.get(15)?,
            host_id: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    fn into_project(self) -> Result<Project, EngineError> {
        let status = ProjectStatus::from_str(&self.status).map_err(EngineError::Internal)?;
        let port = u16::try_from(self.port)
            .map_err(|_| EngineError::Internal(format!("stored port out of range: {}", self.port)))?;
        Ok(Project {
            id: self.id,
            name: self.name,
            domain: self.domain,
            repo_url: self.repo_url,
            branch: self.branch,
            deploy_key: self.deploy_key.map(SecretString::from),
            install_command: self.install_command,
            build_command: self.build_command,
            start_command: self.start_command,
            port,
            env_vars: decode_env(&self.env_vars)?,
            status,
            error_message: self.error_message,
            current_build: self.current_build,
            auto_deploy: self.auto_deploy,
            webhook_token: self.webhook_token,
            host_id: self.host_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Raw deployments row
struct DeploymentRow {
    id: i64,
    project_id: i64,
    build_num: i64,
    commit_hash: String,
    status: String,
    log_path: String,
    duration_ms: i64,
    error: Option<String>,
    created_at: String,
    finished_at: Option<String>,
}

impl DeploymentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            build_num: row.get(2)?,
            commit_hash: row.get(3)?,
            status: row.get(4)?,
            log_path: row.get(5)?,
            duration_ms: row.get(6)?,
            error: row.get(7)?,
            created_at: row.get(8)?,
            finished_at: row.get(9)?,
        })
    }

    fn into_deployment(self) -> Result<Deployment, EngineError> {
        let status = DeploymentStatus::from_str(&self.status).map_err(EngineError::Internal)?;
        Ok(Deployment {
            id: self.id,
            project_id: self.project_id,
            build_num: self.build_num,
            commit_hash: self.commit_hash,
            status,
            log_path: self.log_path,
            duration_ms: self.duration_ms,
            error: self.error,
            created_at: self.created_at,
            finished_at: self.finished_at,
        })
    }
}
