//! Source fetching: shallow clone or fast-forward pull, optionally over a deploy key

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deploy::log_sink::LogSink;
use crate::deploy::runner::{describe_exit, stream_command};
use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::utils::redact_url;

/// A deploy key written to disk for the duration of one git invocation.
/// The file is removed when the guard drops, whatever the outcome.
struct DeployKeyFile {
    path: PathBuf,
}

impl DeployKeyFile {
    async fn write(dir: &Path, project_id: i64, key: &str) -> Result<Self, EngineError> {
        let path = dir.join(format!(
            "deploy-{}-{}.key",
            project_id,
            uuid::Uuid::new_v4().simple()
        ));
        let mut contents = key.trim_end().to_string();
        contents.push('\n');
        File::new(&path).write_private(&contents).await?;
        Ok(Self { path })
    }

    fn ssh_command(&self) -> String {
        format!(
            "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
            self.path.display()
        )
    }
}

impl Drop for DeployKeyFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove deploy key {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Fetches project sources into `<sources>/<project id>`
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    sources: Dir,
    key_dir: PathBuf,
}

impl SourceFetcher {
    /// `sources` holds working trees; deploy keys are written under `key_dir`
    pub fn new(sources: Dir, key_dir: impl Into<PathBuf>) -> Self {
        Self {
            sources,
            key_dir: key_dir.into(),
        }
    }

    pub fn project_dir(&self, project_id: i64) -> Dir {
        self.sources.subdir(&project_id.to_string())
    }

    /// Clone when no working tree exists yet or it tracks another remote or
    /// branch, pull otherwise
    pub async fn fetch(
        &self,
        cancel: &CancellationToken,
        url: &str,
        branch: &str,
        deploy_key: Option<&str>,
        project_id: i64,
        sink: &Arc<LogSink>,
    ) -> Result<(), EngineError> {
        let git_dir = self.project_dir(project_id).subdir(".git");
        if git_dir.exists().await {
            if self.tracks(project_id, url, branch).await {
                return self.pull(cancel, deploy_key, project_id, sink).await;
            }
            info!("Project {} now tracks {} ({}), re-cloning", project_id, redact_url(url), branch);
            sink.line("Repository or branch changed, re-cloning");
        }
        self.clone_repo(cancel, url, branch, deploy_key, project_id, sink)
            .await
    }

    /// Whether the working tree's origin and checked-out branch are `url` and `branch`
    async fn tracks(&self, project_id: i64, url: &str, branch: &str) -> bool {
        let dir = self.project_dir(project_id);
        let origin = git_output(dir.path(), &["config", "--get", "remote.origin.url"]).await;
        let head = git_output(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"]).await;
        origin == url && head == branch
    }

    /// Replace the working tree with a depth-1 clone of `branch`
    pub async fn clone_repo(
        &self,
        cancel: &CancellationToken,
        url: &str,
        branch: &str,
        deploy_key: Option<&str>,
        project_id: i64,
        sink: &Arc<LogSink>,
    ) -> Result<(), EngineError> {
        let dir = self.project_dir(project_id);
        dir.delete().await?;
        self.sources.create().await?;

        let redacted = redact_url(url);
        info!("Cloning {} (branch: {}) for project {}", redacted, branch, project_id);
        sink.line(format!("Cloning {} (branch {})", redacted, branch));

        let key = self.write_key(deploy_key, project_id).await?;
        let mut cmd = git_command(key.as_ref());
        cmd.args(["clone", "--depth", "1", "--branch", branch, "--", url])
            .arg(dir.path());

        let status = stream_command(cmd, sink, cancel).await?;
        drop(key);
        if !status.success() {
            return Err(EngineError::FetchError(format!(
                "git clone {}",
                describe_exit(status)
            )));
        }
        Ok(())
    }

    /// Fast-forward the existing working tree
    pub async fn pull(
        &self,
        cancel: &CancellationToken,
        deploy_key: Option<&str>,
        project_id: i64,
        sink: &Arc<LogSink>,
    ) -> Result<(), EngineError> {
        let dir = self.project_dir(project_id);
        info!("Pulling updates for project {}", project_id);
        sink.line("Pulling latest changes");

        let key = self.write_key(deploy_key, project_id).await?;
        let mut cmd = git_command(key.as_ref());
        cmd.current_dir(dir.path()).args(["pull", "--ff-only"]);

        let status = stream_command(cmd, sink, cancel).await?;
        drop(key);
        if !status.success() {
            return Err(EngineError::FetchError(format!(
                "git pull {}",
                describe_exit(status)
            )));
        }
        Ok(())
    }

    /// Short hash of HEAD, or an empty string if it cannot be read
    pub async fn commit_hash(&self, project_id: i64) -> String {
        let dir = self.project_dir(project_id);
        git_output(dir.path(), &["rev-parse", "--short", "HEAD"]).await
    }

    async fn write_key(
        &self,
        deploy_key: Option<&str>,
        project_id: i64,
    ) -> Result<Option<DeployKeyFile>, EngineError> {
        match deploy_key.filter(|k| !k.trim().is_empty()) {
            Some(key) => {
                Dir::new(&self.key_dir).create().await?;
                Ok(Some(DeployKeyFile::write(&self.key_dir, project_id, key).await?))
            }
            None => Ok(None),
        }
    }
}

/// Trimmed stdout of a read-only git command in `dir`, empty on any failure
async fn git_output(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_string(),
        Ok(out) => {
            debug!("git {:?} failed: {}", args, String::from_utf8_lossy(&out.stderr).trim());
            String::new()
        }
        Err(e) => {
            debug!("git {:?} could not run: {}", args, e);
            String::new()
        }
    }
}

fn git_command(key: Option<&DeployKeyFile>) -> Command {
    let mut cmd = Command::new("git");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    if let Some(key) = key {
        cmd.env("GIT_SSH_COMMAND", key.ssh_command());
    }
    cmd
}
