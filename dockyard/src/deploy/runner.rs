//! Shell command execution with streamed output

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::deploy::log_sink::LogSink;
use crate::errors::EngineError;
use crate::models::EnvVar;

/// Variables every build and service sees before the project's own
pub const PRODUCTION_ENV: [(&str, &str); 2] = [("NODE_ENV", "production"), ("APP_ENV", "production")];

/// How long to wait for output pumps after the child exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs install and build commands through a shell
#[derive(Debug, Clone)]
pub struct BuildRunner {
    shell: String,
}

impl BuildRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Run `command` in `dir` with the production marker and `env` layered
    /// over the engine's environment. Fails on non-zero exit or cancellation.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        command: &str,
        env: &[EnvVar],
        sink: &Arc<LogSink>,
    ) -> Result<(), EngineError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command).current_dir(dir);
        for (key, value) in PRODUCTION_ENV {
            cmd.env(key, value);
        }
        for var in env {
            cmd.env(&var.key, &var.value);
        }

        sink.line(format!("$ {}", command));
        let status = stream_command(cmd, sink, cancel).await?;
        if !status.success() {
            return Err(EngineError::BuildError(format!(
                "`{}` {}",
                command,
                describe_exit(status)
            )));
        }
        Ok(())
    }
}

impl Default for BuildRunner {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

/// Spawn `cmd`, copy its stdout and stderr line by line into `sink`, and
/// wait for it. Cancelling `cancel` kills the child's process group.
pub async fn stream_command(
    mut cmd: Command,
    sink: &Arc<LogSink>,
    cancel: &CancellationToken,
) -> Result<ExitStatus, EngineError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled("build cancelled".to_string()));
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| EngineError::BuildError(format!("failed to spawn process: {}", e)))?;
    debug!("Spawned process {:?}", child.id());

    let pumps = [
        child.stdout.take().map(|out| pump(out, sink.clone())),
        child.stderr.take().map(|err| pump(err, sink.clone())),
    ];

    let status = tokio::select! {
        () = cancel.cancelled() => {
            terminate(&mut child).await;
            for handle in pumps.into_iter().flatten() {
                handle.abort();
            }
            return Err(EngineError::Cancelled("build cancelled or timed out".to_string()));
        }
        status = child.wait() => status?,
    };

    // A backgrounded grandchild can hold the pipes open indefinitely.
    for handle in pumps.into_iter().flatten() {
        let abort = handle.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
            warn!("Output of finished process still open, detaching");
            abort.abort();
        }
    }

    Ok(status)
}

fn pump<R>(reader: R, sink: Arc<LogSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if line.last() != Some(&b'\n') {
                        line.push(b'\n');
                    }
                    sink.write(&line);
                }
                Err(e) => {
                    debug!("Output pump stopped: {}", e);
                    break;
                }
            }
        }
    })
}

/// Kill the child and everything in its process group
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        kill_process_group(pid);
    }
    if let Err(e) = child.kill().await {
        debug!("Child already gone: {}", e);
    }
}

/// SIGKILL the process group led by `pid`
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!("Process id {} out of range, not signalling its group", pid);
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!("Killed process group {}", raw),
        Err(nix::errno::Errno::ESRCH) => debug!("Process group {} already exited", raw),
        Err(e) => warn!("Failed to kill process group {}: {}", raw, e),
    }
}

/// "exited with status 2", or the signal that ended it
pub fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with status {}", code),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return format!("killed by signal {}", signal);
                }
            }
            "exited abnormally".to_string()
        }
    }
}
