//! Service unit rendering

use std::path::{Path, PathBuf};

use crate::deploy::runner::PRODUCTION_ENV;
use crate::models::Project;

/// Seconds systemd waits before restarting a failed process
pub const RESTART_SEC: u32 = 5;

/// Everything needed to describe one supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub description: String,
    pub work_dir: PathBuf,
    pub shell: String,
    pub start_command: String,
    pub env: Vec<(String, String)>,
    pub port: Option<u16>,
    pub log_path: PathBuf,
}

impl UnitSpec {
    /// Unit description for `project`, running from `work_dir`
    pub fn for_project(project: &Project, work_dir: &Path, shell: &str, log_path: &Path) -> Self {
        let mut env: Vec<(String, String)> = PRODUCTION_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.extend(
            project
                .env_vars
                .iter()
                .map(|var| (var.key.clone(), var.value.clone())),
        );

        Self {
            description: format!("dockyard project {} ({})", project.id, project.name),
            work_dir: work_dir.to_path_buf(),
            shell: shell.to_string(),
            start_command: resolve_start_command(&project.start_command, work_dir),
            env,
            port: Some(project.port).filter(|p| *p > 0),
            log_path: log_path.to_path_buf(),
        }
    }
}

/// Rewrite a leading `./x` to an absolute path under `work_dir`
pub fn resolve_start_command(command: &str, work_dir: &Path) -> String {
    let command = command.trim();
    let (program, rest) = match command.split_once(char::is_whitespace) {
        Some((program, rest)) => (program, Some(rest)),
        None => (command, None),
    };

    let Some(relative) = program.strip_prefix("./") else {
        return command.to_string();
    };

    let absolute = work_dir.join(relative).display().to_string();
    match rest {
        Some(rest) => format!("{} {}", absolute, rest),
        None => absolute,
    }
}

/// Render a systemd unit. Pure: no I/O, no service manager.
pub fn render_unit(spec: &UnitSpec) -> String {
    let mut out = String::new();
    out.push_str("[Unit]\n");
    out.push_str(&format!("Description={}\n", single_line(&spec.description)));
    out.push_str("After=network.target\n\n");

    out.push_str("[Service]\n");
    out.push_str("Type=simple\n");
    out.push_str(&format!("WorkingDirectory={}\n", spec.work_dir.display()));
    out.push_str(&format!(
        "ExecStart={} -c {}\n",
        spec.shell,
        quote_exec(&spec.start_command)
    ));
    out.push_str("Restart=on-failure\n");
    out.push_str(&format!("RestartSec={}\n", RESTART_SEC));
    for (key, value) in &spec.env {
        out.push_str(&format!("Environment={}\n", quote_env(&format!("{}={}", key, value))));
    }
    if let Some(port) = spec.port {
        out.push_str(&format!("Environment=\"PORT={}\"\n", port));
    }
    out.push_str(&format!("StandardOutput=append:{}\n", spec.log_path.display()));
    out.push_str(&format!("StandardError=append:{}\n\n", spec.log_path.display()));

    out.push_str("[Install]\n");
    out.push_str("WantedBy=multi-user.target\n");
    out
}

/// Quote a command line for `ExecStart=`, where systemd expands `$VAR`
fn quote_exec(value: &str) -> String {
    quote(value, true)
}

/// Quote an assignment for `Environment=`, which takes `$` literally
fn quote_env(value: &str) -> String {
    quote(value, false)
}

fn quote(value: &str, escape_dollar: bool) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '%' => out.push_str("%%"),
            '$' if escape_dollar => out.push_str("$$"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Unquoted values must stay on their own line
fn single_line(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .replace('%', "%%")
}
