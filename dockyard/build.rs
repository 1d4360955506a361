//! Build script for dockyard
//! Stamps the binary with the source revision and build time reported by `/version`

use chrono::Utc;
use std::process::Command;

fn main() {
    let revision = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let built_at = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();

    println!("cargo:rustc-env=DOCKYARD_GIT_HASH={}", revision);
    println!("cargo:rustc-env=DOCKYARD_BUILD_TIME={}", built_at);
    println!("cargo:rerun-if-changed=.git/HEAD");
}
