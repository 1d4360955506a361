//! Dockyard - Entry Point
//!
//! Builds projects from git and keeps them running under systemd.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use dockyard::app::options::{AppOptions, ProxyOptions, ServerOptions};
use dockyard::app::run::run;
use dockyard::deploy::EngineConfig;
use dockyard::filesys::file::File;
use dockyard::logs::{init_logging, LogOptions};
use dockyard::storage::layout::StorageLayout;
use dockyard::storage::settings::Settings;
use dockyard::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to render version: {e}"),
        }
        return;
    }

    // Retrieve the settings file
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(PathBuf::from(path)),
        None => StorageLayout::default().settings_file(),
    };
    let mut settings = match Settings::load_or_default(&settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file: {e}");
            return;
        }
    };
    if let Some(host) = cli_args.get("host") {
        settings.server.host = host.clone();
    }
    if let Some(port) = cli_args.get("port") {
        match port.parse() {
            Ok(port) => settings.server.port = port,
            Err(_) => {
                eprintln!("Invalid --port value: {port}");
                return;
            }
        }
    }

    let layout = StorageLayout::new(settings.storage.base_dir.clone());

    // Initialize logging; the guard flushes the file writer on exit
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: Some(layout.engine_logs_dir().path().to_path_buf()),
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // Run the engine
    let options = AppOptions {
        layout,
        server: ServerOptions {
            host: settings.server.host.clone(),
            port: settings.server.port,
        },
        engine: EngineConfig::from(&settings),
        unit_dir: settings.engine.unit_dir.clone(),
        proxy: ProxyOptions {
            base_url: settings.proxy.base_url.clone(),
            api_token: settings.proxy.api_token.clone(),
        },
        ..Default::default()
    };

    info!("Running dockyard with options: {:?}", options);
    let result = run(version.version, options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run dockyard: {e}");
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, waiting for Ctrl+C only");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
