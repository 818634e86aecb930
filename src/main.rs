#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # mignon-relay
//!
//! Long-running supervisor for a user-declared set of SSH port-forwarding
//! tunnels. The declarative config (server groups and their forward/reverse
//! links) lives in an encrypted file; the supervisor reconciles the running
//! tunnel set against it, rides out transient network failures with bounded
//! reconnection, and logs lifecycle events.
//!
//! ## Subcommands
//!
//! - `mignon-relay serve` (default) — run the supervisor until interrupted
//! - `mignon-relay show-config` — decrypt and print the tunnel config

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mignon_relay::{ConfigStore, Settings, TunnelSupervisor};

/// Supervisor for declaratively configured SSH tunnels.
#[derive(Parser)]
#[command(name = "mignon-relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel supervisor until interrupted (default).
    Serve {
        /// Path to TOML settings file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Decrypt and print the persisted tunnel configuration as JSON.
    ShowConfig {
        /// Path to TOML settings file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::ShowConfig { config }) => show_config(config.as_deref()),
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

fn load_settings(path: Option<&str>) -> Settings {
    match Settings::load(path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Settings error: {e}");
            std::process::exit(1);
        }
    }
}

fn show_config(config_path: Option<&str>) {
    let settings = load_settings(config_path);
    let store = ConfigStore::open(&settings.storage.config_path);
    match serde_json::to_string_pretty(store.config()) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Failed to render config: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_server(config_path: Option<&str>) {
    let settings = load_settings(config_path);

    // The guard flushes buffered log lines; keep it until exit.
    let _log_guard = match mignon_relay::logging::init(&settings.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            std::process::exit(1);
        }
    };

    info!("mignon-relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", settings.storage.config_path);

    let store = ConfigStore::open(&settings.storage.config_path);

    let (event_tx, mut event_rx) = TunnelSupervisor::event_channel();
    let supervisor = TunnelSupervisor::new(event_tx);
    supervisor.sync(store.config()).await;
    info!("Supervising {} tunnel(s)", supervisor.running_ids().await.len());

    // Surface lifecycle events; a headless host logs them.
    let event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if event.is_stopped {
                info!("Tunnel {} ({}) stopped", event.tunnel_id, event.link_name);
            } else {
                warn!(
                    "Tunnel {} ({}) on {} failed: {}",
                    event.tunnel_id, event.link_name, event.server_name, event.error_text
                );
            }
        }
    });

    // Graceful shutdown
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }

    info!("Shutting down...");
    supervisor.stop_all().await;
    event_task.abort();
    info!("Goodbye");
}
