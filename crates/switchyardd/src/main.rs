//! switchyardd — the Switchyard daemon.
//!
//! Single binary that assembles every subsystem:
//! - Instance registry + load balancer
//! - Session store (optionally persisted to redb)
//! - Autoscaler and worker provisioner
//! - Usage monitor
//! - `/mcp-router` connection router
//! - `/registry-dashboard` operator dashboard
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! switchyardd serve --config switchyard.toml --port 3000 --dashboard-port 3001
//! switchyardd print-config --config switchyard.toml
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use switchyard_core::SwitchyardConfig;
use switchyardd::ControlPlane;

#[derive(Parser)]
#[command(name = "switchyardd", about = "Switchyard connection routing daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct ConfigArgs {
    /// Path to switchyard.toml. Defaults apply when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to bind, overriding `[http] host`.
    #[arg(long)]
    host: Option<String>,

    /// HTTP port, overriding `[http] port`.
    #[arg(long)]
    port: Option<u16>,

    /// Dashboard port, overriding `[dashboard] port`. Use the HTTP port
    /// to serve the dashboard on the same listener.
    #[arg(long)]
    dashboard_port: Option<u16>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Serve {
        #[command(flatten)]
        config: ConfigArgs,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Print the effective configuration as TOML and exit.
    PrintConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

impl ConfigArgs {
    fn load(&self) -> anyhow::Result<SwitchyardConfig> {
        let mut config = match &self.config {
            Some(path) => SwitchyardConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => SwitchyardConfig::default(),
        };
        if let Some(host) = &self.host {
            config.http.host = host.clone();
        }
        if let Some(port) = self.port {
            config.http.port = port;
        }
        if let Some(port) = self.dashboard_port {
            config.dashboard.port = port;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,switchyard=debug,switchyardd=debug"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_json } => {
            init_tracing(log_json);
            run(config.load()?).await
        }
        Command::PrintConfig { config } => {
            print!("{}", config.load()?.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: SwitchyardConfig) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "switchyard starting");
    if config.auth.tokens.is_empty() {
        warn!("no auth tokens configured, every client connection will be rejected");
    }

    let plane = ControlPlane::build(config)?;
    let (http, dashboard) = plane.bind().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    plane.serve(http, dashboard, shutdown_rx).await
}
