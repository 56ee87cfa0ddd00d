//! CLI entry point for the NVMe-oF fleet manager daemon.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use dem_discover::backend::RecordingBackend;
use dem_discover::config::FleetConfig;
use dem_discover::transport::Transports;
use dem_discover::daemon::watch_signals;
use dem_discover::Daemon;

#[derive(Parser)]
#[command(name = "demd")]
#[command(about = "Manage a fleet of NVMe-oF targets and their discovery log pages")]
struct Cli {
    /// Validate the configuration and print the build report.
    #[arg(long)]
    check: bool,

    /// Prime the fleet once, print every target's log page, and exit.
    #[arg(long)]
    once: bool,

    /// Run as daemon until SIGINT/SIGTERM.
    #[arg(long)]
    daemon: bool,

    /// Config file prefix (default: dem).
    #[arg(short, long, default_value = "dem")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    let config = FleetConfig::load(&cli.config)?;

    // Transports and the endpoint backend are provided by the wire-level
    // integration; the stock binary records backend calls only.
    let transports = Transports::new();
    if transports.is_empty() {
        tracing::warn!("No transports registered, discovery queues will not connect");
    }
    let backend = Arc::new(RecordingBackend::new());
    let token = CancellationToken::new();

    let (daemon, report) = Daemon::new(&config, transports, backend, token.clone())?;
    tracing::info!(
        targets = report.targets,
        groups = report.groups,
        skipped = report.skipped.len(),
        interfaces = daemon.interfaces().len(),
        "Configuration loaded"
    );

    if cli.check {
        for skipped in &report.skipped {
            println!("skipped {}: {}", skipped.entry, skipped.reason);
        }
        println!(
            "{} targets, {} groups, {} interfaces",
            report.targets,
            report.groups,
            daemon.interfaces().len()
        );
    } else if cli.once {
        let fleet = daemon.fleet().clone();
        let aliases = {
            let mut registry = fleet.registry().lock().await;
            fleet.scheduler().prime(&mut registry).await;
            registry.aliases()
        };
        for alias in aliases {
            println!("{}", fleet.target_logpage(&alias).await?);
        }
    } else if cli.daemon {
        watch_signals(token)?;
        daemon.run().await?;
    } else {
        anyhow::bail!("Specify --check, --once, or --daemon");
    }

    Ok(())
}
