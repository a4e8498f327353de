//! faultline aggregation service binary.
//!
//! Runs report intake consumers and aggregation runners in one process.

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use faultline_aggregator::AggregatorConfig;

mod services;

use services::Services;

/// faultline error aggregation service.
#[derive(Parser, Debug)]
#[command(name = "faultline")]
#[command(about = "Deduplicate and aggregate error reports")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "info,faultline_aggregator=debug,faultline_state=debug"
    } else {
        "info,faultline_aggregator=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    info!("faultline starting");

    let config = AggregatorConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    info!(
        runners = config.runner.runners,
        consumers = config.intake.consumers,
        reports_queue = %config.queues.reports,
        aggregation_queue = %config.queues.aggregation,
        "configuration loaded"
    );

    let mut services = Services::build(&config).await?;
    services.start();

    let cancel = services.cancel_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });

    services.wait().await;

    info!("faultline shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}
