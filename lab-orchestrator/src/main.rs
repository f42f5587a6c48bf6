use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lab_bus::{BusAdapter, MqttTransport};
use lab_common::logging::{self, LoggingOptions};
use lab_orchestrator::config::DEFAULT_CLIENT_ID;
use lab_orchestrator::{Host, OrchestratorConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Lab orchestrator host.
#[derive(Debug, Parser)]
#[command(name = "lab-orchestrator", version, about)]
struct Args {
    /// Orchestrator configuration file. Built-in defaults when absent.
    #[arg(short, long, env = "LAB_ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive, overrides the config file and RUST_LOG.
    #[arg(long, env = "LAB_LOG_FILTER")]
    log_filter: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, env = "LAB_LOG_JSON")]
    json_logs: bool,

    /// Also write daily-rolled log files to this directory.
    #[arg(long, env = "LAB_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };

    let mut log_options =
        LoggingOptions::new("lab_orchestrator=info,lab_bus=info", "lab-orchestrator");
    log_options.filter_override = args.log_filter.clone().or(config.logging.filter.clone());
    log_options.json = args.json_logs || config.logging.json;
    log_options.log_dir = args.log_dir.clone().or(config.logging.dir.clone());
    let _logging = logging::init(&log_options).context("Failed to initialize logging")?;
    lab_common::panic::install();

    let mqtt = config.mqtt.to_config(DEFAULT_CLIENT_ID);
    let cancel = CancellationToken::new();
    let (transport, events) = MqttTransport::connect(&mqtt, cancel.child_token());
    let bus = Arc::new(BusAdapter::new(Arc::new(transport)));

    let host = Host::new(&config, Arc::clone(&bus)).context("Failed to build host")?;
    host.start().await.context("Failed to start host")?;
    info!(
        modules = ?host.modules(),
        broker = %format!("{}:{}", mqtt.host, mqtt.port),
        "lab-orchestrator running"
    );

    let dispatcher = {
        let bus = Arc::clone(&bus);
        let cancel = cancel.clone();
        tokio::spawn(async move { bus.run(events, cancel).await })
    };

    shutdown_signal().await;
    host.shutdown().await;
    cancel.cancel();
    if let Err(e) = dispatcher.await {
        error!(error = %e, "Dispatch task failed");
    }
    info!("lab-orchestrator stopped");
    Ok(())
}

/// Resolve on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
