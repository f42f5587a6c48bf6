use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lab_agent::{Agent, AgentConfig, last_will};
use lab_bus::{BusAdapter, MqttTransport};
use lab_common::logging::{self, LoggingOptions};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Lab device agent.
#[derive(Debug, Parser)]
#[command(name = "lab-agent", version, about)]
struct Args {
    /// Agent configuration file.
    #[arg(short, long, env = "LAB_AGENT_CONFIG", default_value = "agent.toml")]
    config: PathBuf,

    /// Log filter directive, overrides RUST_LOG.
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

    let mut log_options = LoggingOptions::new("lab_agent=info,lab_bus=info", "lab-agent");
    log_options.filter_override = args.log_filter.clone();
    log_options.json = args.json_logs;
    log_options.log_dir = args.log_dir.clone();
    let _logging = logging::init(&log_options).context("Failed to initialize logging")?;
    lab_common::panic::install();

    let config = AgentConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let mut mqtt = config.mqtt.to_config(&config.client_id());
    mqtt.last_will = Some(last_will(&config.device_id));

    let cancel = CancellationToken::new();
    let (transport, events) = MqttTransport::connect(&mqtt, cancel.child_token());
    let bus = Arc::new(BusAdapter::new(Arc::new(transport)));

    let agent = Agent::new(&config, Arc::clone(&bus));
    agent.start().await.context("Failed to start agent")?;
    info!(
        device_id = %config.device_id,
        broker = %format!("{}:{}", mqtt.host, mqtt.port),
        "lab-agent running"
    );

    let dispatcher = {
        let bus = Arc::clone(&bus);
        let cancel = cancel.clone();
        tokio::spawn(async move { bus.run(events, cancel).await })
    };

    shutdown_signal().await;
    agent.shutdown().await;
    cancel.cancel();
    if let Err(e) = dispatcher.await {
        error!(error = %e, "Dispatch task failed");
    }
    info!("lab-agent stopped");
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
