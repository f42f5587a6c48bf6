//! Publish one JSON document to a lab topic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use lab_bus::{BusEvent, MqttConfig, MqttTransport, Outgoing, Transport};
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "lab-publish", version, about)]
struct Args {
    /// Destination topic, e.g. /lab/orchestrator/ndi/cmd.
    topic: String,

    /// File holding the JSON document to publish.
    file: PathBuf,

    #[arg(long, env = "LAB_MQTT_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "LAB_MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "LAB_MQTT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "LAB_MQTT_PASSWORD")]
    password: Option<String>,

    /// Publish as a retained message.
    #[arg(long)]
    retain: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let raw = std::fs::read(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let document: serde_json::Value =
        serde_json::from_slice(&raw).context("Document is not valid JSON")?;

    let mut config = MqttConfig::new(&args.host, args.port, "tools-publisher");
    config.username = args.username;
    config.password = args.password;

    let cancel = CancellationToken::new();
    let (transport, mut events) = MqttTransport::connect(&config, cancel.clone());
    let transport = Arc::new(transport);

    let connected = tokio::time::timeout(CONNECT_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if matches!(event, BusEvent::Connected) {
                return true;
            }
        }
        false
    })
    .await;
    if !matches!(connected, Ok(true)) {
        cancel.cancel();
        bail!("Could not connect to {}:{}", args.host, args.port);
    }

    let mut message = Outgoing::new(args.topic.as_str(), serde_json::to_vec(&document)?);
    message.retain = args.retain;
    transport.publish(message).await?;
    transport.disconnect().await?;

    println!("Published to {}: {}", args.topic, document);
    Ok(())
}
