//! MQTT transport backed by `rumqttc`.
//!
//! The rumqttc event loop runs on its own task and forwards connection and
//! message events over an unbounded channel. Handlers therefore never run on
//! the task that drives the socket, so a handler can await a publish without
//! stalling the connection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::transport::{BusEvent, EventReceiver, Outgoing, QoS, Transport};

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 100;

/// How long `disconnect` waits for the event loop to flush and exit.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Delay before polling again after a connection error.
    pub retry_delay: Duration,
    /// Published by the broker if the connection drops without a clean disconnect.
    pub last_will: Option<Outgoing>,
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            retry_delay: Duration::from_secs(2),
            last_will: None,
        }
    }

    fn to_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }
        if let Some(will) = &self.last_will {
            options.set_last_will(LastWill::new(
                &will.topic,
                will.payload.clone(),
                will.qos.into(),
                will.retain,
            ));
        }
        options
    }
}

/// The `[mqtt]` section of an application config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_s: u64,
    /// Falls back to the application-specific default when unset.
    pub client_id: Option<String>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_s: 30,
            client_id: None,
        }
    }
}

impl MqttSettings {
    pub fn to_config(&self, default_client_id: &str) -> MqttConfig {
        let client_id = self.client_id.as_deref().unwrap_or(default_client_id);
        let mut config = MqttConfig::new(&self.host, self.port, client_id);
        config.username = self.username.clone();
        config.password = self.password.clone();
        config.keep_alive = Duration::from_secs(self.keep_alive_s);
        config
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    /// Filters to restore after every reconnect; sessions are clean.
    subscriptions: Arc<Mutex<BTreeMap<String, QoS>>>,
    closing: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Create the client and start driving the connection.
    ///
    /// Connecting happens in the background; a [`BusEvent::Connected`] is
    /// emitted each time the broker accepts the session.
    pub fn connect(config: &MqttConfig, cancel: CancellationToken) -> (Self, EventReceiver) {
        let (client, eventloop) = AsyncClient::new(config.to_options(), REQUEST_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(Mutex::new(BTreeMap::new()));
        let closing = Arc::new(AtomicBool::new(false));

        info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "Connecting to MQTT broker"
        );

        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            Arc::clone(&subscriptions),
            Arc::clone(&closing),
            events_tx,
            config.retry_delay,
            cancel,
        ));

        (
            Self {
                client,
                subscriptions,
                closing,
                driver: Mutex::new(Some(driver)),
            },
            events_rx,
        )
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Mutex<BTreeMap<String, QoS>>>,
    closing: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<BusEvent>,
    retry_delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                let filters: Vec<(String, QoS)> = subscriptions
                    .lock()
                    .iter()
                    .map(|(filter, qos)| (filter.clone(), *qos))
                    .collect();
                for (filter, qos) in filters {
                    if let Err(e) = client.try_subscribe(&filter, qos.into()) {
                        warn!(filter = %filter, error = %e, "Failed to restore subscription");
                    }
                }
                if events.send(BusEvent::Connected).is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BusEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if events.send(message).is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                debug!("Disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %e, retry_in_ms = retry_delay.as_millis() as u64, "MQTT connection error");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
        }
    }
    debug!("MQTT event loop stopped");
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, message: Outgoing) -> Result<()> {
        self.client
            .publish(message.topic, message.qos.into(), message.retain, message.payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.subscriptions.lock().insert(filter.to_string(), qos);
        self.client.subscribe(filter, qos.into()).await?;
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.subscriptions.lock().remove(filter);
        self.client.unsubscribe(filter).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.client.disconnect().await?;
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if tokio::time::timeout(DISCONNECT_TIMEOUT, driver).await.is_err() {
                warn!("MQTT event loop did not stop after disconnect");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings: MqttSettings = serde_json::from_str(r#"{"host": "broker.local"}"#).unwrap();
        assert_eq!(settings.port, 1883);
        let config = settings.to_config("lab-orchestrator");
        assert_eq!(config.client_id, "lab-orchestrator");
        assert_eq!(config.keep_alive, Duration::from_secs(30));
    }

    #[test]
    fn test_options_carry_last_will() {
        let mut config = MqttConfig::new("broker.local", 1883, "device-dev1");
        config.username = Some("lab".to_string());
        config.last_will = Some(Outgoing::new("/lab/device/dev1/status", b"{}".to_vec()).retained());
        let options = config.to_options();
        let will = options.last_will().unwrap();
        assert_eq!(will.topic, "/lab/device/dev1/status");
        assert!(will.retain);
        assert_eq!(options.client_id(), "device-dev1");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
    }
}
