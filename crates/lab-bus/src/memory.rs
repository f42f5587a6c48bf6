//! In-process transport used by tests and local tooling.
//!
//! Behaves like a tiny broker with a single client: publishes to a subscribed
//! filter loop back as inbound messages, retained messages are stored and
//! replayed on subscribe, and an empty retained payload clears the topic.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{BusError, Result};
use crate::filter::topic_matches;
use crate::transport::{BusEvent, EventReceiver, Outgoing, QoS, Transport};

#[derive(Default)]
struct State {
    published: Vec<Outgoing>,
    retained: BTreeMap<String, Vec<u8>>,
    filters: BTreeSet<String>,
    connected: bool,
}

pub struct MemoryTransport {
    state: Mutex<State>,
    events: mpsc::UnboundedSender<BusEvent>,
    last_will: Option<Outgoing>,
}

impl MemoryTransport {
    /// A connected transport; the first event on the receiver is [`BusEvent::Connected`].
    pub fn new() -> (Self, EventReceiver) {
        Self::with_last_will(None)
    }

    pub fn with_last_will(last_will: Option<Outgoing>) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let _ = events.send(BusEvent::Connected);
        let transport = Self {
            state: Mutex::new(State {
                connected: true,
                ..State::default()
            }),
            events,
            last_will,
        };
        (transport, rx)
    }

    /// Deliver a message as if another client had published it.
    pub fn inject(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        let topic = topic.into();
        let payload = payload.into();
        let subscribed = self
            .state
            .lock()
            .filters
            .iter()
            .any(|filter| topic_matches(filter, &topic));
        if subscribed {
            let _ = self.events.send(BusEvent::Message { topic, payload });
        }
    }

    /// Emit another [`BusEvent::Connected`], as after a broker reconnect.
    pub fn reconnect(&self) {
        self.state.lock().connected = true;
        let _ = self.events.send(BusEvent::Connected);
    }

    /// Drop the connection uncleanly: the broker publishes the last will.
    pub fn drop_connection(&self) {
        let will = {
            let mut state = self.state.lock();
            state.connected = false;
            self.last_will.clone()
        };
        if let Some(will) = will {
            self.store(will);
        }
    }

    /// Every message published through this transport, oldest first.
    pub fn published(&self) -> Vec<Outgoing> {
        self.state.lock().published.clone()
    }

    /// Messages published to exactly `topic`.
    pub fn published_to(&self, topic: &str) -> Vec<Outgoing> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Payloads published to `topic`, parsed as JSON. Unparseable ones are skipped.
    pub fn published_json(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published_to(topic)
            .iter()
            .filter_map(|m| serde_json::from_slice(&m.payload).ok())
            .collect()
    }

    pub fn clear_published(&self) {
        self.state.lock().published.clear();
    }

    /// Current retained payload of `topic`.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state.lock().retained.get(topic).cloned()
    }

    pub fn is_subscribed(&self, filter: &str) -> bool {
        self.state.lock().filters.contains(filter)
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn store(&self, message: Outgoing) {
        let loopback = {
            let mut state = self.state.lock();
            if message.retain {
                if message.payload.is_empty() {
                    state.retained.remove(&message.topic);
                } else {
                    state
                        .retained
                        .insert(message.topic.clone(), message.payload.clone());
                }
            }
            let loopback = state
                .filters
                .iter()
                .any(|filter| topic_matches(filter, &message.topic));
            state.published.push(message.clone());
            loopback
        };
        if loopback {
            let _ = self.events.send(BusEvent::Message {
                topic: message.topic,
                payload: message.payload,
            });
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, message: Outgoing) -> Result<()> {
        if !self.is_connected() {
            return Err(BusError::Closed);
        }
        self.store(message);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<()> {
        let replay: Vec<BusEvent> = {
            let mut state = self.state.lock();
            state.filters.insert(filter.to_string());
            state
                .retained
                .iter()
                .filter(|(topic, _)| topic_matches(filter, topic))
                .map(|(topic, payload)| BusEvent::Message {
                    topic: topic.clone(),
                    payload: payload.clone(),
                })
                .collect()
        };
        for event in replay {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.state.lock().filters.remove(filter);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().connected = false;
        Ok(())
    }
}
