//! The seam between the adapter and a concrete broker client.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Delivery reliability requested for a publish or subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// A message on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl Outgoing {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::default(),
            retain: false,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }
}

/// Something the transport observed on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The broker accepted a (re)connection.
    Connected,
    /// An application message arrived on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
}

/// Inbound side of a transport. Unbounded so the connection driver never
/// waits on a handler that is itself waiting to publish.
pub type EventReceiver = mpsc::UnboundedReceiver<BusEvent>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, message: Outgoing) -> Result<()>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    /// Close the connection cleanly. The last will is not published.
    async fn disconnect(&self) -> Result<()>;
}
