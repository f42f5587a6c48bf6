//! Message bus plumbing shared by device agents and the orchestrator.
//!
//! A [`Transport`] moves bytes to and from a broker. [`MqttTransport`] talks
//! to a real MQTT broker through `rumqttc`; [`MemoryTransport`] is an
//! in-process stand-in with broker-like retained/loopback semantics.
//!
//! [`BusAdapter`] sits on top of a transport and routes every inbound message
//! through one serialized dispatch path to all subscriptions whose filters
//! match it.

pub mod adapter;
pub mod error;
pub mod filter;
pub mod memory;
pub mod mqtt;
pub mod transport;

pub use adapter::{BusAdapter, ConnectHook, MessageHandler, SubscriptionId};
pub use error::{BusError, Result};
pub use filter::topic_matches;
pub use memory::MemoryTransport;
pub use mqtt::{MqttConfig, MqttSettings, MqttTransport};
pub use transport::{BusEvent, EventReceiver, Outgoing, QoS, Transport};
