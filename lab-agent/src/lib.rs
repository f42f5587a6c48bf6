//! Device agent for the lab control plane.
//!
//! An agent represents one physical device on the bus. It hosts a set of
//! hardware modules, answers device and module commands with acks, and keeps
//! retained liveness, meta and module status documents current.

pub mod agent;
pub mod config;
pub mod error;
pub mod modules;

pub use agent::{AGENT_VERSION, Agent, MAX_CFG_BYTES, last_will, liveness_document};
pub use config::AgentConfig;
pub use error::{Error, Result};
