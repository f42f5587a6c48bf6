//! Shared building blocks for the lab control plane.
//!
//! Every participant on the bus (device agents, the orchestrator host and
//! operator tools) speaks the same envelope/ack protocol and uses the same
//! topic namespace. Both live here so the two sides cannot drift apart.

pub mod ack;
pub mod envelope;
pub mod logging;
pub mod merge;
pub mod module;
pub mod panic;
pub mod time;
pub mod topics;

pub use ack::{Ack, AckCode};
pub use envelope::{Envelope, ParamMap, ProtocolError, parse_envelope};
pub use merge::deep_merge;
pub use module::{ModuleKind, lease_key};
pub use time::now_iso;
