//! Orchestrator host for the lab control plane.
//!
//! Tracks devices from their retained announcements, arbitrates exclusive
//! use of device modules through leases, runs scheduled command batches and
//! routes per-module orchestrator commands through one plugin per module kind.

pub mod config;
pub mod error;
pub mod host;
pub mod plugin;
pub mod registry;
pub mod scheduler;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use host::Host;
pub use plugin::{Plugin, PluginContext, PluginSettings, SourceDiscovery};
pub use registry::{Lease, LeaseError, Registry};
pub use scheduler::{CronSchedule, JobId, JobSpec, ScheduleError, Scheduler, Trigger};
