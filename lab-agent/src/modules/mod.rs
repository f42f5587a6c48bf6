//! Hardware modules hosted by the agent.
//!
//! Every module kind implements [`DeviceModule`]. Instances are created
//! through [`create_module`], a static factory keyed by [`ModuleKind`].

mod env;
mod led;
mod ndi;

use std::sync::Arc;

use async_trait::async_trait;
use lab_common::{Ack, AckCode, ModuleKind, ParamMap, deep_merge, now_iso};
use serde_json::Value;
use thiserror::Error;

pub use env::{SpawnContext, resolve_ndi_path};
pub use led::LedModule;
pub use ndi::NdiModule;

/// Faults a module raises instead of answering with an outcome. The agent
/// turns them into `EXCEPTION` acks.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("invalid {module} configuration: {reason}")]
    Config { module: ModuleKind, reason: String },

    #[error("invalid command template: {0}")]
    CommandTemplate(#[from] process_utils::CommandLineError),
}

/// Observable lifecycle state of a module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ModuleState {
    #[default]
    Idle,
    Running,
}

/// Result of one module command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandOutcome {
    pub ok: bool,
    pub error: Option<String>,
    pub details: ParamMap,
}

impl CommandOutcome {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn ok_with(details: ParamMap) -> Self {
        Self {
            ok: true,
            error: None,
            details,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            details: ParamMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn unknown_action(action: &str) -> Self {
        Self::failed(format!("unknown action: {action}"))
    }

    /// Convert into the ack for `req_id`, using `failure_code` when not ok.
    pub fn into_ack(self, req_id: &str, failure_code: AckCode) -> Ack {
        let ack = if self.ok {
            Ack::success(req_id, AckCode::Ok)
        } else {
            let error = self.error.unwrap_or_else(|| "failed".to_string());
            Ack::failure(req_id, failure_code, error)
        };
        ack.with_details(self.details)
    }
}

/// State every module carries.
#[derive(Debug, Clone)]
pub struct ModuleCore {
    pub device_id: String,
    pub cfg: ParamMap,
    pub state: ModuleState,
    pub fields: ParamMap,
}

impl ModuleCore {
    pub fn new(device_id: impl Into<String>, cfg: ParamMap) -> Self {
        Self {
            device_id: device_id.into(),
            cfg,
            state: ModuleState::Idle,
            fields: ParamMap::new(),
        }
    }

    pub fn set_field(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    /// `{"module","device_id","state","fields","ts"}`
    pub fn status_payload(&self, kind: ModuleKind) -> ParamMap {
        let mut status = ParamMap::new();
        status.insert("module".into(), kind.as_str().into());
        status.insert("device_id".into(), self.device_id.clone().into());
        status.insert("state".into(), self.state.to_string().into());
        status.insert("fields".into(), Value::Object(self.fields.clone()));
        status.insert("ts".into(), now_iso().into());
        status
    }
}

#[async_trait]
pub trait DeviceModule: Send + Sync {
    fn kind(&self) -> ModuleKind;

    fn core(&self) -> &ModuleCore;

    fn core_mut(&mut self) -> &mut ModuleCore;

    /// Execute one command. An unrecognized action must leave state untouched
    /// and fail with an error naming it.
    async fn handle_cmd(
        &mut self,
        action: &str,
        params: &ParamMap,
    ) -> Result<CommandOutcome, ModuleError>;

    fn config(&self) -> &ParamMap {
        &self.core().cfg
    }

    /// Deep-merge a configuration patch into the current configuration.
    fn apply_config(&mut self, patch: &ParamMap) {
        deep_merge(&mut self.core_mut().cfg, patch);
    }

    fn status_payload(&self) -> ParamMap {
        self.core().status_payload(self.kind())
    }

    /// Called after every (re)connection to the bus.
    async fn on_agent_connect(&mut self) {}

    /// Release everything the module owns. Called before the module is dropped.
    async fn shutdown(&mut self) {}
}

/// Build a module of `kind`.
pub fn create_module(
    kind: ModuleKind,
    device_id: &str,
    cfg: ParamMap,
    context: Arc<SpawnContext>,
) -> Box<dyn DeviceModule> {
    match kind {
        ModuleKind::Led => Box::new(LedModule::new(device_id, cfg)),
        ModuleKind::Ndi => Box::new(NdiModule::new(device_id, cfg, context)),
    }
}

/// Parameter value, or `default` when absent or null.
pub(crate) fn param_or(params: &ParamMap, key: &str, default: impl Into<Value>) -> Value {
    match params.get(key) {
        None | Some(Value::Null) => default.into(),
        Some(value) => value.clone(),
    }
}

/// Non-empty string parameter.
pub(crate) fn param_str<'a>(params: &'a ParamMap, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_into_ack() {
        let ack = CommandOutcome::ok().into_ack("r-1", AckCode::ModuleError);
        assert!(ack.ok);
        assert_eq!(ack.code, AckCode::Ok);

        let ack = CommandOutcome::unknown_action("dance")
            .with_detail("code", "X")
            .into_ack("r-2", AckCode::ModuleError);
        assert!(!ack.ok);
        assert_eq!(ack.code, AckCode::ModuleError);
        assert_eq!(ack.error.as_deref(), Some("unknown action: dance"));
        assert_eq!(ack.details["code"], "X");
    }

    #[test]
    fn test_status_payload_shape() {
        let mut core = ModuleCore::new("dev1", ParamMap::new());
        core.state = ModuleState::Running;
        core.set_field("mode", "solid");
        let status = core.status_payload(ModuleKind::Led);
        assert_eq!(status["module"], "led");
        assert_eq!(status["device_id"], "dev1");
        assert_eq!(status["state"], "running");
        assert_eq!(status["fields"]["mode"], "solid");
        assert!(status.contains_key("ts"));
    }

    #[test]
    fn test_factory_builds_each_kind() {
        let context = Arc::new(SpawnContext::default());
        for kind in [ModuleKind::Led, ModuleKind::Ndi] {
            let module = create_module(kind, "dev1", ParamMap::new(), context.clone());
            assert_eq!(module.kind(), kind);
            assert_eq!(module.core().state, ModuleState::Idle);
        }
    }
}
