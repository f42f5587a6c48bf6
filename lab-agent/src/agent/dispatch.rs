//! Inbound command handling.
//!
//! Every accepted request produces exactly one ack. Module faults, whether
//! returned errors or panics, become `EXCEPTION` acks and never escape.

use std::str::FromStr;
use std::sync::Arc;

use futures::FutureExt;
use lab_common::envelope::UNKNOWN_REQ_ID;
use lab_common::panic::payload_message;
use lab_common::topics;
use lab_common::{Ack, AckCode, ModuleKind, ParamMap, now_iso, parse_envelope};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{AgentCore, MAX_CFG_BYTES, ModuleSlot, shutdown_module};
use crate::modules::{CommandOutcome, create_module};

/// Ack action used for configuration patches.
const CFG_ACTION: &str = "cfg";

fn module_config_param(params: &ParamMap) -> Result<ParamMap, CommandOutcome> {
    match params.get("cfg") {
        None | Some(Value::Null) => Ok(ParamMap::new()),
        Some(Value::Object(cfg)) => Ok(cfg.clone()),
        Some(_) => Err(CommandOutcome::failed("cfg must be an object")),
    }
}

impl AgentCore {
    pub(super) async fn handle_device_message(&self, payload: &[u8]) {
        let evt = topics::device_evt(&self.device_id);
        let envelope = match parse_envelope(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(device_id = %self.device_id, error = %e, "Rejected device command");
                self.publish_ack(&evt, &e.to_ack()).await;
                return;
            }
        };

        let result = std::panic::AssertUnwindSafe(
            self.handle_device_cmd(&envelope.action, &envelope.params),
        )
        .catch_unwind()
        .await;
        let ack = match result {
            Ok(outcome) => outcome.into_ack(&envelope.req_id, AckCode::DeviceError),
            Err(panic) => Ack::failure(
                &envelope.req_id,
                AckCode::Exception,
                payload_message(panic.as_ref()),
            ),
        }
        .with_action(envelope.action.as_str())
        .with_actor(envelope.actor.as_str());
        self.publish_ack(&evt, &ack).await;
    }

    /// Device-level administrative commands.
    pub(super) async fn handle_device_cmd(&self, action: &str, params: &ParamMap) -> CommandOutcome {
        match action {
            "ping" => CommandOutcome::ok()
                .with_detail("device_id", self.device_id.as_str())
                .with_detail("ts", now_iso()),
            "set_labels" => self.set_labels(params).await,
            "add_module" => self.add_module(params).await,
            "remove_module" => self.remove_module(params).await,
            "apply_feature" => self.apply_feature(params).await,
            other => CommandOutcome::unknown_action(other),
        }
    }

    async fn set_labels(&self, params: &ParamMap) -> CommandOutcome {
        let Some(Value::Array(items)) = params.get("labels") else {
            return CommandOutcome::failed("labels must be a list");
        };
        let Some(labels) = items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
        else {
            return CommandOutcome::failed("labels must be a list of strings");
        };

        let mut state = self.state.lock().await;
        state.labels = labels.clone();
        self.publish_meta(&state).await;
        CommandOutcome::ok().with_detail("labels", labels)
    }

    async fn add_module(&self, params: &ParamMap) -> CommandOutcome {
        let Some(name) = params.get("name").and_then(Value::as_str).filter(|n| !n.is_empty()) else {
            return CommandOutcome::failed("missing module name");
        };
        let Ok(kind) = ModuleKind::from_str(name) else {
            return CommandOutcome::failed(format!("unknown module: {name}"));
        };
        let cfg = match module_config_param(params) {
            Ok(cfg) => cfg,
            Err(outcome) => return outcome,
        };

        let mut state = self.state.lock().await;
        if let Some(slot) = state.modules.get_mut(&kind) {
            slot.module.apply_config(&cfg);
            self.publish_module_status(kind, slot.module.as_ref()).await;
            self.publish_meta(&state).await;
            info!(device_id = %self.device_id, module = %kind, "Module reconfigured");
            return CommandOutcome::ok().with_detail("updated", true);
        }

        let module = create_module(kind, &self.device_id, cfg, Arc::clone(&self.context));
        let subscription = self.subscribe_module(kind).await;
        self.publish_module_status(kind, module.as_ref()).await;
        state.modules.insert(
            kind,
            ModuleSlot {
                module,
                subscription,
            },
        );
        self.publish_meta(&state).await;
        info!(device_id = %self.device_id, module = %kind, "Module added");
        CommandOutcome::ok().with_detail("added", kind.as_str())
    }

    async fn remove_module(&self, params: &ParamMap) -> CommandOutcome {
        let Some(kind) = params
            .get("name")
            .and_then(Value::as_str)
            .and_then(|name| ModuleKind::from_str(name).ok())
        else {
            return CommandOutcome::failed("module not found");
        };

        let mut state = self.state.lock().await;
        let Some(mut slot) = state.modules.remove(&kind) else {
            return CommandOutcome::failed("module not found");
        };

        self.unsubscribe_module(kind, slot.subscription.take()).await;
        shutdown_module(kind, slot.module.as_mut()).await;
        drop(slot);
        self.publish_meta(&state).await;
        info!(device_id = %self.device_id, module = %kind, "Module removed");
        CommandOutcome::ok().with_detail("removed", kind.as_str())
    }

    /// Replace every module with the named preset. The preset is fully
    /// validated before anything is torn down.
    async fn apply_feature(&self, params: &ParamMap) -> CommandOutcome {
        let Some((name, preset)) = params
            .get("feature")
            .and_then(Value::as_str)
            .and_then(|name| self.features.get_key_value(name))
        else {
            return CommandOutcome::failed("unknown feature");
        };

        let mut selected = Vec::with_capacity(preset.len());
        for (module_name, cfg) in preset {
            match ModuleKind::from_str(module_name) {
                Ok(kind) => selected.push((kind, cfg.clone())),
                Err(_) => {
                    return CommandOutcome::failed(format!(
                        "unknown module in feature {name}: {module_name}"
                    ));
                }
            }
        }

        let mut state = self.state.lock().await;
        let previous = std::mem::take(&mut state.modules);
        for (kind, mut slot) in previous {
            self.unsubscribe_module(kind, slot.subscription.take()).await;
            shutdown_module(kind, slot.module.as_mut()).await;
        }

        for (kind, cfg) in selected {
            let module = create_module(kind, &self.device_id, cfg, Arc::clone(&self.context));
            let subscription = self.subscribe_module(kind).await;
            self.publish_module_status(kind, module.as_ref()).await;
            state.modules.insert(
                kind,
                ModuleSlot {
                    module,
                    subscription,
                },
            );
        }
        state.feature = Some(name.clone());
        self.publish_meta(&state).await;

        let modules: Vec<String> = state.modules.keys().map(|k| k.to_string()).collect();
        info!(device_id = %self.device_id, feature = %name, modules = ?modules, "Feature applied");
        CommandOutcome::ok()
            .with_detail("feature", name.as_str())
            .with_detail("modules", modules)
    }

    pub(super) async fn handle_module_cmd(&self, kind: ModuleKind, payload: &[u8]) {
        let evt = topics::module_evt(&self.device_id, kind.as_str());
        let envelope = match parse_envelope(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(device_id = %self.device_id, module = %kind, error = %e, "Rejected module command");
                self.publish_ack(&evt, &e.to_ack()).await;
                return;
            }
        };

        let mut state = self.state.lock().await;
        let Some(slot) = state.modules.get_mut(&kind) else {
            debug!(device_id = %self.device_id, module = %kind, "Command for module that is no longer hosted");
            return;
        };

        let result = std::panic::AssertUnwindSafe(
            slot.module.handle_cmd(&envelope.action, &envelope.params),
        )
        .catch_unwind()
        .await;
        self.publish_module_status(kind, slot.module.as_ref()).await;
        drop(state);

        let ack = match result {
            Ok(Ok(outcome)) => outcome.into_ack(&envelope.req_id, AckCode::ModuleError),
            Ok(Err(e)) => {
                warn!(device_id = %self.device_id, module = %kind, action = %envelope.action, error = %e, "Module command failed");
                Ack::failure(&envelope.req_id, AckCode::Exception, e.to_string())
            }
            Err(panic) => {
                let message = payload_message(panic.as_ref());
                warn!(device_id = %self.device_id, module = %kind, action = %envelope.action, panic = %message, "Module command panicked");
                Ack::failure(&envelope.req_id, AckCode::Exception, message)
            }
        }
        .with_action(envelope.action.as_str())
        .with_actor(envelope.actor.as_str());
        self.publish_ack(&evt, &ack).await;
    }

    pub(super) async fn handle_module_cfg(&self, kind: ModuleKind, payload: &[u8]) {
        let evt = topics::module_evt(&self.device_id, kind.as_str());
        let reject = |req_id: &str, code: AckCode, error: String| {
            Ack::failure(req_id, code, error).with_action(CFG_ACTION)
        };

        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                let ack = reject(UNKNOWN_REQ_ID, AckCode::BadJson, format!("bad json: {e}"));
                self.publish_ack(&evt, &ack).await;
                return;
            }
        };
        let Value::Object(mut patch) = value else {
            let ack = reject(UNKNOWN_REQ_ID, AckCode::BadRequest, "cfg_not_object".to_string());
            self.publish_ack(&evt, &ack).await;
            return;
        };

        let req_id = patch
            .remove("req_id")
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| UNKNOWN_REQ_ID.to_string());
        if payload.len() > MAX_CFG_BYTES {
            let ack = reject(&req_id, AckCode::BadRequest, "cfg_too_large".to_string());
            self.publish_ack(&evt, &ack).await;
            return;
        }

        let mut state = self.state.lock().await;
        let Some(slot) = state.modules.get_mut(&kind) else {
            debug!(device_id = %self.device_id, module = %kind, "Config for module that is no longer hosted");
            return;
        };
        slot.module.apply_config(&patch);
        self.publish_module_status(kind, slot.module.as_ref()).await;
        drop(state);

        debug!(device_id = %self.device_id, module = %kind, "Module config merged");
        let ack = Ack::success(req_id, AckCode::Ok).with_action(CFG_ACTION);
        self.publish_ack(&evt, &ack).await;
    }
}
