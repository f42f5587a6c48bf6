//! NDI viewer/recorder backed by helper processes.
//!
//! The module owns up to two process groups: the viewer started by `start`
//! and the recorder started by `record_start`. Both are launched from
//! configured command templates in which `{source}` and `{device_id}` are
//! substituted. Teardown signals the whole group, so helpers that fork stay
//! under control.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lab_common::{ModuleKind, ParamMap};
use process_utils::{GroupChild, TerminationOutcome, TerminationPolicy, spawn_group, split_command_line};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::env::{env_value, resolve_ndi_path};
use super::{CommandOutcome, DeviceModule, ModuleCore, ModuleError, ModuleState, SpawnContext, param_str};

/// `details.code` when the helper binary could not be started.
pub const SPAWN_FAILED: &str = "SPAWN_FAILED";
/// `details.code` when the viewer died during the liveness probe.
pub const EXITED_EARLY: &str = "EXITED_EARLY";

const LD_LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

fn default_true() -> bool {
    true
}

fn default_probe_delay_ms() -> u64 {
    300
}

fn default_term_grace_ms() -> u64 {
    3000
}

fn default_term_poll_ms() -> u64 {
    100
}

/// Typed view over the module configuration.
#[derive(Debug, Clone, Deserialize)]
struct NdiSettings {
    #[serde(default)]
    start_cmd_template: Option<String>,
    #[serde(default)]
    stop_cmd: Option<String>,
    #[serde(default = "default_true")]
    set_input_restart: bool,
    #[serde(default)]
    record_start_cmd_template: Option<String>,
    #[serde(default)]
    record_stop_cmd: Option<String>,
    #[serde(default)]
    ndi_path: Option<String>,
    #[serde(default)]
    ld_library_path: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, Value>,
    #[serde(default = "default_probe_delay_ms")]
    probe_delay_ms: u64,
    #[serde(default = "default_term_grace_ms")]
    term_grace_ms: u64,
    #[serde(default = "default_term_poll_ms")]
    term_poll_ms: u64,
}

impl NdiSettings {
    fn from_cfg(cfg: &ParamMap) -> Result<Self, ModuleError> {
        serde_json::from_value(Value::Object(cfg.clone())).map_err(|e| ModuleError::Config {
            module: ModuleKind::Ndi,
            reason: e.to_string(),
        })
    }

    fn termination_policy(&self) -> TerminationPolicy {
        TerminationPolicy::new(
            Duration::from_millis(self.term_grace_ms),
            Duration::from_millis(self.term_poll_ms),
        )
    }

    /// Environment variables this configuration asks for.
    fn env_overrides(&self) -> BTreeMap<String, String> {
        let mut overrides = BTreeMap::new();
        if let Some((key, value)) = self.ndi_path.as_deref().and_then(resolve_ndi_path) {
            overrides.insert(key, value);
        }
        if let Some(path) = self.ld_library_path.as_deref().filter(|p| !p.is_empty()) {
            overrides.insert(LD_LIBRARY_PATH_VAR.to_string(), path.to_string());
        }
        for (key, value) in &self.env {
            overrides.insert(key.clone(), env_value(value));
        }
        overrides
    }
}

fn missing(setting: &str) -> CommandOutcome {
    CommandOutcome::failed(format!("{setting} not set"))
}

pub struct NdiModule {
    core: ModuleCore,
    context: Arc<SpawnContext>,
    /// Overrides applied so far. They accumulate and persist for the
    /// lifetime of the module, even if later removed from the config.
    env: BTreeMap<String, String>,
    viewer: Option<GroupChild>,
    recorder: Option<GroupChild>,
    current_source: Option<String>,
}

impl NdiModule {
    pub fn new(device_id: &str, cfg: ParamMap, context: Arc<SpawnContext>) -> Self {
        Self {
            core: ModuleCore::new(device_id, cfg),
            context,
            env: BTreeMap::new(),
            viewer: None,
            recorder: None,
            current_source: None,
        }
    }

    fn settings(&self) -> Result<NdiSettings, ModuleError> {
        NdiSettings::from_cfg(&self.core.cfg)
    }

    /// Build argv from a template. Substitution happens per word, so a source
    /// name containing spaces stays a single argument.
    fn render(&self, template: &str, source: Option<&str>) -> Result<Vec<String>, ModuleError> {
        let source = source
            .or(self.current_source.as_deref())
            .unwrap_or_default();
        Ok(split_command_line(template)?
            .into_iter()
            .map(|word| {
                word.replace("{source}", source)
                    .replace("{device_id}", &self.core.device_id)
            })
            .collect())
    }

    fn spawn_env(&mut self, settings: &NdiSettings) -> BTreeMap<String, String> {
        self.env.extend(settings.env_overrides());
        self.context.compose(&self.env)
    }

    fn spawn(
        &mut self,
        settings: &NdiSettings,
        argv: &[String],
    ) -> Result<GroupChild, CommandOutcome> {
        let env = self.spawn_env(settings);
        spawn_group(argv, &env).map_err(|e| {
            warn!(device_id = %self.core.device_id, error = %e, "Failed to spawn NDI helper");
            CommandOutcome::failed(format!("spawn failed: {e}")).with_detail("code", SPAWN_FAILED)
        })
    }

    /// Fire-and-forget helper such as `stop_cmd`.
    fn run_helper(&mut self, settings: &NdiSettings, template: &str) -> Result<(), ModuleError> {
        let argv = self.render(template, None)?;
        match self.spawn(settings, &argv) {
            Ok(child) => {
                debug!(pid = child.pid(), program = %child.program(), "Launched helper command");
                child.detach();
            }
            Err(outcome) => {
                warn!(error = ?outcome.error, "Helper command did not start");
            }
        }
        Ok(())
    }

    async fn stop_viewer(&mut self, policy: TerminationPolicy) {
        if let Some(viewer) = self.viewer.take() {
            let pid = viewer.pid();
            let outcome = viewer.terminate(policy).await;
            self.core.set_field("pid", Value::Null);
            info!(device_id = %self.core.device_id, pid, ?outcome, "Stopped NDI viewer");
        }
    }

    /// Spawn the viewer for `source` and verify it survives the probe delay.
    async fn launch_viewer(
        &mut self,
        settings: &NdiSettings,
        template: &str,
        source: &str,
    ) -> Result<CommandOutcome, ModuleError> {
        let argv = self.render(template, Some(source))?;
        let mut viewer = match self.spawn(settings, &argv) {
            Ok(child) => child,
            Err(outcome) => return Ok(outcome),
        };

        tokio::time::sleep(Duration::from_millis(settings.probe_delay_ms)).await;

        let exit = match viewer.try_exit_status() {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Failed to probe NDI viewer");
                None
            }
        };
        if let Some(status) = exit {
            warn!(device_id = %self.core.device_id, %status, "NDI viewer exited during startup");
            self.core.state = ModuleState::Idle;
            self.core.set_field("input", Value::Null);
            self.core.set_field("pid", Value::Null);
            let mut outcome = CommandOutcome::failed("process exited early")
                .with_detail("code", EXITED_EARLY);
            if let Some(code) = status.code() {
                outcome = outcome.with_detail("exit_code", code);
            }
            return Ok(outcome);
        }

        info!(device_id = %self.core.device_id, pid = viewer.pid(), source = %source, "NDI viewer running");
        self.core.state = ModuleState::Running;
        self.core.set_field("input", source);
        self.core.set_field("pid", viewer.pid());
        self.viewer = Some(viewer);
        Ok(CommandOutcome::ok())
    }

    async fn start(&mut self, params: &ParamMap) -> Result<CommandOutcome, ModuleError> {
        let Some(source) = param_str(params, "source").map(str::to_string) else {
            return Ok(CommandOutcome::failed("missing source"));
        };
        let settings = self.settings()?;
        let Some(template) = settings.start_cmd_template.clone() else {
            return Ok(missing("start_cmd_template"));
        };

        self.stop_viewer(settings.termination_policy()).await;
        let outcome = self.launch_viewer(&settings, &template, &source).await?;
        if outcome.ok {
            self.current_source = Some(source);
        }
        Ok(outcome)
    }

    async fn stop(&mut self) -> Result<CommandOutcome, ModuleError> {
        let settings = self.settings()?;
        self.stop_viewer(settings.termination_policy()).await;
        if let Some(stop_cmd) = settings.stop_cmd.clone() {
            self.run_helper(&settings, &stop_cmd)?;
        }
        self.core.state = ModuleState::Idle;
        self.core.set_field("input", Value::Null);
        self.core.set_field("pid", Value::Null);
        Ok(CommandOutcome::ok())
    }

    async fn set_input(&mut self, params: &ParamMap) -> Result<CommandOutcome, ModuleError> {
        let Some(source) = param_str(params, "source").map(str::to_string) else {
            return Ok(CommandOutcome::failed("missing source"));
        };
        let settings = self.settings()?;
        self.current_source = Some(source.clone());
        self.core.set_field("input", source.as_str());

        match settings.start_cmd_template.clone() {
            Some(template) if settings.set_input_restart => {
                self.stop_viewer(settings.termination_policy()).await;
                self.launch_viewer(&settings, &template, &source).await
            }
            _ => Ok(CommandOutcome::ok()),
        }
    }

    async fn record_start(&mut self, params: &ParamMap) -> Result<CommandOutcome, ModuleError> {
        if let Some(recorder) = self.recorder.as_mut() {
            if recorder.is_alive() {
                return Ok(CommandOutcome::ok().with_detail("note", "recording already running"));
            }
            debug!(pid = recorder.pid(), "Previous recorder is gone, starting a new one");
            self.recorder = None;
        }

        let settings = self.settings()?;
        let Some(template) = settings.record_start_cmd_template.clone() else {
            return Ok(missing("record_start_cmd_template"));
        };
        let Some(source) = param_str(params, "source")
            .map(str::to_string)
            .or_else(|| self.current_source.clone())
        else {
            return Ok(CommandOutcome::failed("no source to record"));
        };

        let argv = self.render(&template, Some(&source))?;
        let recorder = match self.spawn(&settings, &argv) {
            Ok(child) => child,
            Err(outcome) => return Ok(outcome),
        };
        info!(device_id = %self.core.device_id, pid = recorder.pid(), source = %source, "Recording started");
        self.core.set_field("recording", true);
        self.core.set_field("record_pid", recorder.pid());
        self.recorder = Some(recorder);
        Ok(CommandOutcome::ok())
    }

    async fn record_stop(&mut self) -> Result<CommandOutcome, ModuleError> {
        let settings = self.settings()?;
        if let Some(stop_cmd) = settings.record_stop_cmd.clone() {
            self.run_helper(&settings, &stop_cmd)?;
        }
        let mut outcome = CommandOutcome::ok();
        if let Some(recorder) = self.recorder.take() {
            let pid = recorder.pid();
            let result = recorder.interrupt(settings.termination_policy()).await;
            info!(device_id = %self.core.device_id, pid, outcome = ?result, "Recording stopped");
            if result == TerminationOutcome::Killed {
                outcome = outcome.with_detail("note", "recorder killed after grace period");
            }
        }
        self.core.set_field("recording", false);
        self.core.set_field("record_pid", Value::Null);
        Ok(outcome)
    }

    /// Bring state in line with a viewer that died on its own.
    fn reconcile(&mut self) {
        let exited = self
            .viewer
            .as_mut()
            .is_some_and(|viewer| !viewer.is_alive());
        if exited {
            warn!(device_id = %self.core.device_id, "NDI viewer is no longer running");
            self.viewer = None;
            self.core.state = ModuleState::Idle;
            self.core.set_field("pid", Value::Null);
        }
    }
}

#[async_trait]
impl DeviceModule for NdiModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Ndi
    }

    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }

    async fn handle_cmd(
        &mut self,
        action: &str,
        params: &ParamMap,
    ) -> Result<CommandOutcome, ModuleError> {
        match action {
            "start" => self.start(params).await,
            "stop" => self.stop().await,
            "set_input" => self.set_input(params).await,
            "record_start" => self.record_start(params).await,
            "record_stop" => self.record_stop().await,
            other => Ok(CommandOutcome::unknown_action(other)),
        }
    }

    async fn on_agent_connect(&mut self) {
        self.reconcile();
    }

    async fn shutdown(&mut self) {
        let policy = self
            .settings()
            .map(|s| s.termination_policy())
            .unwrap_or_default();
        self.stop_viewer(policy).await;
        if let Some(recorder) = self.recorder.take() {
            recorder.interrupt(policy).await;
        }
        self.core.state = ModuleState::Idle;
    }
}
