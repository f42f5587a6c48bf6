//! Lighting controller.
//!
//! Drives no hardware of its own yet; it tracks the requested lighting mode
//! so that status consumers see what the strip should be showing.

use async_trait::async_trait;
use lab_common::{ModuleKind, ParamMap};

use super::{CommandOutcome, DeviceModule, ModuleCore, ModuleError, ModuleState, param_or};

const EFFECT_FPS: u64 = 60;

pub struct LedModule {
    core: ModuleCore,
}

impl LedModule {
    pub fn new(device_id: &str, cfg: ParamMap) -> Self {
        Self {
            core: ModuleCore::new(device_id, cfg),
        }
    }
}

#[async_trait]
impl DeviceModule for LedModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Led
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
        let core = &mut self.core;
        match action {
            "off" => {
                core.state = ModuleState::Idle;
                core.set_field("mode", "off");
            }
            "solid" => {
                core.state = ModuleState::Running;
                core.set_field("mode", "solid");
                core.set_field("color", param_or(params, "color", "#FFFFFF"));
                core.set_field("brightness", param_or(params, "brightness", 255));
            }
            "effect" => {
                core.state = ModuleState::Running;
                core.set_field("mode", "effect");
                core.set_field("effect", param_or(params, "name", "rainbow"));
                core.set_field("speed", param_or(params, "speed", 0.8));
                core.set_field("brightness", param_or(params, "brightness", 180));
                core.set_field("fps", EFFECT_FPS);
            }
            "brightness" => {
                core.set_field("brightness", param_or(params, "value", 128));
            }
            other => return Ok(CommandOutcome::unknown_action(other)),
        }
        Ok(CommandOutcome::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> ParamMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_off_goes_idle() {
        let mut led = LedModule::new("dev1", ParamMap::new());
        led.handle_cmd("solid", &ParamMap::new()).await.unwrap();
        assert_eq!(led.core.state, ModuleState::Running);

        let outcome = led.handle_cmd("off", &ParamMap::new()).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(led.core.state, ModuleState::Idle);
        assert_eq!(led.core.fields["mode"], "off");
    }

    #[tokio::test]
    async fn test_solid_defaults_and_overrides() {
        let mut led = LedModule::new("dev1", ParamMap::new());
        led.handle_cmd("solid", &ParamMap::new()).await.unwrap();
        assert_eq!(led.core.fields["color"], "#FFFFFF");
        assert_eq!(led.core.fields["brightness"], 255);

        led.handle_cmd("solid", &params(json!({"color": "#FF0000", "brightness": 10})))
            .await
            .unwrap();
        assert_eq!(led.core.fields["color"], "#FF0000");
        assert_eq!(led.core.fields["brightness"], 10);
    }

    #[tokio::test]
    async fn test_effect_fields() {
        let mut led = LedModule::new("dev1", ParamMap::new());
        led.handle_cmd("effect", &params(json!({"speed": 2.5})))
            .await
            .unwrap();
        let fields = &led.core.fields;
        assert_eq!(fields["mode"], "effect");
        assert_eq!(fields["effect"], "rainbow");
        assert_eq!(fields["speed"], 2.5);
        assert_eq!(fields["brightness"], 180);
        assert_eq!(fields["fps"], 60);
    }

    #[tokio::test]
    async fn test_brightness_keeps_state() {
        let mut led = LedModule::new("dev1", ParamMap::new());
        led.handle_cmd("brightness", &ParamMap::new()).await.unwrap();
        assert_eq!(led.core.state, ModuleState::Idle);
        assert_eq!(led.core.fields["brightness"], 128);
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected() {
        let mut led = LedModule::new("dev1", ParamMap::new());
        led.handle_cmd("solid", &ParamMap::new()).await.unwrap();
        let before = led.core.fields.clone();

        let outcome = led.handle_cmd("strobe", &ParamMap::new()).await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("unknown action: strobe"));
        assert_eq!(led.core.state, ModuleState::Running);
        assert_eq!(led.core.fields, before);
    }
}
