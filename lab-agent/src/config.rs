//! Agent configuration file.
//!
//! ```toml
//! device_id = "dev1"
//! labels = ["stage-left"]
//! heartbeat_interval_s = 10
//! feature = "viewer"
//!
//! [mqtt]
//! host = "broker.lab"
//!
//! [features.viewer.ndi]
//! start_cmd_template = "ndi-viewer --source '{source}'"
//!
//! [modules.led]
//! pin = 18
//!
//! [env]
//! NDI_RUNTIME_DIR = "/opt/ndi"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use lab_bus::MqttSettings;
use lab_common::{ModuleKind, ParamMap, deep_merge};
use serde::Deserialize;

use crate::error::{Error, Result};

fn default_heartbeat_interval_s() -> u64 {
    10
}

/// Module name → module configuration.
pub type ModuleSet = BTreeMap<String, ParamMap>;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub device_id: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,
    #[serde(default)]
    pub mqtt: MqttSettings,
    /// Preset selected at startup.
    #[serde(default)]
    pub feature: Option<String>,
    /// Named module presets that `apply_feature` can switch between.
    #[serde(default)]
    pub features: BTreeMap<String, ModuleSet>,
    /// Explicit module configuration, overlaid on the selected preset.
    #[serde(default)]
    pub modules: ModuleSet,
    /// Environment applied to every helper process spawned by a module.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(Error::config("device_id must not be empty"));
        }
        if self.device_id.contains(['/', '+', '#']) {
            return Err(Error::config(format!(
                "device_id {:?} contains topic metacharacters",
                self.device_id
            )));
        }
        if self.heartbeat_interval_s == 0 {
            return Err(Error::config("heartbeat_interval_s must be positive"));
        }
        check_module_names("modules", &self.modules)?;
        for (name, preset) in &self.features {
            check_module_names(&format!("features.{name}"), preset)?;
        }
        if let Some(feature) = &self.feature {
            if !self.features.contains_key(feature) {
                return Err(Error::config(format!("unknown feature: {feature}")));
            }
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    pub fn client_id(&self) -> String {
        format!("device-{}", self.device_id)
    }

    /// Modules to instantiate at startup: the selected preset, with explicit
    /// `[modules]` entries deep-merged over it.
    pub fn initial_modules(&self) -> BTreeMap<ModuleKind, ParamMap> {
        let mut selected: BTreeMap<ModuleKind, ParamMap> = BTreeMap::new();
        let preset = self
            .feature
            .as_ref()
            .and_then(|name| self.features.get(name))
            .into_iter()
            .flatten();
        for (name, cfg) in preset.chain(&self.modules) {
            // Names were checked in validate().
            let Ok(kind) = ModuleKind::from_str(name) else {
                continue;
            };
            deep_merge(selected.entry(kind).or_default(), cfg);
        }
        selected
    }
}

fn check_module_names(section: &str, modules: &ModuleSet) -> Result<()> {
    for name in modules.keys() {
        if ModuleKind::from_str(name).is_err() {
            return Err(Error::config(format!("unknown module in {section}: {name}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"
device_id = "dev1"
labels = ["stage-left"]
feature = "viewer"

[mqtt]
host = "broker.lab"
username = "lab"
password = "secret"

[features.viewer.ndi]
start_cmd_template = "ndi-viewer --source '{source}'"
probe_delay_ms = 300

[features.lights.led]
pin = 18

[modules.ndi]
probe_delay_ms = 50

[env]
NDI_RUNTIME_DIR = "/opt/ndi"
"#;

    #[test]
    fn test_parse_sample() {
        let config = AgentConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.device_id, "dev1");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.username.as_deref(), Some("lab"));
        assert_eq!(config.client_id(), "device-dev1");
        assert_eq!(config.env["NDI_RUNTIME_DIR"], "/opt/ndi");
    }

    #[test]
    fn test_explicit_modules_overlay_preset() {
        let config = AgentConfig::from_toml_str(SAMPLE).unwrap();
        let modules = config.initial_modules();
        assert_eq!(modules.len(), 1);
        let ndi = &modules[&ModuleKind::Ndi];
        assert_eq!(ndi["probe_delay_ms"], json!(50));
        assert_eq!(
            ndi["start_cmd_template"],
            json!("ndi-viewer --source '{source}'")
        );
    }

    #[test]
    fn test_rejects_unknown_module() {
        let raw = "device_id = \"dev1\"\n[modules.laser]\npower = 1\n";
        let err = AgentConfig::from_toml_str(raw).unwrap_err();
        assert!(err.to_string().contains("unknown module in modules: laser"));
    }

    #[test]
    fn test_rejects_unknown_selected_feature() {
        let raw = "device_id = \"dev1\"\nfeature = \"missing\"\n";
        assert!(AgentConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_rejects_empty_device_id() {
        assert!(AgentConfig::from_toml_str("device_id = \"  \"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.features.len(), 2);

        let missing = AgentConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, Error::ConfigRead { .. }));
    }
}
