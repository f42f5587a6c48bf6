//! Orchestrator configuration file.
//!
//! ```toml
//! [mqtt]
//! host = "broker.lab"
//!
//! [logging]
//! filter = "lab_orchestrator=debug"
//!
//! [[plugins]]
//! module = "ndi"
//! [plugins.settings]
//! sources = ["CAM 1", "CAM 2"]
//!
//! [[plugins]]
//! module = "led"
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use lab_bus::MqttSettings;
use lab_common::{ModuleKind, ParamMap};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::plugin::PluginSettings;

/// Client id used when `[mqtt]` does not set one.
pub const DEFAULT_CLIENT_ID: &str = "orchestrator-host";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingSettings {
    /// Filter directive; `RUST_LOG` and the built-in default apply when unset.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub module: ModuleKind,
    #[serde(default)]
    pub settings: ParamMap,
}

impl PluginConfig {
    pub fn settings(&self) -> Result<PluginSettings> {
        serde_json::from_value(serde_json::Value::Object(self.settings.clone())).map_err(|e| {
            Error::config(format!("invalid settings for plugin {}: {e}", self.module))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default = "default_plugins")]
    pub plugins: Vec<PluginConfig>,
}

fn default_plugins() -> Vec<PluginConfig> {
    [ModuleKind::Led, ModuleKind::Ndi]
        .into_iter()
        .map(|module| PluginConfig {
            module,
            settings: ParamMap::new(),
        })
        .collect()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttSettings::default(),
            logging: LoggingSettings::default(),
            plugins: default_plugins(),
        }
    }
}

impl OrchestratorConfig {
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
        let mut seen = BTreeSet::new();
        for plugin in &self.plugins {
            if !seen.insert(plugin.module) {
                return Err(Error::config(format!("duplicate plugin: {}", plugin.module)));
            }
            plugin.settings()?;
        }
        Ok(())
    }
}
