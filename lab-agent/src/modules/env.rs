//! Environment handed to helper processes.

use std::collections::BTreeMap;

use serde_json::Value;

/// Variable set from a plain `ndi_path` value.
const NDI_PATH_VAR: &str = "NDI_PATH";

/// Agent-wide spawn environment, shared by every module of one agent.
///
/// Built once from the agent config and never mutated afterwards; module
/// overrides are layered on top of it per spawn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnContext {
    env: BTreeMap<String, String>,
}

impl SpawnContext {
    pub fn new(env: BTreeMap<String, String>) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Agent environment with `overrides` applied on top.
    pub fn compose(&self, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// Interpret an `ndi_path` setting.
///
/// Either a bare path, which becomes `NDI_PATH`, or a shell-style
/// `export KEY=VALUE` line whose value may be quoted. Malformed export lines
/// yield `None`.
pub fn resolve_ndi_path(raw: &str) -> Option<(String, String)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let Some(assignment) = raw.strip_prefix("export ") else {
        return Some((NDI_PATH_VAR.to_string(), raw.to_string()));
    };
    let (key, value) = assignment.trim().split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value.trim().trim_matches('"').trim_matches('\'');
    Some((key.to_string(), value.to_string()))
}

/// Render an `env` map value the way it should appear in the environment.
pub(crate) fn env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
