//! Acknowledgements: exactly one per accepted request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::ParamMap;
use crate::time::now_iso;

/// Ack protocol version.
pub const ACK_VERSION: u8 = 1;

/// Symbolic outcome of a request.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AckCode {
    Ok,
    DeviceError,
    ModuleError,
    BadAction,
    BadRequest,
    BadJson,
    Exception,
    InUse,
    NotOwner,
    Dispatched,
    Scheduled,
}

impl AckCode {
    /// Codes that accompany `ok = true`.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Dispatched | Self::Scheduled)
    }
}

/// Reply to an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default = "ack_version")]
    pub v: u8,
    pub req_id: String,
    pub ok: bool,
    pub code: AckCode,
    pub error: Option<String>,
    #[serde(default)]
    pub details: ParamMap,
    #[serde(rename = "ts")]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

fn ack_version() -> u8 {
    ACK_VERSION
}

impl Ack {
    /// A successful ack.
    pub fn success(req_id: impl Into<String>, code: AckCode) -> Self {
        Self::build(req_id.into(), true, code, None)
    }

    /// A failed ack. The error string is mandatory so every failure explains itself.
    pub fn failure(req_id: impl Into<String>, code: AckCode, error: impl Into<String>) -> Self {
        Self::build(req_id.into(), false, code, Some(error.into()))
    }

    fn build(req_id: String, ok: bool, code: AckCode, error: Option<String>) -> Self {
        Self {
            v: ACK_VERSION,
            req_id,
            ok,
            code,
            error,
            details: ParamMap::new(),
            timestamp: now_iso(),
            action: None,
            actor: None,
        }
    }

    pub fn with_details(mut self, details: ParamMap) -> Self {
        self.details = details;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_code_wire_names() {
        assert_eq!(AckCode::BadJson.to_string(), "BAD_JSON");
        assert_eq!(AckCode::InUse.as_ref(), "IN_USE");
        assert_eq!(AckCode::from_str("NOT_OWNER").unwrap(), AckCode::NotOwner);
        assert_eq!(
            serde_json::to_string(&AckCode::Dispatched).unwrap(),
            "\"DISPATCHED\""
        );
    }

    #[test]
    fn test_failure_always_has_error() {
        let ack = Ack::failure("r-1", AckCode::InUse, "in_use");
        assert!(!ack.ok);
        assert_eq!(ack.error.as_deref(), Some("in_use"));
    }

    #[test]
    fn test_wire_shape() {
        let ack = Ack::success("r-1", AckCode::Ok)
            .with_detail("device_id", "dev1")
            .with_action("ping");
        let value: Value = serde_json::from_slice(&ack.to_bytes()).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["ok"], true);
        assert_eq!(value["code"], "OK");
        assert_eq!(value["error"], Value::Null);
        assert_eq!(value["details"]["device_id"], "dev1");
        assert_eq!(value["action"], "ping");
        assert!(value.get("actor").is_none());
    }
}
