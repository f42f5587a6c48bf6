//! Command envelope: the canonical request shape on every command topic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ack::{Ack, AckCode};
use crate::time::now_iso;

/// Free-form parameter object carried by envelopes and acks.
pub type ParamMap = serde_json::Map<String, Value>;

/// `req_id` used when the original one cannot be recovered from a payload.
pub const UNKNOWN_REQ_ID: &str = "?";

/// Actor assumed when a client omits one.
pub const DEFAULT_ACTOR: &str = "app";

fn default_actor() -> String {
    DEFAULT_ACTOR.to_string()
}

/// A command request.
///
/// `ttl_s` is carried for wire compatibility only. Nothing in this workspace
/// enforces it: a command delivered after its TTL still executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub req_id: String,
    #[serde(default = "default_actor")]
    pub actor: String,
    #[serde(rename = "ts", default = "now_iso")]
    pub timestamp: String,
    pub action: String,
    #[serde(default)]
    pub params: ParamMap,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub ttl_s: Option<u64>,
}

impl Envelope {
    /// Create an envelope with a fresh `req_id` and the current timestamp.
    pub fn new(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            req_id: uuid::Uuid::new_v4().to_string(),
            actor: actor.into(),
            timestamp: now_iso(),
            action: action.into(),
            params: ParamMap::new(),
            reply_to: None,
            ttl_s: None,
        }
    }

    pub fn with_params(mut self, params: ParamMap) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Keep a caller-supplied request id instead of the generated one.
    ///
    /// Empty ids are ignored so the envelope always stays valid.
    pub fn with_req_id(mut self, req_id: impl Into<String>) -> Self {
        let req_id = req_id.into();
        if !req_id.is_empty() {
            self.req_id = req_id;
        }
        self
    }

    pub fn with_reply_to(mut self, topic: impl Into<String>) -> Self {
        self.reply_to = Some(topic.into());
        self
    }

    pub fn with_ttl(mut self, ttl_s: u64) -> Self {
        self.ttl_s = Some(ttl_s);
        self
    }

    /// String parameter lookup; non-string values are treated as absent.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Serialize to the compact wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        // A struct of strings and JSON values always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Why an inbound payload was rejected before reaching a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The payload is not parseable JSON.
    #[error("bad json: {reason}")]
    BadJson { reason: String },

    /// JSON, but not a valid envelope.
    #[error("{reason}")]
    BadRequest {
        req_id: String,
        action: Option<String>,
        actor: Option<String>,
        reason: String,
    },
}

impl ProtocolError {
    pub fn code(&self) -> AckCode {
        match self {
            Self::BadJson { .. } => AckCode::BadJson,
            Self::BadRequest { .. } => AckCode::BadRequest,
        }
    }

    /// Best-effort request id recovered from the rejected payload.
    pub fn req_id(&self) -> &str {
        match self {
            Self::BadJson { .. } => UNKNOWN_REQ_ID,
            Self::BadRequest { req_id, .. } => req_id,
        }
    }

    /// The failure ack answering the rejected payload.
    pub fn to_ack(&self) -> Ack {
        let ack = Ack::failure(self.req_id(), self.code(), self.to_string());
        match self {
            Self::BadJson { .. } => ack,
            Self::BadRequest { action, actor, .. } => {
                let ack = match action {
                    Some(action) => ack.with_action(action.clone()),
                    None => ack,
                };
                match actor {
                    Some(actor) => ack.with_actor(actor.clone()),
                    None => ack,
                }
            }
        }
    }
}

/// Parse a raw payload and validate it as an envelope.
///
/// Unparseable bytes yield [`ProtocolError::BadJson`]; parseable documents with
/// missing or malformed envelope fields yield [`ProtocolError::BadRequest`]
/// carrying whatever `req_id` could be recovered.
pub fn parse_envelope(payload: &[u8]) -> Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_slice(payload).map_err(|e| ProtocolError::BadJson {
        reason: e.to_string(),
    })?;
    envelope_from_value(value)
}

/// Validate an already-parsed document as an envelope.
pub fn envelope_from_value(value: Value) -> Result<Envelope, ProtocolError> {
    let Value::Object(mut doc) = value else {
        return Err(ProtocolError::BadRequest {
            req_id: UNKNOWN_REQ_ID.to_string(),
            action: None,
            actor: None,
            reason: "payload must be a JSON object".to_string(),
        });
    };

    let recovered_req_id = doc
        .get("req_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_REQ_ID)
        .to_string();
    let recovered_action = doc
        .get("action")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let recovered_actor = doc.get("actor").and_then(Value::as_str).map(str::to_string);

    let bad = |reason: &str| ProtocolError::BadRequest {
        req_id: recovered_req_id.clone(),
        action: recovered_action.clone(),
        actor: recovered_actor.clone(),
        reason: reason.to_string(),
    };

    if recovered_req_id == UNKNOWN_REQ_ID {
        return Err(bad("missing or empty req_id"));
    }
    let Some(action) = recovered_action.clone() else {
        return Err(bad("missing or empty action"));
    };

    let params = match doc.remove("params") {
        None | Some(Value::Null) => ParamMap::new(),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(bad("params must be an object")),
    };
    let actor = match doc.remove("actor") {
        None | Some(Value::Null) => default_actor(),
        Some(Value::String(actor)) => actor,
        Some(_) => return Err(bad("actor must be a string")),
    };
    let timestamp = match doc.remove("ts") {
        None | Some(Value::Null) => now_iso(),
        Some(Value::String(ts)) => ts,
        Some(_) => return Err(bad("ts must be a string")),
    };
    let reply_to = match doc.remove("reply_to") {
        None | Some(Value::Null) => None,
        Some(Value::String(topic)) => Some(topic),
        Some(_) => return Err(bad("reply_to must be a string")),
    };
    let ttl_s = match doc.remove("ttl_s") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_u64() {
            Some(ttl) => Some(ttl),
            None => return Err(bad("ttl_s must be a non-negative integer")),
        },
    };

    Ok(Envelope {
        req_id: recovered_req_id,
        actor,
        timestamp,
        action,
        params,
        reply_to,
        ttl_s,
    })
}
