//! Per-module command routing on the orchestrator side.
//!
//! One [`Plugin`] per module kind owns `/lab/orchestrator/{module}/cmd`.
//! Module actions are forwarded verbatim to the addressed device; `reserve`,
//! `release` and `schedule` are served by the host.

mod request;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use lab_bus::{BusAdapter, BusError, MessageHandler, Outgoing};
use lab_common::time::format_iso;
use lab_common::{Ack, AckCode, Envelope, ModuleKind, ParamMap, lease_key, parse_envelope, topics};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::registry::Registry;
use crate::scheduler::{JobInfo, Scheduler};

pub use request::DEFAULT_LEASE_S;

/// Actor recorded on commands sent through [`Plugin::send`].
pub const API_ACTOR: &str = "api";

/// Services shared by every plugin.
pub struct PluginContext {
    pub bus: Arc<BusAdapter>,
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    modules: Vec<String>,
}

impl PluginContext {
    pub fn new(
        bus: Arc<BusAdapter>,
        registry: Arc<Registry>,
        scheduler: Arc<Scheduler>,
        modules: Vec<String>,
    ) -> Self {
        Self {
            bus,
            registry,
            scheduler,
            modules,
        }
    }

    /// Names of the loaded plugins.
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    pub fn snapshot(&self) -> Value {
        self.registry.snapshot(&self.modules)
    }

    /// Publish the retained registry snapshot.
    pub async fn publish_registry(&self) {
        let snapshot = self.snapshot();
        if let Err(e) = self.bus.publish_json(topics::REGISTRY, &snapshot, true).await {
            warn!(error = %e, "Failed to publish registry snapshot");
        }
    }
}

/// Plugin settings from the `[[plugins]]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Known capture sources. When non-empty, [`Plugin::send`] only accepts these.
    pub sources: Vec<String>,
}

/// Live source discovery. The configured list is used whenever discovery
/// fails or finds nothing.
#[async_trait]
pub trait SourceDiscovery: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<String>>;
}

/// Discovery that never finds anything.
pub struct NoDiscovery;

#[async_trait]
impl SourceDiscovery for NoDiscovery {
    async fn discover(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A device carrying the plugin's module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub online: bool,
    pub capabilities: Value,
}

/// Capability summary for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub module: ModuleKind,
    pub devices: BTreeMap<String, DeviceSummary>,
    pub locks: Value,
    pub jobs: Vec<JobInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
}

pub struct Plugin {
    kind: ModuleKind,
    settings: PluginSettings,
    ctx: Arc<PluginContext>,
    discovery: Arc<dyn SourceDiscovery>,
}

impl Plugin {
    pub fn new(
        kind: ModuleKind,
        settings: PluginSettings,
        ctx: Arc<PluginContext>,
        discovery: Arc<dyn SourceDiscovery>,
    ) -> Self {
        Self {
            kind,
            settings,
            ctx,
            discovery,
        }
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn command_topic(&self) -> String {
        topics::orch_cmd(self.kind.as_str())
    }

    pub fn event_topic(&self) -> String {
        topics::orch_evt(self.kind.as_str())
    }

    /// Handle one payload from the command topic and return its ack.
    pub async fn handle_request(&self, payload: &[u8]) -> Ack {
        let envelope = match parse_envelope(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(module = %self.kind, error = %e, "Rejected orchestrator command");
                return e.to_ack();
            }
        };
        self.route(&envelope, payload)
            .await
            .with_action(envelope.action.as_str())
            .with_actor(envelope.actor.as_str())
    }

    async fn route(&self, envelope: &Envelope, raw: &[u8]) -> Ack {
        let action = envelope.action.as_str();
        if self.kind.is_passthrough(action) {
            return self.passthrough(envelope, raw).await;
        }
        match action {
            "reserve" => self.reserve(envelope).await,
            "release" => self.release(envelope).await,
            "schedule" => self.schedule(envelope),
            other => Ack::failure(
                &envelope.req_id,
                AckCode::BadAction,
                format!("Unsupported action: {other}"),
            ),
        }
    }

    /// Forward the original payload unchanged. The device acks separately on
    /// its own event topic.
    async fn passthrough(&self, envelope: &Envelope, raw: &[u8]) -> Ack {
        let device_id = match request::device_id(&envelope.params) {
            Ok(id) => id,
            Err(e) => return Ack::failure(&envelope.req_id, AckCode::BadRequest, e),
        };
        let topic = topics::module_cmd(device_id, self.kind.as_str());
        if let Err(e) = self.ctx.bus.publish(Outgoing::new(topic.as_str(), raw.to_vec())).await {
            warn!(topic = %topic, error = %e, "Failed to forward command");
            return Ack::failure(&envelope.req_id, AckCode::Exception, e.to_string());
        }
        debug!(topic = %topic, req_id = %envelope.req_id, action = %envelope.action, "Forwarded command");
        Ack::success(&envelope.req_id, AckCode::Dispatched).with_detail("device_id", device_id)
    }

    async fn reserve(&self, envelope: &Envelope) -> Ack {
        let req_id = envelope.req_id.as_str();
        let device_id = match request::device_id(&envelope.params) {
            Ok(id) => id,
            Err(e) => return Ack::failure(req_id, AckCode::BadRequest, e),
        };
        let ttl = match request::lease_duration(&envelope.params) {
            Ok(ttl) => ttl,
            Err(e) => return Ack::failure(req_id, AckCode::BadRequest, e),
        };

        let key = lease_key(self.kind.as_str(), device_id);
        match self.ctx.registry.lock(&key, &envelope.actor, ttl) {
            Ok(lease) => {
                info!(key = %key, holder = %lease.holder, ttl_s = ttl.as_secs(), "Lease granted");
                self.ctx.publish_registry().await;
                Ack::success(req_id, AckCode::Ok)
                    .with_detail("key", key)
                    .with_detail("holder", lease.holder)
                    .with_detail("exp", format_iso(lease.expires_at))
            }
            Err(e) => {
                debug!(key = %key, actor = %envelope.actor, error = %e, "Lease refused");
                let mut ack = Ack::failure(req_id, e.code(), e.to_string()).with_detail("key", key);
                if let crate::registry::LeaseError::InUse { holder } = e {
                    ack = ack.with_detail("holder", holder);
                }
                ack
            }
        }
    }

    async fn release(&self, envelope: &Envelope) -> Ack {
        let req_id = envelope.req_id.as_str();
        let device_id = match request::device_id(&envelope.params) {
            Ok(id) => id,
            Err(e) => return Ack::failure(req_id, AckCode::BadRequest, e),
        };

        let key = lease_key(self.kind.as_str(), device_id);
        match self.ctx.registry.release(&key, &envelope.actor) {
            Ok(()) => {
                info!(key = %key, holder = %envelope.actor, "Lease released");
                self.ctx.publish_registry().await;
                Ack::success(req_id, AckCode::Ok).with_detail("key", key)
            }
            Err(e) => Ack::failure(req_id, e.code(), e.to_string()).with_detail("key", key),
        }
    }

    fn schedule(&self, envelope: &Envelope) -> Ack {
        let spec = match request::job_spec(self.kind, &envelope.actor, &envelope.params) {
            Ok(spec) => spec,
            Err(e) => return Ack::failure(&envelope.req_id, AckCode::BadRequest, e.to_string()),
        };
        let trigger = spec.trigger.to_string();
        let (id, next) = self.ctx.scheduler.schedule(spec);
        Ack::success(&envelope.req_id, AckCode::Scheduled)
            .with_detail("job_id", id.to_string())
            .with_detail("trigger", trigger)
            .with_detail("next_run", next.map(format_iso))
    }

    /// Devices announcing this module, the lease map, pending jobs and, for
    /// capture plugins, the selectable sources.
    pub async fn status(&self) -> PluginStatus {
        let name = self.kind.as_str();
        let devices = self
            .ctx
            .registry
            .devices()
            .into_iter()
            .filter(|(_, doc)| {
                doc.get("modules")
                    .and_then(Value::as_array)
                    .is_some_and(|modules| modules.iter().any(|m| m == name))
            })
            .map(|(device_id, doc)| {
                let summary = DeviceSummary {
                    device_id: device_id.clone(),
                    online: doc.get("online").and_then(Value::as_bool).unwrap_or(true),
                    capabilities: doc
                        .get("capabilities")
                        .and_then(|caps| caps.get(name))
                        .cloned()
                        .unwrap_or_else(|| json!({})),
                };
                (device_id, summary)
            })
            .collect();

        let jobs = self
            .ctx
            .scheduler
            .list()
            .into_iter()
            .filter(|job| job.module == self.kind)
            .collect();
        let sources = match self.kind {
            ModuleKind::Ndi => Some(self.sources().await),
            ModuleKind::Led => None,
        };

        PluginStatus {
            module: self.kind,
            devices,
            locks: self.ctx.registry.locks_document(),
            jobs,
            sources,
        }
    }

    /// Discovered sources, or the configured list when discovery comes up empty.
    pub async fn sources(&self) -> Vec<String> {
        match self.discovery.discover().await {
            Ok(found) if !found.is_empty() => found,
            Ok(_) => self.settings.sources.clone(),
            Err(e) => {
                debug!(module = %self.kind, error = %e, "Source discovery failed, using configured list");
                self.settings.sources.clone()
            }
        }
    }

    /// Send a module command to a known device on behalf of the presentation layer.
    pub async fn send(
        &self,
        device_id: &str,
        action: &str,
        params: ParamMap,
    ) -> Result<Envelope, SendError> {
        if !self.kind.is_passthrough(action) {
            return Err(SendError::UnsupportedAction(action.to_string()));
        }
        if !self.settings.sources.is_empty() {
            if let Some(source) = params.get("source").and_then(Value::as_str) {
                if !self.settings.sources.iter().any(|s| s == source) {
                    return Err(SendError::UnknownSource(source.to_string()));
                }
            }
        }
        if !self.ctx.registry.contains_device(device_id) {
            return Err(SendError::UnknownDevice(device_id.to_string()));
        }

        let envelope = Envelope::new(API_ACTOR, action)
            .with_params(params)
            .with_param("device_id", device_id);
        let topic = topics::module_cmd(device_id, self.kind.as_str());
        self.ctx
            .bus
            .publish(Outgoing::new(topic.as_str(), envelope.to_bytes()))
            .await?;
        info!(topic = %topic, req_id = %envelope.req_id, action = %action, "Command sent");
        Ok(envelope)
    }
}

#[async_trait]
impl MessageHandler for Plugin {
    async fn on_message(&self, _topic: &str, payload: &[u8]) {
        let ack = self.handle_request(payload).await;
        let evt = self.event_topic();
        debug!(topic = %evt, req_id = %ack.req_id, code = %ack.code, "Publishing ack");
        if let Err(e) = self.ctx.bus.publish_json(&evt, &ack, false).await {
            warn!(topic = %evt, error = %e, "Failed to publish ack");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_bus::MemoryTransport;
    use serde_json::json;

    struct Fixture {
        transport: Arc<MemoryTransport>,
        ctx: Arc<PluginContext>,
    }

    fn fixture() -> Fixture {
        let (transport, _events) = MemoryTransport::new();
        let transport = Arc::new(transport);
        let bus = Arc::new(BusAdapter::new(transport.clone()));
        let registry = Arc::new(Registry::new());
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&bus), Arc::clone(&registry)));
        let ctx = Arc::new(PluginContext::new(
            bus,
            registry,
            scheduler,
            vec!["led".into(), "ndi".into()],
        ));
        Fixture { transport, ctx }
    }

    fn plugin(fx: &Fixture, kind: ModuleKind, settings: PluginSettings) -> Plugin {
        Plugin::new(kind, settings, Arc::clone(&fx.ctx), Arc::new(NoDiscovery))
    }

    fn request(actor: &str, action: &str, params: Value) -> Vec<u8> {
        Envelope::new(actor, action)
            .with_params(params.as_object().cloned().unwrap_or_default())
            .to_bytes()
    }

    #[tokio::test]
    async fn test_passthrough_forwards_verbatim() {
        let fx = fixture();
        let ndi = plugin(&fx, ModuleKind::Ndi, PluginSettings::default());
        let payload = request("alice", "start", json!({"device_id": "dev1", "source": "CAM"}));

        let ack = ndi.handle_request(&payload).await;
        assert!(ack.ok);
        assert_eq!(ack.code, AckCode::Dispatched);
        let forwarded = fx.transport.published_to(&topics::module_cmd("dev1", "ndi"));
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].payload, payload);
    }

    #[tokio::test]
    async fn test_passthrough_needs_device() {
        let fx = fixture();
        let led = plugin(&fx, ModuleKind::Led, PluginSettings::default());
        let ack = led.handle_request(&request("alice", "solid", json!({}))).await;
        assert_eq!(ack.code, AckCode::BadRequest);
        assert_eq!(ack.error.as_deref(), Some("missing device_id"));
    }

    #[tokio::test]
    async fn test_other_module_actions_are_bad_actions() {
        let fx = fixture();
        let led = plugin(&fx, ModuleKind::Led, PluginSettings::default());
        let ack = led
            .handle_request(&request("alice", "start", json!({"device_id": "dev1"})))
            .await;
        assert_eq!(ack.code, AckCode::BadAction);
        assert_eq!(ack.error.as_deref(), Some("Unsupported action: start"));
        assert_eq!(ack.action.as_deref(), Some("start"));
    }

    #[tokio::test]
    async fn test_bad_json() {
        let fx = fixture();
        let led = plugin(&fx, ModuleKind::Led, PluginSettings::default());
        let ack = led.handle_request(b"{oops").await;
        assert!(!ack.ok);
        assert_eq!(ack.code, AckCode::BadJson);
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let fx = fixture();
        let ndi = plugin(&fx, ModuleKind::Ndi, PluginSettings::default());
        let params = json!({"device_id": "dev1", "lease_s": 60});

        let ack = ndi.handle_request(&request("alice", "reserve", params.clone())).await;
        assert_eq!(ack.code, AckCode::Ok);
        assert_eq!(ack.details["holder"], "alice");

        let ack = ndi.handle_request(&request("bob", "reserve", params.clone())).await;
        assert_eq!(ack.code, AckCode::InUse);
        assert_eq!(ack.details["holder"], "alice");

        let ack = ndi.handle_request(&request("bob", "release", params.clone())).await;
        assert_eq!(ack.code, AckCode::NotOwner);

        let ack = ndi.handle_request(&request("alice", "release", params.clone())).await;
        assert_eq!(ack.code, AckCode::Ok);

        let ack = ndi.handle_request(&request("bob", "reserve", params)).await;
        assert_eq!(ack.code, AckCode::Ok);

        let snapshot: Value =
            serde_json::from_slice(&fx.transport.retained(topics::REGISTRY).unwrap()).unwrap();
        assert_eq!(snapshot["locks"]["ndi:dev1"]["holder"], "bob");
    }

    #[tokio::test]
    async fn test_schedule_acks() {
        let fx = fixture();
        let led = plugin(&fx, ModuleKind::Led, PluginSettings::default());

        let ack = led
            .handle_request(&request(
                "alice",
                "schedule",
                json!({"cron": "0 18 * * *", "commands": [{"device_id": "dev1", "action": "off"}]}),
            ))
            .await;
        assert_eq!(ack.code, AckCode::Scheduled);
        assert!(ack.details["job_id"].is_string());
        assert!(ack.details["next_run"].is_string());
        assert_eq!(fx.ctx.scheduler.list().len(), 1);

        let ack = led
            .handle_request(&request("alice", "schedule", json!({"commands": []})))
            .await;
        assert_eq!(ack.code, AckCode::BadRequest);
        fx.ctx.scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_status_lists_module_devices() {
        let fx = fixture();
        let registry = &fx.ctx.registry;
        for (id, modules) in [("dev1", json!(["ndi"])), ("dev2", json!(["led"]))] {
            registry.update_device(
                json!({
                    "device_id": id,
                    "modules": modules,
                    "capabilities": {"ndi": {"start_cmd_template": "viewer"}},
                })
                .as_object()
                .unwrap(),
            );
        }
        let ndi = plugin(
            &fx,
            ModuleKind::Ndi,
            PluginSettings {
                sources: vec!["CAM 1".into()],
            },
        );

        let status = ndi.status().await;
        assert_eq!(status.devices.len(), 1);
        let dev1 = &status.devices["dev1"];
        assert!(dev1.online);
        assert_eq!(dev1.capabilities["start_cmd_template"], "viewer");
        assert_eq!(status.sources, Some(vec!["CAM 1".to_string()]));
    }

    struct FixedDiscovery(Vec<String>);

    #[async_trait]
    impl SourceDiscovery for FixedDiscovery {
        async fn discover(&self) -> anyhow::Result<Vec<String>> {
            if self.0.is_empty() {
                anyhow::bail!("no finder");
            }
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_sources_prefer_discovery() {
        let fx = fixture();
        let settings = PluginSettings {
            sources: vec!["Fallback".into()],
        };
        let found = Plugin::new(
            ModuleKind::Ndi,
            settings.clone(),
            Arc::clone(&fx.ctx),
            Arc::new(FixedDiscovery(vec!["Live".into()])),
        );
        assert_eq!(found.sources().await, vec!["Live".to_string()]);

        let failing = Plugin::new(
            ModuleKind::Ndi,
            settings,
            Arc::clone(&fx.ctx),
            Arc::new(FixedDiscovery(Vec::new())),
        );
        assert_eq!(failing.sources().await, vec!["Fallback".to_string()]);
    }

    #[tokio::test]
    async fn test_send_validates_target() {
        let fx = fixture();
        let ndi = plugin(
            &fx,
            ModuleKind::Ndi,
            PluginSettings {
                sources: vec!["CAM 1".into()],
            },
        );
        let source = |name: &str| json!({"source": name}).as_object().cloned().unwrap();

        assert!(matches!(
            ndi.send("ghost", "start", source("CAM 1")).await,
            Err(SendError::UnknownDevice(_))
        ));

        fx.ctx
            .registry
            .update_device(json!({"device_id": "dev1"}).as_object().unwrap());
        assert!(matches!(
            ndi.send("dev1", "start", source("CAM 9")).await,
            Err(SendError::UnknownSource(_))
        ));
        assert!(matches!(
            ndi.send("dev1", "reserve", source("CAM 1")).await,
            Err(SendError::UnsupportedAction(_))
        ));

        let envelope = ndi.send("dev1", "start", source("CAM 1")).await.unwrap();
        assert_eq!(envelope.actor, API_ACTOR);
        let sent = fx.transport.published_json(&topics::module_cmd("dev1", "ndi"));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["params"]["device_id"], "dev1");
        assert_eq!(sent[0]["params"]["source"], "CAM 1");
    }
}
