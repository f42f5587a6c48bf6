//! The device agent: owns the modules of one device and connects them to the bus.

mod dispatch;
mod heartbeat;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use lab_bus::{BusAdapter, ConnectHook, MessageHandler, Outgoing, SubscriptionId};
use lab_common::panic::payload_message;
use lab_common::topics::{self, parse_module_topic};
use lab_common::{Ack, ModuleKind, ParamMap, now_iso};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, ModuleSet};
use crate::error::Result;
use crate::modules::{DeviceModule, SpawnContext, create_module};

/// Version reported in the meta document.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest accepted module config patch, serialized.
pub const MAX_CFG_BYTES: usize = 16 * 1024;

/// Time given to the offline publish to leave before disconnecting.
const OFFLINE_FLUSH_DELAY: Duration = Duration::from_millis(200);

/// `{"online","ts","device_id"}`
pub fn liveness_document(device_id: &str, online: bool) -> Value {
    json!({
        "online": online,
        "ts": now_iso(),
        "device_id": device_id,
    })
}

/// Offline liveness document registered with the broker at connect time.
pub fn last_will(device_id: &str) -> Outgoing {
    let payload = serde_json::to_vec(&liveness_document(device_id, false)).unwrap_or_default();
    Outgoing::new(topics::device_status(device_id), payload).retained()
}

struct ModuleSlot {
    module: Box<dyn DeviceModule>,
    subscription: Option<SubscriptionId>,
}

struct AgentState {
    labels: Vec<String>,
    feature: Option<String>,
    modules: BTreeMap<ModuleKind, ModuleSlot>,
}

/// Shared agent internals. Registered with the bus as both message handler
/// and connect hook.
pub(crate) struct AgentCore {
    device_id: String,
    bus: Arc<BusAdapter>,
    context: Arc<SpawnContext>,
    features: BTreeMap<String, ModuleSet>,
    state: Mutex<AgentState>,
    this: Weak<AgentCore>,
}

pub struct Agent {
    core: Arc<AgentCore>,
    heartbeat_interval: Duration,
    heartbeat: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    shutting_down: AtomicBool,
}

impl Agent {
    /// Instantiate the configured modules. Nothing touches the bus until [`start`](Self::start).
    pub fn new(config: &AgentConfig, bus: Arc<BusAdapter>) -> Self {
        let context = Arc::new(SpawnContext::new(config.env.clone()));
        let modules = config
            .initial_modules()
            .into_iter()
            .map(|(kind, cfg)| {
                let module = create_module(kind, &config.device_id, cfg, Arc::clone(&context));
                (
                    kind,
                    ModuleSlot {
                        module,
                        subscription: None,
                    },
                )
            })
            .collect();

        let core = Arc::new_cyclic(|this| AgentCore {
            device_id: config.device_id.clone(),
            bus,
            context,
            features: config.features.clone(),
            state: Mutex::new(AgentState {
                labels: config.labels.clone(),
                feature: config.feature.clone(),
                modules,
            }),
            this: this.clone(),
        });

        Self {
            core,
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat: parking_lot::Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.core.device_id
    }

    /// Subscribe to the device and module topics and start the heartbeat.
    ///
    /// Announcements happen from the connect hook, on every (re)connection.
    pub async fn start(&self) -> Result<()> {
        let core = &self.core;
        core.bus.add_connect_hook(Arc::clone(core) as Arc<dyn ConnectHook>);
        core.bus
            .subscribe(
                vec![topics::device_cmd(&core.device_id)],
                Arc::clone(core) as Arc<dyn MessageHandler>,
            )
            .await?;

        {
            let mut state = core.state.lock().await;
            for (kind, slot) in state.modules.iter_mut() {
                slot.subscription = core.subscribe_module(*kind).await;
            }
        }

        let cancel = CancellationToken::new();
        let handle = heartbeat::spawn_heartbeat(
            Arc::clone(&core.bus),
            core.device_id.clone(),
            self.heartbeat_interval,
            cancel.clone(),
        );
        *self.heartbeat.lock() = Some((cancel, handle));

        info!(device_id = %core.device_id, "Agent started");
        Ok(())
    }

    /// Names of the modules currently hosted.
    pub async fn module_names(&self) -> Vec<String> {
        let state = self.core.state.lock().await;
        state.modules.keys().map(|k| k.to_string()).collect()
    }

    /// Current module configuration, if the module is hosted.
    pub async fn module_config(&self, kind: ModuleKind) -> Option<ParamMap> {
        let state = self.core.state.lock().await;
        state.modules.get(&kind).map(|slot| slot.module.config().clone())
    }

    /// Stop the heartbeat, announce offline, release module resources and
    /// disconnect. Safe to call more than once and concurrently with a
    /// heartbeat tick; only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let core = &self.core;
        info!(device_id = %core.device_id, "Agent shutting down");

        let heartbeat = self.heartbeat.lock().take();
        if let Some((cancel, handle)) = heartbeat {
            cancel.cancel();
            let _ = handle.await;
        }

        core.publish_liveness(false).await;
        tokio::time::sleep(OFFLINE_FLUSH_DELAY).await;

        {
            let mut state = core.state.lock().await;
            for (kind, slot) in state.modules.iter_mut() {
                shutdown_module(*kind, slot.module.as_mut()).await;
            }
        }

        if let Err(e) = core.bus.disconnect().await {
            warn!(device_id = %core.device_id, error = %e, "Disconnect failed");
        }
    }
}

/// Run a module's shutdown hook, containing any panic.
async fn shutdown_module(kind: ModuleKind, module: &mut dyn DeviceModule) {
    if let Err(panic) = std::panic::AssertUnwindSafe(module.shutdown())
        .catch_unwind()
        .await
    {
        warn!(module = %kind, panic = %payload_message(panic.as_ref()), "Module shutdown panicked");
    }
}

impl AgentCore {
    fn as_handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.this
            .upgrade()
            .map(|core| core as Arc<dyn MessageHandler>)
    }

    async fn subscribe_module(&self, kind: ModuleKind) -> Option<SubscriptionId> {
        let handler = self.as_handler()?;
        let name = kind.as_str();
        let filters = vec![
            topics::module_cmd(&self.device_id, name),
            topics::module_cfg(&self.device_id, name),
        ];
        match self.bus.subscribe(filters, handler).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(device_id = %self.device_id, module = %kind, error = %e, "Failed to subscribe module topics");
                None
            }
        }
    }

    async fn unsubscribe_module(&self, kind: ModuleKind, subscription: Option<SubscriptionId>) {
        let Some(id) = subscription else {
            return;
        };
        if let Err(e) = self.bus.unsubscribe(id).await {
            warn!(device_id = %self.device_id, module = %kind, error = %e, "Failed to unsubscribe module topics");
        }
    }

    async fn publish_json(&self, topic: &str, payload: &impl serde::Serialize, retain: bool) {
        if let Err(e) = self.bus.publish_json(topic, payload, retain).await {
            warn!(device_id = %self.device_id, topic = %topic, error = %e, "Publish failed");
        }
    }

    async fn publish_ack(&self, topic: &str, ack: &Ack) {
        debug!(topic = %topic, req_id = %ack.req_id, code = %ack.code, "Publishing ack");
        self.publish_json(topic, ack, false).await;
    }

    async fn publish_liveness(&self, online: bool) {
        let doc = liveness_document(&self.device_id, online);
        self.publish_json(&topics::device_status(&self.device_id), &doc, true)
            .await;
    }

    fn meta_document(&self, state: &AgentState) -> Value {
        let capabilities: ParamMap = state
            .modules
            .iter()
            .map(|(kind, slot)| (kind.to_string(), Value::Object(slot.module.config().clone())))
            .collect();
        json!({
            "device_id": self.device_id,
            "modules": state.modules.keys().map(|k| k.to_string()).collect::<Vec<_>>(),
            "capabilities": capabilities,
            "labels": state.labels,
            "feature": state.feature,
            "version": AGENT_VERSION,
            "ts": now_iso(),
        })
    }

    async fn publish_meta(&self, state: &AgentState) {
        let meta = self.meta_document(state);
        self.publish_json(&topics::device_meta(&self.device_id), &meta, true)
            .await;
    }

    async fn publish_module_status(&self, kind: ModuleKind, module: &dyn DeviceModule) {
        let status = module.status_payload();
        self.publish_json(
            &topics::module_status(&self.device_id, kind.as_str()),
            &status,
            true,
        )
        .await;
    }

    /// Birth sequence run on every (re)connection.
    async fn announce(&self) {
        let mut state = self.state.lock().await;
        self.publish_meta(&state).await;
        self.publish_liveness(true).await;
        for (kind, slot) in state.modules.iter_mut() {
            if let Err(panic) = std::panic::AssertUnwindSafe(slot.module.on_agent_connect())
                .catch_unwind()
                .await
            {
                warn!(module = %kind, panic = %payload_message(panic.as_ref()), "Module connect hook panicked");
            }
            self.publish_module_status(*kind, slot.module.as_ref()).await;
        }
        info!(device_id = %self.device_id, modules = state.modules.len(), "Announced device");
    }
}

#[async_trait]
impl ConnectHook for AgentCore {
    async fn on_connect(&self) {
        self.announce().await;
    }
}

#[async_trait]
impl MessageHandler for AgentCore {
    async fn on_message(&self, topic: &str, payload: &[u8]) {
        if topic == topics::device_cmd(&self.device_id) {
            self.handle_device_message(payload).await;
            return;
        }

        let Some(parsed) = parse_module_topic(topic).filter(|t| t.device_id == self.device_id)
        else {
            debug!(topic = %topic, "Ignoring message outside this device's namespace");
            return;
        };
        let Ok(kind) = ModuleKind::from_str(parsed.module) else {
            debug!(topic = %topic, "Ignoring message for unknown module kind");
            return;
        };
        match parsed.leaf {
            "cmd" => self.handle_module_cmd(kind, payload).await,
            "cfg" => self.handle_module_cfg(kind, payload).await,
            _ => debug!(topic = %topic, "Ignoring message on unhandled module topic"),
        }
    }
}
