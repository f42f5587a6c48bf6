//! Orchestrator host: wires the registry, scheduler and plugins to the bus.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use lab_bus::{BusAdapter, MessageHandler, Outgoing};
use lab_common::{ModuleKind, ParamMap, topics};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::plugin::{NoDiscovery, Plugin, PluginContext, SourceDiscovery};
use crate::registry::Registry;
use crate::scheduler::Scheduler;

/// Folds device meta and liveness documents into the registry.
struct DeviceTracker {
    ctx: Arc<PluginContext>,
}

#[async_trait]
impl MessageHandler for DeviceTracker {
    async fn on_message(&self, topic: &str, payload: &[u8]) {
        // Cleared retained documents arrive as empty payloads.
        if payload.is_empty() {
            return;
        }
        let document: ParamMap = match serde_json::from_slice(payload) {
            Ok(document) => document,
            Err(e) => {
                debug!(topic = %topic, error = %e, "Ignoring unparseable device document");
                return;
            }
        };
        let Some(device_id) = self.ctx.registry.update_device(&document) else {
            debug!(topic = %topic, "Ignoring device document without device_id");
            return;
        };
        debug!(topic = %topic, device_id = %device_id, "Device updated");
        self.ctx.publish_registry().await;
    }
}

pub struct Host {
    ctx: Arc<PluginContext>,
    plugins: BTreeMap<ModuleKind, Arc<Plugin>>,
}

impl Host {
    pub fn new(config: &OrchestratorConfig, bus: Arc<BusAdapter>) -> Result<Self> {
        Self::with_discovery(config, bus, Arc::new(NoDiscovery))
    }

    pub fn with_discovery(
        config: &OrchestratorConfig,
        bus: Arc<BusAdapter>,
        discovery: Arc<dyn SourceDiscovery>,
    ) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&bus), Arc::clone(&registry)));
        let modules = config.plugins.iter().map(|p| p.module.to_string()).collect();
        let ctx = Arc::new(PluginContext::new(bus, registry, scheduler, modules));

        let mut plugins = BTreeMap::new();
        for plugin in &config.plugins {
            let settings = plugin.settings()?;
            let instance = Plugin::new(
                plugin.module,
                settings,
                Arc::clone(&ctx),
                Arc::clone(&discovery),
            );
            plugins.insert(plugin.module, Arc::new(instance));
        }
        Ok(Self { ctx, plugins })
    }

    /// Subscribe to device announcements and to every plugin's command topic.
    pub async fn start(&self) -> Result<()> {
        let tracker = Arc::new(DeviceTracker {
            ctx: Arc::clone(&self.ctx),
        });
        self.ctx
            .bus
            .subscribe(topics::device_announcement_filters(), tracker)
            .await?;

        for plugin in self.plugins.values() {
            self.ctx
                .bus
                .subscribe(
                    vec![plugin.command_topic()],
                    Arc::clone(plugin) as Arc<dyn MessageHandler>,
                )
                .await?;
            info!(module = %plugin.kind(), topic = %plugin.command_topic(), "Plugin loaded");
        }
        Ok(())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.ctx.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.ctx.scheduler
    }

    pub fn plugin(&self, kind: ModuleKind) -> Option<&Arc<Plugin>> {
        self.plugins.get(&kind)
    }

    pub fn modules(&self) -> &[String] {
        self.ctx.modules()
    }

    /// Current registry snapshot, as published.
    pub fn snapshot(&self) -> serde_json::Value {
        self.ctx.snapshot()
    }

    /// Remove a device and clear its retained meta and liveness documents so
    /// it does not reappear until it announces itself again. Returns whether
    /// the device was known.
    pub async fn purge_device(&self, device_id: &str) -> Result<bool> {
        if !self.ctx.registry.contains_device(device_id) {
            return Ok(false);
        }
        for topic in [topics::device_meta(device_id), topics::device_status(device_id)] {
            self.ctx
                .bus
                .publish(Outgoing::new(topic.as_str(), Vec::new()).retained())
                .await?;
        }
        self.ctx.registry.remove_device(device_id);
        self.ctx.publish_registry().await;
        info!(device_id = %device_id, "Device purged");
        Ok(true)
    }

    /// Cancel scheduled jobs and disconnect.
    pub async fn shutdown(&self) {
        self.ctx.scheduler.shutdown();
        if let Err(e) = self.ctx.bus.disconnect().await {
            warn!(error = %e, "Disconnect failed");
        }
    }
}
