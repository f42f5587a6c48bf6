//! Multi-subscriber dispatch over a [`Transport`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::filter::topic_matches;
use crate::transport::{BusEvent, EventReceiver, Outgoing, QoS, Transport};

/// Receives messages for one subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Runs after every (re)connection, before any message of the new session is
/// dispatched.
#[async_trait]
pub trait ConnectHook: Send + Sync {
    async fn on_connect(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    filters: Vec<String>,
    handler: Arc<dyn MessageHandler>,
}

pub struct BusAdapter {
    transport: Arc<dyn Transport>,
    subscriptions: RwLock<Vec<Subscription>>,
    connect_hooks: RwLock<Vec<Arc<dyn ConnectHook>>>,
    next_id: AtomicU64,
}

impl BusAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            subscriptions: RwLock::new(Vec::new()),
            connect_hooks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Register `handler` for every topic matching any of `filters`.
    pub async fn subscribe(
        &self,
        filters: Vec<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription {
            id,
            filters: filters.clone(),
            handler,
        });
        for filter in &filters {
            self.transport.subscribe(filter, QoS::AtLeastOnce).await?;
        }
        debug!(subscription = id.0, filters = ?filters, "Subscribed");
        Ok(id)
    }

    /// Remove a subscription. Broker-side filters still used by another
    /// subscription stay subscribed.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let orphaned: Vec<String> = {
            let mut subscriptions = self.subscriptions.write();
            let Some(index) = subscriptions.iter().position(|s| s.id == id) else {
                return Ok(());
            };
            let removed = subscriptions.remove(index);
            removed
                .filters
                .into_iter()
                .filter(|filter| !subscriptions.iter().any(|s| s.filters.contains(filter)))
                .collect()
        };
        for filter in &orphaned {
            self.transport.unsubscribe(filter).await?;
        }
        debug!(subscription = id.0, "Unsubscribed");
        Ok(())
    }

    pub fn add_connect_hook(&self, hook: Arc<dyn ConnectHook>) {
        self.connect_hooks.write().push(hook);
    }

    pub async fn publish(&self, message: Outgoing) -> Result<()> {
        trace!(topic = %message.topic, retain = message.retain, "Publishing");
        self.transport.publish(message).await
    }

    /// Serialize `payload` as compact JSON and publish it at least once.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        retain: bool,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        let mut message = Outgoing::new(topic, bytes);
        message.retain = retain;
        self.publish(message).await
    }

    /// Deliver one message to every subscription with a matching filter, in
    /// registration order. A subscription is invoked at most once per message
    /// even when several of its filters match.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.filters.iter().any(|f| topic_matches(f, topic)))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        if handlers.is_empty() {
            trace!(topic = %topic, "No subscriber for message");
            return;
        }
        for handler in handlers {
            handler.on_message(topic, payload).await;
        }
    }

    async fn connected(&self) {
        let hooks: Vec<Arc<dyn ConnectHook>> = self.connect_hooks.read().clone();
        for hook in hooks {
            hook.on_connect().await;
        }
    }

    /// Consume transport events until cancelled or the transport goes away.
    ///
    /// This is the single delivery path: each message is fully handled before
    /// the next one is looked at.
    pub async fn run(&self, mut events: EventReceiver, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(BusEvent::Connected) => self.connected().await,
                Some(BusEvent::Message { topic, payload }) => self.dispatch(&topic, &payload).await,
                None => {
                    warn!("Transport event stream closed");
                    break;
                }
            }
        }
        debug!("Bus dispatch loop stopped");
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.transport.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_message(&self, topic: &str, _payload: &[u8]) {
            self.seen.lock().push(topic.to_string());
        }
    }

    fn permissive_transport() -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_subscribe().returning(|_, _| Ok(()));
        transport.expect_unsubscribe().returning(|_| Ok(()));
        transport
    }

    #[tokio::test]
    async fn test_delivered_once_per_matching_subscription() {
        let adapter = BusAdapter::new(Arc::new(permissive_transport()));
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        adapter
            .subscribe(
                vec!["/lab/device/+/meta".into(), "/lab/device/dev1/meta".into()],
                first.clone(),
            )
            .await
            .unwrap();
        adapter
            .subscribe(vec!["/lab/device/+/meta".into()], second.clone())
            .await
            .unwrap();

        adapter.dispatch("/lab/device/dev1/meta", b"{}").await;
        adapter.dispatch("/lab/device/dev1/meta/extra", b"{}").await;

        assert_eq!(first.seen.lock().len(), 1);
        assert_eq!(second.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_shared_filter_stays_subscribed() {
        let mut transport = MockTransport::new();
        transport.expect_subscribe().times(3).returning(|_, _| Ok(()));
        transport
            .expect_unsubscribe()
            .withf(|filter| filter == "/only/first")
            .times(1)
            .returning(|_| Ok(()));
        let adapter = BusAdapter::new(Arc::new(transport));
        let handler = Arc::new(Recorder::default());

        let first = adapter
            .subscribe(vec!["/shared".into(), "/only/first".into()], handler.clone())
            .await
            .unwrap();
        adapter
            .subscribe(vec!["/shared".into()], handler.clone())
            .await
            .unwrap();
        adapter.unsubscribe(first).await.unwrap();

        adapter.dispatch("/only/first", b"").await;
        adapter.dispatch("/shared", b"").await;
        assert_eq!(*handler.seen.lock(), vec!["/shared".to_string()]);
    }

    #[tokio::test]
    async fn test_run_preserves_order_and_stops_on_cancel() {
        let (transport, rx) = crate::MemoryTransport::new();
        let transport = Arc::new(transport);
        let adapter = Arc::new(BusAdapter::new(transport.clone()));
        let recorder = Arc::new(Recorder::default());
        adapter
            .subscribe(vec!["/seq/+".into()], recorder.clone())
            .await
            .unwrap();

        for i in 0..5 {
            transport.inject(format!("/seq/{i}"), Vec::new());
        }

        let cancel = CancellationToken::new();
        let runner = {
            let adapter = adapter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { adapter.run(rx, cancel).await })
        };
        while recorder.seen.lock().len() < 5 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        runner.await.unwrap();

        let expected: Vec<String> = (0..5).map(|i| format!("/seq/{i}")).collect();
        assert_eq!(*recorder.seen.lock(), expected);
    }
}
