use std::sync::Arc;
use std::time::Duration;

use lab_bus::BusAdapter;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::liveness_document;

/// Republish the online liveness document every `interval` until cancelled.
/// The first beat happens one interval after start.
pub(crate) fn spawn_heartbeat(
    bus: Arc<BusAdapter>,
    device_id: String,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let topic = lab_common::topics::device_status(&device_id);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let doc = liveness_document(&device_id, true);
                    if let Err(e) = bus.publish_json(&topic, &doc, true).await {
                        warn!(device_id = %device_id, error = %e, "Heartbeat publish failed");
                    }
                }
            }
        }
        debug!(device_id = %device_id, "Heartbeat stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_bus::MemoryTransport;
    use serde_json::Value;

    #[tokio::test(start_paused = true)]
    async fn test_beats_until_cancelled() {
        let (transport, _events) = MemoryTransport::new();
        let transport = Arc::new(transport);
        let bus = Arc::new(BusAdapter::new(transport.clone()));
        let cancel = CancellationToken::new();
        let topic = lab_common::topics::device_status("dev1");
        let handle = spawn_heartbeat(
            bus,
            "dev1".to_string(),
            Duration::from_secs(10),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(transport.published_to(&topic).is_empty());

        tokio::time::sleep(Duration::from_secs(20)).await;
        let beats = transport.published_to(&topic);
        assert!(beats.len() >= 2, "got {} beats", beats.len());
        for beat in &beats {
            assert!(beat.retain);
            let doc: Value = serde_json::from_slice(&beat.payload).unwrap();
            assert_eq!(doc["online"], true);
            assert_eq!(doc["device_id"], "dev1");
        }

        cancel.cancel();
        handle.await.unwrap();
        let after_cancel = transport.published_to(&topic).len();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.published_to(&topic).len(), after_cancel);
    }
}
