//! Live update fan-out for dashboard subscribers.
//!
//! Every subscriber owns a bounded queue; a full queue drops that
//! subscriber's copy of the message without disconnecting anyone.

use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

use crate::db::Store;
use crate::stats::{self, StatsResponse};

/// Outbound queue capacity per subscriber.
const QUEUE_CAPACITY: usize = 256;

/// Quiet interval before a requested stats refresh actually fires.
const STATS_DEBOUNCE: Duration = Duration::from_millis(500);

/// Fan-out hub for typed dashboard updates. Clones share one hub.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    store: Arc<Store>,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    last_stats: Mutex<Option<StatsResponse>>,
    debounce: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                store,
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                last_stats: Mutex::new(None),
                debounce: Mutex::new(None),
            }),
        }
    }

    /// Register a subscriber. The greeting message is queued immediately.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let _ = tx.try_send(r#"{"type":"connected"}"#.to_string());

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let total = {
            let mut subscribers = self.inner.subscribers.write().unwrap();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        tracing::info!("EventBus: subscriber {} connected (total: {})", id, total);

        Subscription {
            id,
            bus: self.clone(),
            rx: ReceiverStream::new(rx),
        }
    }

    /// Remove a subscriber and close its queue. Idempotent.
    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.inner.subscribers.write().unwrap();
        if subscribers.remove(&id).is_some() {
            tracing::info!(
                "EventBus: subscriber {} disconnected (total: {})",
                id,
                subscribers.len()
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().unwrap().len()
    }

    /// Broadcast a typed update to every subscriber.
    ///
    /// The payload is serialized once. Enqueueing never blocks: a full
    /// queue drops the message for that subscriber only, and a closed queue
    /// marks the subscriber for removal.
    pub fn publish<T: Serialize>(&self, event_type: &str, data: &T) {
        let message = match serde_json::to_string(&serde_json::json!({
            "type": event_type,
            "data": data,
        })) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("EventBus: failed to serialize {} update: {}", event_type, e);
                return;
            }
        };

        let mut closed = Vec::new();
        {
            let subscribers = self.inner.subscribers.read().unwrap();
            if subscribers.is_empty() {
                return;
            }

            let mut dropped = 0usize;
            for (id, tx) in subscribers.iter() {
                match tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped += 1;
                        tracing::warn!("EventBus: subscriber {} queue full, dropping message", id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }

            tracing::debug!(
                "EventBus: broadcast {} to {} subscribers ({} dropped)",
                event_type,
                subscribers.len(),
                dropped
            );
        }

        for id in closed {
            self.unsubscribe(id);
        }
    }

    /// Request a stats broadcast, debounced with a trailing 500 ms timer.
    ///
    /// Each call resets the timer; when it fires, fresh fleet stats are
    /// published only if any field changed since the last broadcast.
    pub fn publish_stats_debounced(&self) {
        let bus = self.clone();
        let mut pending = self.inner.debounce.lock().unwrap();
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(STATS_DEBOUNCE).await;
            bus.flush_stats();
        }));
    }

    fn flush_stats(&self) {
        let stats = match stats::fleet_stats(&self.inner.store, Utc::now()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("EventBus: failed to compute stats: {}", e);
                return;
            }
        };

        let changed = {
            let mut last = self.inner.last_stats.lock().unwrap();
            if last.as_ref() != Some(&stats) {
                *last = Some(stats);
                true
            } else {
                false
            }
        };

        if changed {
            self.publish("stats_update", &stats);
        } else {
            tracing::debug!("EventBus: stats unchanged, skipping broadcast");
        }
    }
}

/// A live subscriber handle; dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    bus: EventBus,
    rx: ReceiverStream<String>,
}

impl Stream for Subscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MonitorPatch, MonitorStatus, NewMonitor};
    use tempfile::NamedTempFile;
    use tokio_stream::StreamExt;

    fn open_bus() -> (NamedTempFile, Arc<Store>, EventBus) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let bus = EventBus::new(store.clone());
        (tmp, store, bus)
    }

    #[tokio::test]
    async fn test_subscribe_receives_connected_greeting() {
        let (_tmp, _store, bus) = open_bus();
        let mut sub = bus.subscribe();
        let first = sub.next().await.unwrap();
        assert_eq!(first, r#"{"type":"connected"}"#);
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let (_tmp, _store, bus) = open_bus();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish("monitor_deleted", &serde_json::json!({"id": 7}));

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.next().await.unwrap(), r#"{"type":"connected"}"#);
            let msg = sub.next().await.unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
            assert_eq!(parsed["type"], "monitor_deleted");
            assert_eq!(parsed["data"]["id"], 7);
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_but_stays_connected() {
        let (_tmp, _store, bus) = open_bus();
        let mut slow = bus.subscribe();

        // Never read while flooding well past the queue capacity.
        for i in 0..(QUEUE_CAPACITY + 100) {
            bus.publish("monitor_update", &serde_json::json!({"seq": i}));
        }

        assert_eq!(bus.subscriber_count(), 1);

        // The queue holds the greeting plus a capacity's worth of updates;
        // the overflow was dropped, not the subscriber.
        let mut received = 0usize;
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(50), slow.next()).await
        {
            received += 1;
        }
        assert_eq!(received, QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let (_tmp, _store, bus) = open_bus();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);

        // Publishing to nobody is a no-op.
        bus.publish("monitor_update", &serde_json::json!({"id": 1}));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stats_debounce_coalesces_and_skips_unchanged() {
        let (_tmp, store, bus) = open_bus();
        let monitor = store
            .create_monitor(&NewMonitor {
                name: "Test".to_string(),
                url: "https://example.com".to_string(),
                ..Default::default()
            })
            .unwrap();
        store
            .update_monitor(
                monitor.id,
                MonitorPatch::Runtime {
                    status: MonitorStatus::Up,
                    response_time: 100,
                    uptime: 100.0,
                    last_check: "just now".to_string(),
                    updated_at: Utc::now(),
                },
            )
            .unwrap();

        let mut sub = bus.subscribe();
        assert_eq!(sub.next().await.unwrap(), r#"{"type":"connected"}"#);

        // A burst of requests collapses into a single broadcast.
        for _ in 0..5 {
            bus.publish_stats_debounced();
        }
        tokio::time::sleep(Duration::from_millis(700)).await;

        let msg = sub.next().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["type"], "stats_update");
        assert_eq!(parsed["data"]["servicesUp"], 1);

        // Nothing changed, so another request stays silent.
        bus.publish_stats_debounced();
        tokio::time::sleep(Duration::from_millis(700)).await;
        let extra = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(extra.is_err());
    }
}
