//! The Event Dispatcher: live-subscriber broadcast plus webhook HTTP
//! delivery with HMAC signing, retries, and failure tracking.
//!
//! The broadcast fan-out shape is grounded on Weavegraph's
//! `event_bus/hub.rs` (a `tokio::sync::broadcast` channel wrapped so a
//! lagging subscriber's missed messages are dropped, not fatal), adapted to
//! this crate's plain `std::sync` idiom in place of `parking_lot`. Webhook
//! delivery semantics — payload shape, HMAC-SHA256 signature header,
//! 3-attempt exponential backoff, failure-count tracking — are restated from
//! `original_source/oversight_gateway/webhooks.py`'s `WebhookManager`.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::broadcast;
use tracing::{instrument, warn};

use crate::model::Webhook;
use crate::store::SharedStateStore;

const CHANNEL_CAPACITY: usize = 256;
const MAX_DELIVERY_ATTEMPTS: u32 = 3;
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// One fan-out event, named per the dispatcher's event table.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub event: &'static str,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl GatewayEvent {
    pub fn new(event: &'static str, data: Value) -> Self {
        Self {
            event,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Live-subscriber broadcast, independent of webhook delivery.
struct Hub {
    sender: RwLock<Option<broadcast::Sender<GatewayEvent>>>,
}

impl Hub {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender: RwLock::new(Some(sender)),
        }
    }

    fn publish(&self, event: GatewayEvent) {
        if let Some(sender) = self.current_sender() {
            // No subscribers is not an error; best-effort fan-out only.
            let _ = sender.send(event);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.current_sender().map(|s| s.subscribe()).unwrap_or_else(|| {
            let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
            drop(sender);
            receiver
        })
    }

    fn current_sender(&self) -> Option<broadcast::Sender<GatewayEvent>> {
        self.sender.read().ok()?.clone()
    }
}

/// Long-lived event fan-out: one per running Engine.
pub struct EventDispatcher {
    hub: Hub,
    store: SharedStateStore,
    http: reqwest::Client,
}

impl EventDispatcher {
    pub fn new(store: SharedStateStore) -> Self {
        Self {
            hub: Hub::new(),
            store,
            http: reqwest::Client::builder()
                .timeout(DELIVERY_TIMEOUT)
                .build()
                .expect("reqwest client with a fixed timeout always builds"),
        }
    }

    /// A fresh receiver for the `/ws/dashboard` handler; each call gets its
    /// own independent stream.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.hub.subscribe()
    }

    /// Publish to live subscribers immediately, then fan out to subscribed
    /// webhooks concurrently. Webhook delivery never fails this call: every
    /// outcome is recorded against the webhook, not surfaced to the caller.
    #[instrument(skip(self, data), fields(event = event_name))]
    pub async fn dispatch(&self, event_name: &'static str, data: Value) {
        let event = GatewayEvent::new(event_name, data);
        self.hub.publish(event.clone());

        let webhooks = match self.store.list_webhooks().await {
            Ok(hooks) => hooks,
            Err(err) => {
                warn!(error = %err, "failed to list webhooks for dispatch");
                return;
            }
        };

        let subscribed: Vec<Webhook> = webhooks
            .into_iter()
            .filter(|w| w.subscribes_to(event.event))
            .collect();
        if subscribed.is_empty() {
            return;
        }

        let deliveries = subscribed.into_iter().map(|webhook| self.deliver(webhook, event.clone()));
        futures_util::future::join_all(deliveries).await;
    }

    async fn deliver(&self, webhook: Webhook, event: GatewayEvent) {
        let body = canonical_payload(&event, webhook.id);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        if let Some(secret) = &webhook.secret {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&sign(secret, &body)) {
                headers.insert("X-Webhook-Signature", value);
            }
        }

        for attempt in 0..MAX_DELIVERY_ATTEMPTS {
            let result = self
                .http
                .post(&webhook.url)
                .headers(headers.clone())
                .body(body.clone())
                .send()
                .await;

            let delivered = matches!(&result, Ok(response) if response.status().is_success());
            if delivered {
                let _ = self.store.record_webhook_delivery(webhook.id, true, Utc::now()).await;
                return;
            }

            let is_last_attempt = attempt + 1 == MAX_DELIVERY_ATTEMPTS;
            if is_last_attempt {
                let _ = self.store.record_webhook_delivery(webhook.id, false, Utc::now()).await;
                warn!(webhook_id = webhook.id, url = %webhook.url, "webhook delivery failed after retries");
            } else {
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
            }
        }
    }
}

/// Canonical JSON for `{event, data, timestamp, webhook_id}` with keys
/// sorted lexicographically: the top-level map is a `BTreeMap`, and
/// `serde_json::Map` itself sorts by key unless the `preserve_order`
/// feature is enabled (it isn't here), so nested objects canonicalise too.
fn canonical_payload(event: &GatewayEvent, webhook_id: i64) -> String {
    let mut payload: BTreeMap<String, Value> = BTreeMap::new();
    payload.insert("event".to_string(), Value::String(event.event.to_string()));
    payload.insert("data".to_string(), event.data.clone());
    payload.insert("timestamp".to_string(), Value::String(event.timestamp.to_rfc3339()));
    payload.insert("webhook_id".to_string(), Value::from(webhook_id));
    serde_json::to_string(&payload).unwrap_or_default()
}

type HmacSha256 = Hmac<Sha256>;

fn sign(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any length");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use std::sync::Arc;

    #[test]
    fn canonical_payload_sorts_top_level_keys() {
        let event = GatewayEvent::new("action_evaluated", serde_json::json!({"risk_score": 0.1}));
        let body = canonical_payload(&event, 7);
        let data_pos = body.find("\"data\"").unwrap();
        let event_pos = body.find("\"event\"").unwrap();
        let timestamp_pos = body.find("\"timestamp\"").unwrap();
        let webhook_pos = body.find("\"webhook_id\"").unwrap();
        assert!(data_pos < event_pos);
        assert!(event_pos < timestamp_pos);
        assert!(timestamp_pos < webhook_pos);
    }

    #[test]
    fn signature_has_sha256_prefix_and_is_deterministic() {
        let body = r#"{"a":1}"#;
        let sig1 = sign("secret", body);
        let sig2 = sign("secret", body);
        assert!(sig1.starts_with("sha256="));
        assert_eq!(sig1, sig2);
        assert_ne!(sig1, sign("other-secret", body));
    }

    #[tokio::test]
    async fn dispatch_reaches_live_subscribers_before_webhooks() {
        let store: SharedStateStore = Arc::new(MemoryStateStore::new());
        let dispatcher = EventDispatcher::new(store);
        let mut receiver = dispatcher.subscribe();

        dispatcher.dispatch("action_evaluated", serde_json::json!({"action_id": 1})).await;

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event, "action_evaluated");
    }

    #[tokio::test]
    async fn dispatch_with_no_subscribed_webhooks_does_not_panic() {
        let store: SharedStateStore = Arc::new(MemoryStateStore::new());
        let dispatcher = EventDispatcher::new(store);
        dispatcher.dispatch("near_miss_recorded", serde_json::json!({})).await;
    }
}
