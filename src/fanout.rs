//! Subscription fan-out.
//!
//! Each connected client gets its own unbounded channel and a set of
//! subscribed tag ids; every tick's change set is filtered down to what
//! that client asked for before being sent. The filtered per-client
//! fan-out pattern is grounded on `DashboardConsumer` in
//! `original_source/main/consumers.py` (subscribe message, per-client
//! `subscribed_tags` set, filtered `tag_update` send); the channel/slot
//! shape follows `ClientSlot { tx, flags }` in a sibling project's
//! websocket upstream bridge.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::{Id, TagValue, ThreatLevel};

pub type ClientId = u64;

#[derive(Debug, Clone, Serialize)]
pub struct TagUpdate {
    pub value: TagValue,
    pub time: DateTime<Utc>,
    pub age_ms: i64,
    pub alarm: Option<ThreatLevel>,
}

/// The per-tick payload shape sent to subscribed clients:
/// `{tag_id: {value, time, age_ms, alarm}}`.
pub type TickChangeMessage = HashMap<Id, TagUpdate>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { tags: Vec<Id> },
    Unsubscribe { tags: Vec<Id> },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage<'a> {
    TagUpdate { data: &'a TickChangeMessage },
}

struct ClientSlot {
    tx: mpsc::UnboundedSender<Arc<TickChangeMessage>>,
    subscribed: HashSet<Id>,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    clients: RwLock<HashMap<ClientId, ClientSlot>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (ClientId, mpsc::UnboundedReceiver<Arc<TickChangeMessage>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.write().unwrap().insert(
            id,
            ClientSlot {
                tx,
                subscribed: HashSet::new(),
            },
        );
        (id, rx)
    }

    pub fn unregister(&self, id: ClientId) {
        self.clients.write().unwrap().remove(&id);
    }

    pub fn subscribe(&self, id: ClientId, tags: impl IntoIterator<Item = Id>) {
        if let Some(slot) = self.clients.write().unwrap().get_mut(&id) {
            slot.subscribed.extend(tags);
        }
    }

    pub fn unsubscribe(&self, id: ClientId, tags: impl IntoIterator<Item = Id>) {
        if let Some(slot) = self.clients.write().unwrap().get_mut(&id) {
            for tag_id in tags {
                slot.subscribed.remove(&tag_id);
            }
        }
    }

    /// Fans `changes` out to every client, filtered to that client's
    /// subscribed tag ids. Clients with an empty intersection receive
    /// nothing this tick, same as the original only sending `tag_update`
    /// when `relevant_updates` is non-empty.
    pub fn broadcast(&self, changes: &TickChangeMessage) {
        let clients = self.clients.read().unwrap();
        for (id, slot) in clients.iter() {
            let filtered: TickChangeMessage = changes
                .iter()
                .filter(|(tag_id, _)| slot.subscribed.contains(tag_id))
                .map(|(k, v)| (*k, v.clone()))
                .collect();
            if filtered.is_empty() {
                continue;
            }
            if slot.tx.send(Arc::new(filtered)).is_err() {
                debug!(client_id = id, "dropping send to disconnected client");
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }
}

pub fn router(registry: Arc<SubscriberRegistry>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(registry)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<SubscriberRegistry>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

async fn handle_socket(socket: WebSocket, registry: Arc<SubscriberRegistry>) {
    let (mut sink, mut stream) = socket.split();
    let (client_id, mut rx) = registry.register();

    let send_task = tokio::spawn(async move {
        while let Some(changes) = rx.recv().await {
            let payload = ServerMessage::TagUpdate { data: &changes };
            let Ok(text) = serde_json::to_string(&payload) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else { continue };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Subscribe { tags }) => registry.subscribe(client_id, tags),
            Ok(ClientMessage::Unsubscribe { tags }) => registry.unsubscribe(client_id, tags),
            Err(e) => warn!(client_id, error = %e, "ignoring malformed client message"),
        }
    }

    send_task.abort();
    registry.unregister(client_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(value: i64) -> TagUpdate {
        TagUpdate {
            value: TagValue::Int(value),
            time: Utc::now(),
            age_ms: 0,
            alarm: None,
        }
    }

    #[test]
    fn unsubscribed_client_receives_nothing() {
        let registry = SubscriberRegistry::new();
        let (id, mut rx) = registry.register();
        registry.subscribe(id, [1]);

        let mut changes = TickChangeMessage::new();
        changes.insert(2, update(10));
        registry.broadcast(&changes);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscribed_client_receives_only_its_tags() {
        let registry = SubscriberRegistry::new();
        let (id, mut rx) = registry.register();
        registry.subscribe(id, [1, 2]);

        let mut changes = TickChangeMessage::new();
        changes.insert(1, update(10));
        changes.insert(3, update(30));
        registry.broadcast(&changes);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.len(), 1);
        assert!(received.contains_key(&1));
    }

    #[test]
    fn unregister_removes_client() {
        let registry = SubscriberRegistry::new();
        let (id, _rx) = registry.register();
        assert_eq!(registry.client_count(), 1);
        registry.unregister(id);
        assert_eq!(registry.client_count(), 0);
    }
}
