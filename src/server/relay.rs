//! Client <-> instance message subscriptions
//!
//! A client asks a named instance to push it messages of some type. The
//! instance later publishes through the gateway, which delivers them as `im`
//! events or tells the instance nobody is listening anymore.

use crate::backend::{BackendError, Messenger};
use crate::server::connections::ClientConnection;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Event name for relayed instance messages
pub const INSTANCE_MESSAGE_EVENT: &str = "im";

const CLIENT_SUBSCRIBE: &str = "clientSubscribe";
const CLIENT_UNSUBSCRIBE: &str = "clientUnsubscribe";

/// Connection -> target instance -> message types
type RelayTable = HashMap<Uuid, HashMap<String, BTreeSet<String>>>;

pub struct InstanceMessageRelay {
    messenger: Arc<dyn Messenger>,
    table: Mutex<RelayTable>,
}

impl InstanceMessageRelay {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self {
            messenger,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Record the subscription and forward it; the instance's answer is returned as is
    pub async fn client_subscribe(
        &self,
        conn: &ClientConnection,
        target: &str,
        msg_type: &str,
        data: Value,
    ) -> Result<Value, BackendError> {
        self.table
            .lock()
            .entry(conn.id)
            .or_default()
            .entry(target.to_string())
            .or_default()
            .insert(msg_type.to_string());

        debug!(conn_id = %conn.id, target = target, msg_type = msg_type, "Client subscribed to instance messages");
        self.messenger
            .request(
                target,
                CLIENT_SUBSCRIBE,
                json!({ "type": msg_type, "data": data, "sid": conn.id.to_string() }),
            )
            .await
    }

    /// Returns false if the connection held no such subscription
    pub async fn client_unsubscribe(&self, conn: &ClientConnection, target: &str, msg_type: &str) -> bool {
        let removed = {
            let mut table = self.table.lock();
            let Some(targets) = table.get_mut(&conn.id) else {
                return false;
            };
            let removed = targets.get_mut(target).map(|types| types.remove(msg_type)).unwrap_or(false);
            if targets.get(target).is_some_and(BTreeSet::is_empty) {
                targets.remove(target);
            }
            if targets.is_empty() {
                table.remove(&conn.id);
            }
            removed
        };
        if !removed {
            return false;
        }

        self.notify(target, conn.id, vec![msg_type.to_string()], "client").await;
        true
    }

    /// Deliver an instance's message to one connection.
    ///
    /// If the connection is not subscribed, the source instance is told so.
    pub async fn publish_instance_message(
        &self,
        conn: &ClientConnection,
        source: &str,
        msg_type: &str,
        data: Value,
    ) -> bool {
        if self.is_subscribed(conn.id, source, msg_type) {
            return conn.emit(INSTANCE_MESSAGE_EVENT, vec![json!(msg_type), json!(source), data]);
        }
        self.no_subscriber(source, conn.id, msg_type).await;
        false
    }

    /// Tell `source` that connection `sid` is not listening for `msg_type`
    pub async fn no_subscriber(&self, source: &str, sid: Uuid, msg_type: &str) {
        self.notify(source, sid, vec![msg_type.to_string()], "no one subscribed")
            .await;
    }

    /// Tell every instance the connection was subscribed to that it is gone
    pub async fn disconnect(&self, conn: &ClientConnection) {
        let Some(targets) = self.table.lock().remove(&conn.id) else {
            return;
        };
        for (target, types) in targets {
            if !types.is_empty() {
                self.notify(&target, conn.id, types.into_iter().collect(), "disconnect")
                    .await;
            }
        }
    }

    pub fn is_subscribed(&self, conn_id: Uuid, target: &str, msg_type: &str) -> bool {
        self.table
            .lock()
            .get(&conn_id)
            .and_then(|targets| targets.get(target))
            .is_some_and(|types| types.contains(msg_type))
    }

    pub fn subscribed_types(&self, conn_id: Uuid, target: &str) -> Vec<String> {
        self.table
            .lock()
            .get(&conn_id)
            .and_then(|targets| targets.get(target))
            .map(|types| types.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn notify(&self, target: &str, sid: Uuid, types: Vec<String>, reason: &str) {
        let message = json!({ "type": types, "sid": sid.to_string(), "reason": reason });
        if let Err(e) = self.messenger.send_to(target, CLIENT_UNSUBSCRIBE, message).await {
            warn!(target = target, reason = reason, error = %e, "Failed to notify instance");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, MemoryBackend};
    use crate::server::connections::{OutboundMessage, TransportInfo};
    use tokio::sync::mpsc;

    fn setup() -> (InstanceMessageRelay, Arc<MemoryBackend>, ClientConnection, mpsc::Receiver<OutboundMessage>) {
        let mem = Arc::new(MemoryBackend::new());
        let (tx, rx) = mpsc::channel(10);
        let conn = ClientConnection::new(TransportInfo::new(), tx);
        (InstanceMessageRelay::new(mem.clone()), mem, conn, rx)
    }

    fn unsubscribe_reasons(mem: &MemoryBackend) -> Vec<(String, Value)> {
        mem.calls()
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::SendTo { instance, command, message } if command == CLIENT_UNSUBSCRIBE => {
                    Some((instance, message))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_subscribe_returns_instance_answer() {
        let (relay, mem, conn, _rx) = setup();
        mem.set_instance_reply("cameras.0", CLIENT_SUBSCRIBE, json!({"accepted": true}));

        let answer = relay
            .client_subscribe(&conn, "cameras.0", "frame", json!({"fps": 5}))
            .await
            .unwrap();
        assert_eq!(answer, json!({"accepted": true}));
        assert!(relay.is_subscribed(conn.id, "cameras.0", "frame"));
    }

    #[tokio::test]
    async fn test_publish_delivers_im_when_subscribed() {
        let (relay, mem, conn, mut rx) = setup();
        relay.client_subscribe(&conn, "cameras.0", "frame", Value::Null).await.unwrap();

        assert!(relay.publish_instance_message(&conn, "cameras.0", "frame", json!("jpeg")).await);
        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundMessage::event("im", vec![json!("frame"), json!("cameras.0"), json!("jpeg")])
        );
        assert!(unsubscribe_reasons(&mem).is_empty());
    }

    #[tokio::test]
    async fn test_publish_unsubscribed_tells_source() {
        let (relay, mem, conn, mut rx) = setup();

        assert!(!relay.publish_instance_message(&conn, "cameras.0", "frame", json!(1)).await);
        assert!(rx.try_recv().is_err());
        let notes = unsubscribe_reasons(&mem);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].1["reason"], "no one subscribed");
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_returns_false() {
        let (relay, mem, conn, _rx) = setup();
        assert!(!relay.client_unsubscribe(&conn, "cameras.0", "frame").await);

        relay.client_subscribe(&conn, "cameras.0", "frame", Value::Null).await.unwrap();
        assert!(relay.client_unsubscribe(&conn, "cameras.0", "frame").await);
        assert!(!relay.is_subscribed(conn.id, "cameras.0", "frame"));

        let notes = unsubscribe_reasons(&mem);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].1["reason"], "client");
        assert_eq!(notes[0].1["type"], json!(["frame"]));
    }

    #[tokio::test]
    async fn test_disconnect_notifies_each_target_once() {
        let (relay, mem, conn, _rx) = setup();
        relay.client_subscribe(&conn, "cameras.0", "frame", Value::Null).await.unwrap();
        relay.client_subscribe(&conn, "cameras.0", "motion", Value::Null).await.unwrap();
        relay.client_subscribe(&conn, "sonos.0", "track", Value::Null).await.unwrap();

        relay.disconnect(&conn).await;
        relay.disconnect(&conn).await;

        let mut notes = unsubscribe_reasons(&mem);
        notes.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].0, "cameras.0");
        assert_eq!(notes[0].1["type"], json!(["frame", "motion"]));
        assert_eq!(notes[0].1["reason"], "disconnect");
        assert_eq!(notes[1].0, "sonos.0");
    }
}
