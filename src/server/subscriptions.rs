//! Pattern subscription multiplexer
//!
//! Many connections subscribe to overlapping patterns; the backend sees
//! each distinct `(type, key)` exactly once. The global table counts
//! holders per key and only the 0->1 and 1->0 transitions reach the backend.

use crate::acl::ADMIN_USER;
use crate::backend::{CallContext, StateStore};
use crate::patterns::{composite_key, PatternSubscription, SubscriptionType};
use crate::server::connections::ClientConnection;
use crate::server::relay::InstanceMessageRelay;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Backend pattern used for log forwarding
const LOG_KEY: &str = "*";

#[derive(Debug, Clone)]
struct GlobalEntry {
    pattern: String,
    aux: Option<String>,
    count: usize,
}

/// Global reference-counted subscription table
pub struct SubscriptionRegistry {
    store: Arc<dyn StateStore>,
    relay: Arc<InstanceMessageRelay>,
    table: Mutex<HashMap<SubscriptionType, HashMap<String, GlobalEntry>>>,
    /// Set while burst protection holds the backend's stateChange subscriptions
    states_suspended: AtomicBool,
    /// stateChange pattern that stays live on the backend while suspended
    system_pattern: Option<String>,
}

impl SubscriptionRegistry {
    pub fn new(store: Arc<dyn StateStore>, relay: Arc<InstanceMessageRelay>) -> Self {
        Self {
            store,
            relay,
            table: Mutex::new(HashMap::new()),
            states_suspended: AtomicBool::new(false),
            system_pattern: None,
        }
    }

    /// Keep `pattern` subscribed on the backend during burst suspension
    pub fn with_system_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.system_pattern = Some(pattern.into());
        self
    }

    fn context(conn: Option<&ClientConnection>) -> CallContext {
        match conn {
            Some(conn) => conn.call_context(),
            None => CallContext::new(ADMIN_USER),
        }
    }

    /// Subscribe a connection (or the gateway itself, with `None`) to a pattern.
    ///
    /// Invalid patterns are ignored with a warning. Subscribing twice to the
    /// same key is a no-op.
    pub async fn subscribe(
        &self,
        conn: Option<&ClientConnection>,
        kind: SubscriptionType,
        pattern: &str,
        aux: Option<&str>,
    ) {
        if kind == SubscriptionType::Log {
            self.subscribe_log(conn).await;
            return;
        }
        let aux = if kind == SubscriptionType::FileChange { aux } else { None };

        let sub = match PatternSubscription::new(pattern, aux) {
            Ok(sub) => sub,
            Err(e) => {
                warn!(kind = %kind, pattern = pattern, error = %e, "Ignoring invalid subscription pattern");
                return;
            }
        };
        let key = sub.key().to_string();

        // The connection list stays locked across the count so a concurrent
        // unsubscribe_all sees either both or neither
        let first = match conn {
            Some(conn) => {
                let mut subs = conn.subscriptions();
                if !subs.add(kind, sub) {
                    debug!(conn_id = %conn.id, kind = %kind, key = %key, "Already subscribed");
                    return;
                }
                subs.is_attached() && self.acquire(kind, &key, pattern, aux)
            }
            None => self.acquire(kind, &key, pattern, aux),
        };

        if first {
            self.backend_subscribe(kind, pattern, aux, &Self::context(conn)).await;
        }
    }

    /// Reverse of `subscribe`.
    ///
    /// With neither a connection nor a pattern every key of `kind` is dropped.
    /// With a connection and no pattern, every pattern of `kind` that
    /// connection holds is dropped.
    pub async fn unsubscribe(
        &self,
        conn: Option<&ClientConnection>,
        kind: SubscriptionType,
        pattern: Option<&str>,
        aux: Option<&str>,
    ) {
        if kind == SubscriptionType::Log {
            self.unsubscribe_log(conn).await;
            return;
        }
        let aux = if kind == SubscriptionType::FileChange { aux } else { None };

        match (conn, pattern) {
            (None, None) => self.reset(kind).await,
            (Some(conn), None) => {
                let keys = conn.subscriptions().keys(kind);
                for key in keys {
                    self.unsubscribe_key(Some(conn), kind, &key).await;
                }
            }
            (conn, Some(pattern)) => {
                if pattern.is_empty() {
                    warn!(kind = %kind, "Ignoring unsubscribe with empty pattern");
                    return;
                }
                self.unsubscribe_key(conn, kind, &composite_key(pattern, aux)).await;
            }
        }
    }

    async fn unsubscribe_key(&self, conn: Option<&ClientConnection>, kind: SubscriptionType, key: &str) {
        let last = match conn {
            Some(conn) => {
                let mut subs = conn.subscriptions();
                if !subs.remove(kind, key) {
                    debug!(conn_id = %conn.id, kind = %kind, key = key, "Not subscribed");
                    return;
                }
                if subs.is_attached() {
                    self.release(kind, key)
                } else {
                    None
                }
            }
            None => self.release(kind, key),
        };

        if let Some(entry) = last {
            self.backend_unsubscribe(kind, &entry, &Self::context(conn)).await;
        }
    }

    /// Drop every key of a type
    async fn reset(&self, kind: SubscriptionType) {
        let bucket = self.table.lock().remove(&kind).unwrap_or_default();
        let ctx = Self::context(None);
        for entry in bucket.values() {
            self.backend_unsubscribe(kind, entry, &ctx).await;
        }
    }

    async fn subscribe_log(&self, conn: Option<&ClientConnection>) {
        let first = match conn {
            Some(conn) => {
                let subs = conn.subscriptions();
                !conn.set_log_enabled(true)
                    && subs.is_attached()
                    && self.acquire(SubscriptionType::Log, LOG_KEY, LOG_KEY, None)
            }
            None => self.acquire(SubscriptionType::Log, LOG_KEY, LOG_KEY, None),
        };
        if first {
            self.backend_subscribe(SubscriptionType::Log, LOG_KEY, None, &Self::context(conn))
                .await;
        }
    }

    async fn unsubscribe_log(&self, conn: Option<&ClientConnection>) {
        let last = match conn {
            Some(conn) => {
                let subs = conn.subscriptions();
                if conn.set_log_enabled(false) && subs.is_attached() {
                    self.release(SubscriptionType::Log, LOG_KEY)
                } else {
                    None
                }
            }
            None => self.release(SubscriptionType::Log, LOG_KEY),
        };
        if let Some(entry) = last {
            self.backend_unsubscribe(SubscriptionType::Log, &entry, &Self::context(conn))
                .await;
        }
    }

    /// Increment under the lock; true on the 0 -> 1 transition
    fn acquire(&self, kind: SubscriptionType, key: &str, pattern: &str, aux: Option<&str>) -> bool {
        let mut table = self.table.lock();
        let entry = table
            .entry(kind)
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| GlobalEntry {
                pattern: pattern.to_string(),
                aux: aux.map(str::to_string),
                count: 0,
            });
        entry.count += 1;
        entry.count == 1
    }

    /// Decrement under the lock; returns the removed entry on the 1 -> 0 transition
    fn release(&self, kind: SubscriptionType, key: &str) -> Option<GlobalEntry> {
        let mut table = self.table.lock();
        let bucket = table.get_mut(&kind)?;
        let entry = bucket.get_mut(key)?;
        entry.count = entry.count.saturating_sub(1);
        if entry.count > 0 {
            return None;
        }
        let removed = bucket.remove(key);
        if bucket.is_empty() {
            table.remove(&kind);
        }
        removed
    }

    /// Suspended stateChange keys are bookkeeping only, except the system pattern
    fn is_held_back(&self, kind: SubscriptionType, pattern: &str) -> bool {
        kind == SubscriptionType::StateChange
            && self.is_state_suspended()
            && self.system_pattern.as_deref() != Some(pattern)
    }

    async fn backend_subscribe(&self, kind: SubscriptionType, pattern: &str, aux: Option<&str>, ctx: &CallContext) {
        if self.is_held_back(kind, pattern) {
            debug!(pattern = pattern, "Burst protection active, deferring backend subscribe");
            return;
        }
        debug!(kind = %kind, pattern = pattern, aux = ?aux, "Backend subscribe");
        if let Err(e) = self.store.subscribe(kind, pattern, aux, ctx).await {
            warn!(kind = %kind, pattern = pattern, error = %e, "Backend subscribe failed");
        }
    }

    async fn backend_unsubscribe(&self, kind: SubscriptionType, entry: &GlobalEntry, ctx: &CallContext) {
        if self.is_held_back(kind, &entry.pattern) {
            debug!(pattern = %entry.pattern, "Burst protection active, backend already unsubscribed");
            return;
        }
        debug!(kind = %kind, pattern = %entry.pattern, "Backend unsubscribe");
        if let Err(e) = self
            .store
            .unsubscribe(kind, &entry.pattern, entry.aux.as_deref(), ctx)
            .await
        {
            warn!(kind = %kind, pattern = %entry.pattern, error = %e, "Backend unsubscribe failed");
        }
    }

    /// Deliver an id/payload pair to one connection.
    ///
    /// Only the first matching pattern delivers; further matches on the same
    /// connection are not delivered again. Connections whose session is no
    /// longer valid are skipped.
    pub fn publish(&self, conn: &ClientConnection, kind: SubscriptionType, id: &str, payload: &Value) -> bool {
        if !conn.session().is_valid(Utc::now()) {
            return false;
        }

        if kind == SubscriptionType::Log {
            return conn.log_enabled() && conn.emit(kind.event_name(), vec![payload.clone()]);
        }

        let matched = conn.subscriptions().first_match(kind, id, None).is_some();
        matched && conn.emit(kind.event_name(), vec![Value::from(id), payload.clone()])
    }

    /// Deliver a file change; both the id and the file name must match
    pub fn publish_file(&self, conn: &ClientConnection, id: &str, file: &str, size: Option<u64>) -> bool {
        if !conn.session().is_valid(Utc::now()) {
            return false;
        }
        let kind = SubscriptionType::FileChange;
        let matched = conn.subscriptions().first_match(kind, id, Some(file)).is_some();
        matched && conn.emit(kind.event_name(), vec![json!(id), json!(file), json!(size)])
    }

    /// Count every pattern the connection holds again (reconnect resume)
    pub async fn subscribe_all(&self, conn: &ClientConnection) {
        let firsts: Vec<(SubscriptionType, String, Option<String>)> = {
            let mut subs = conn.subscriptions();
            if subs.is_attached() {
                return;
            }
            subs.set_attached(true);
            let mut firsts: Vec<_> = subs
                .entries()
                .into_iter()
                .filter_map(|(kind, sub)| {
                    let pattern = sub.pattern().as_str();
                    let aux = sub.aux().map(|a| a.as_str());
                    self.acquire(kind, sub.key(), pattern, aux)
                        .then(|| (kind, pattern.to_string(), aux.map(str::to_string)))
                })
                .collect();
            if conn.log_enabled() && self.acquire(SubscriptionType::Log, LOG_KEY, LOG_KEY, None) {
                firsts.push((SubscriptionType::Log, LOG_KEY.to_string(), None));
            }
            firsts
        };

        let ctx = conn.call_context();
        for (kind, pattern, aux) in firsts {
            self.backend_subscribe(kind, &pattern, aux.as_deref(), &ctx).await;
        }
    }

    /// Stop counting every pattern the connection holds and tell instances it left.
    ///
    /// The connection keeps its lists so `subscribe_all` can resume them.
    pub async fn unsubscribe_all(&self, conn: &ClientConnection) {
        let lasts: Vec<(SubscriptionType, GlobalEntry)> = {
            let mut subs = conn.subscriptions();
            if subs.is_attached() {
                subs.set_attached(false);
                let mut lasts: Vec<_> = subs
                    .entries()
                    .into_iter()
                    .filter_map(|(kind, sub)| self.release(kind, sub.key()).map(|entry| (kind, entry)))
                    .collect();
                if conn.log_enabled() {
                    if let Some(entry) = self.release(SubscriptionType::Log, LOG_KEY) {
                        lasts.push((SubscriptionType::Log, entry));
                    }
                }
                lasts
            } else {
                Vec::new()
            }
        };

        let ctx = conn.call_context();
        for (kind, entry) in lasts {
            self.backend_unsubscribe(kind, &entry, &ctx).await;
        }
        self.relay.disconnect(conn).await;
    }

    /// Current holder count for a key
    pub fn refcount(&self, kind: SubscriptionType, key: &str) -> usize {
        self.table
            .lock()
            .get(&kind)
            .and_then(|bucket| bucket.get(key))
            .map(|e| e.count)
            .unwrap_or(0)
    }

    /// Raw `(pattern, aux)` pairs currently tracked for a type
    pub fn tracked(&self, kind: SubscriptionType) -> Vec<(String, Option<String>)> {
        let mut out: Vec<_> = self
            .table
            .lock()
            .get(&kind)
            .map(|bucket| bucket.values().map(|e| (e.pattern.clone(), e.aux.clone())).collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn has_log_subscribers(&self) -> bool {
        self.refcount(SubscriptionType::Log, LOG_KEY) > 0
    }

    pub fn is_state_suspended(&self) -> bool {
        self.states_suspended.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state_suspended(&self, suspended: bool) {
        self.states_suspended.store(suspended, Ordering::SeqCst);
    }
}
