//! Connection state management

use crate::acl::{Acl, ADMIN_USER};
use crate::backend::CallContext;
use crate::patterns::{PatternSubscription, SubscriptionType};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Event name telling a client to restart its auth flow
pub const REAUTHENTICATE_EVENT: &str = "reauthenticate";

/// Message to send to a client
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Named event with positional arguments
    Event { name: String, args: Vec<Value> },
    /// Ask the transport to close the socket
    Close,
}

impl OutboundMessage {
    pub fn event(name: impl Into<String>, args: Vec<Value>) -> Self {
        OutboundMessage::Event {
            name: name.into(),
            args,
        }
    }
}

/// What the transport knows about a socket at connect time
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub remote_addr: Option<IpAddr>,
    pub cookies: HashMap<String, String>,
    pub authorization: Option<String>,
    /// Legacy session id resolved by the transport from its cookie
    pub session_id: Option<String>,
    /// Mount path the socket was accepted on
    pub path: String,
    /// False for transports that tear the socket down themselves after an auth failure
    pub requires_explicit_disconnect: bool,
}

impl Default for TransportInfo {
    fn default() -> Self {
        Self {
            remote_addr: None,
            cookies: HashMap::new(),
            authorization: None,
            session_id: None,
            path: "/".to_string(),
            requires_explicit_disconnect: true,
        }
    }
}

impl TransportInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Parse a raw `Cookie:` header (`a=1; b=2`)
    pub fn with_cookie_header(mut self, header: &str) -> Self {
        for pair in header.split(';') {
            if let Some((k, v)) = pair.split_once('=') {
                self.cookies.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        self
    }

    pub fn with_authorization(mut self, header: impl Into<String>) -> Self {
        self.authorization = Some(header.into());
        self
    }

    pub fn with_session_id(mut self, sid: impl Into<String>) -> Self {
        self.session_id = Some(sid.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn closes_itself(mut self) -> Self {
        self.requires_explicit_disconnect = false;
        self
    }

    /// Bearer token from the `access_token` cookie or an `Authorization: Bearer` header
    pub fn bearer_token(&self) -> Option<&str> {
        if let Some(token) = self.cookies.get("access_token").filter(|t| !t.is_empty()) {
            return Some(token.as_str());
        }
        self.authorization
            .as_deref()
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Resolved identity of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub groups: Vec<String>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.user == ADMIN_USER
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Connecting,
    Authenticating,
    Authenticated { secure: bool },
    Failed,
    Disconnected,
}

impl AuthState {
    /// No further transition will make this connection usable
    fn is_settled(&self) -> bool {
        !matches!(self, AuthState::Connecting | AuthState::Authenticating)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// Session store key (`a:<token>` or the legacy session id)
    pub key: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_checked: Option<Instant>,
    pub expired: bool,
}

impl SessionInfo {
    /// Not marked expired and not past its recorded expiry
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.expired && self.expires_at.map_or(true, |at| at > now)
    }
}

/// Per-connection pattern lists
#[derive(Debug)]
pub struct ConnectionSubscriptions {
    /// Whether this connection's patterns are counted in the global table
    attached: bool,
    lists: HashMap<SubscriptionType, Vec<PatternSubscription>>,
}

impl Default for ConnectionSubscriptions {
    fn default() -> Self {
        Self {
            attached: true,
            lists: HashMap::new(),
        }
    }
}

impl ConnectionSubscriptions {
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub(crate) fn set_attached(&mut self, attached: bool) {
        self.attached = attached;
    }

    /// Append unless the key is already held; returns whether it was added
    pub(crate) fn add(&mut self, kind: SubscriptionType, sub: PatternSubscription) -> bool {
        let list = self.lists.entry(kind).or_default();
        if list.iter().any(|s| s.key() == sub.key()) {
            return false;
        }
        list.push(sub);
        true
    }

    pub(crate) fn remove(&mut self, kind: SubscriptionType, key: &str) -> bool {
        match self.lists.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|s| s.key() != key);
                list.len() != before
            }
            None => false,
        }
    }

    /// The first subscription of `kind` that matches, in subscription order
    pub fn first_match(&self, kind: SubscriptionType, id: &str, file: Option<&str>) -> Option<&PatternSubscription> {
        self.lists
            .get(&kind)
            .and_then(|list| list.iter().find(|s| s.matches(id, file)))
    }

    pub fn count(&self, kind: SubscriptionType) -> usize {
        self.lists.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Snapshot of `(type, subscription)` pairs
    pub fn entries(&self) -> Vec<(SubscriptionType, PatternSubscription)> {
        let mut out = Vec::new();
        for kind in SubscriptionType::ALL {
            if let Some(list) = self.lists.get(&kind) {
                out.extend(list.iter().cloned().map(|s| (kind, s)));
            }
        }
        out
    }

    pub fn keys(&self, kind: SubscriptionType) -> Vec<String> {
        self.lists
            .get(&kind)
            .map(|list| list.iter().map(|s| s.key().to_string()).collect())
            .unwrap_or_default()
    }
}

/// A connected client
pub struct ClientConnection {
    /// Unique connection ID
    pub id: Uuid,
    pub transport: TransportInfo,
    identity: RwLock<Option<Identity>>,
    acl: RwLock<Acl>,
    session: Mutex<SessionInfo>,
    name: RwLock<Option<String>>,
    /// Whether the client asked for log forwarding
    log_enabled: Mutex<bool>,
    subscriptions: Mutex<ConnectionSubscriptions>,
    auth: watch::Sender<AuthState>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    /// Channel for sending messages to this client
    tx: mpsc::Sender<OutboundMessage>,
}

impl ClientConnection {
    pub fn new(transport: TransportInfo, tx: mpsc::Sender<OutboundMessage>) -> Self {
        let (auth, _) = watch::channel(AuthState::Connecting);
        Self {
            id: Uuid::new_v4(),
            transport,
            identity: RwLock::new(None),
            acl: RwLock::new(Acl::Unauthenticated),
            session: Mutex::new(SessionInfo::default()),
            name: RwLock::new(None),
            log_enabled: Mutex::new(false),
            subscriptions: Mutex::new(ConnectionSubscriptions::default()),
            auth,
            timers: Mutex::new(Vec::new()),
            tx,
        }
    }

    /// Queue an event for this client; drops it if the buffer is full or the client is gone
    pub fn emit(&self, name: &str, args: Vec<Value>) -> bool {
        match self.tx.try_send(OutboundMessage::event(name, args)) {
            Ok(()) => true,
            Err(e) => {
                // Expected during rapid disconnect
                debug!(conn_id = %self.id, event = name, error = %e, "Dropped outbound event");
                false
            }
        }
    }

    /// Ask the transport to close this socket; false if the request could not be queued
    pub fn close(&self) -> bool {
        match self.tx.try_send(OutboundMessage::Close) {
            Ok(()) => true,
            Err(e) => {
                debug!(conn_id = %self.id, error = %e, "Dropped close request");
                false
            }
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().clone()
    }

    pub(crate) fn set_identity(&self, identity: Identity, acl: Acl) {
        *self.identity.write() = Some(identity);
        *self.acl.write() = acl;
    }

    pub fn acl(&self) -> Acl {
        *self.acl.read()
    }

    pub fn is_admin(&self) -> bool {
        self.identity.read().as_ref().map(Identity::is_admin).unwrap_or(false)
    }

    /// User name, empty until authenticated
    pub fn user(&self) -> String {
        self.identity.read().as_ref().map(|i| i.user.clone()).unwrap_or_default()
    }

    pub fn call_context(&self) -> CallContext {
        CallContext::new(self.user())
    }

    pub fn auth_state(&self) -> AuthState {
        *self.auth.borrow()
    }

    pub(crate) fn set_auth_state(&self, state: AuthState) {
        self.auth.send_replace(state);
    }

    /// Move to `state` unless the connection was already torn down
    pub(crate) fn transition_auth(&self, state: AuthState) -> bool {
        self.auth.send_if_modified(|current| {
            if *current == AuthState::Disconnected {
                return false;
            }
            *current = state;
            true
        })
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.auth_state(), AuthState::Authenticated { .. })
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.auth_state(), AuthState::Authenticated { secure: true })
    }

    /// Resolve once authentication has either succeeded or failed
    pub async fn wait_authenticated(&self) -> AuthState {
        let mut rx = self.auth.subscribe();
        let state = match rx.wait_for(AuthState::is_settled).await {
            Ok(state) => *state,
            Err(_) => AuthState::Disconnected,
        };
        state
    }

    pub fn session(&self) -> MutexGuard<'_, SessionInfo> {
        self.session.lock()
    }

    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        *self.name.write() = name;
    }

    pub fn log_enabled(&self) -> bool {
        *self.log_enabled.lock()
    }

    pub(crate) fn set_log_enabled(&self, enabled: bool) -> bool {
        std::mem::replace(&mut *self.log_enabled.lock(), enabled)
    }

    pub fn subscriptions(&self) -> MutexGuard<'_, ConnectionSubscriptions> {
        self.subscriptions.lock()
    }

    /// Track a timer so it is aborted when the connection goes away
    pub fn add_timer(&self, handle: JoinHandle<()>) {
        let mut timers = self.timers.lock();
        timers.retain(|h| !h.is_finished());
        timers.push(handle);
    }

    pub fn clear_timers(&self) {
        for handle in self.timers.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Manages all active connections
#[derive(Clone, Default)]
pub struct ConnectionManager {
    /// All active connections by ID
    connections: Arc<DashMap<Uuid, Arc<ClientConnection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection
    pub fn add(&self, conn: Arc<ClientConnection>) {
        self.connections.insert(conn.id, conn);
    }

    /// Remove a connection
    pub fn remove(&self, id: Uuid) -> Option<Arc<ClientConnection>> {
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    /// Get a connection by ID
    pub fn get(&self, id: Uuid) -> Option<Arc<ClientConnection>> {
        self.connections.get(&id).map(|r| r.clone())
    }

    pub fn all(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Get total connection count
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Emit an event to every connection; returns how many accepted it
    pub fn broadcast(&self, name: &str, args: &[Value]) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().emit(name, args.to_vec()))
            .count()
    }

    /// Display names of authenticated connections, sorted
    pub fn client_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .iter()
            .filter(|e| e.value().is_authenticated())
            .map(|e| e.value().name().unwrap_or_else(|| e.value().user()))
            .collect();
        names.sort();
        names
    }
}
