//! Connection authentication and teardown
//!
//! Identity is resolved once per connection, in this order:
//! 1. auth disabled: the configured default user
//! 2. bearer token (`access_token` cookie or `Authorization: Bearer`), looked up as `a:<token>`
//! 3. legacy session id, which must carry `passport.user`
//!
//! Any failure emits `reauthenticate` and closes the socket unless the
//! transport closes it itself.

use crate::acl::{qualify_user, Acl, PermissionTable, WhitelistEntry};
use crate::backend::Backend;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::server::connections::{
    AuthState, ClientConnection, ConnectionManager, Identity, OutboundMessage, TransportInfo, REAUTHENTICATE_EVENT,
};
use crate::server::hooks::GatewayHooks;
use crate::server::subscriptions::SubscriptionRegistry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Who a connection turned out to be, before ACL computation
#[derive(Debug, Clone)]
struct ResolvedIdentity {
    user: String,
    secure: bool,
    session_key: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// `aExp` in epoch milliseconds (token sessions)
fn token_expiry(record: &Value) -> Option<DateTime<Utc>> {
    record
        .get("aExp")
        .and_then(Value::as_i64)
        .and_then(DateTime::from_timestamp_millis)
}

/// `cookie.expires` as RFC 3339 (legacy sessions)
fn legacy_expiry(record: &Value) -> Option<DateTime<Utc>> {
    record
        .pointer("/cookie/expires")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|at| at.with_timezone(&Utc))
}

fn auth_failure(reason: impl Into<String>) -> GatewayError {
    GatewayError::AuthenticationFailure(reason.into())
}

pub struct ConnectionLifecycle {
    config: Arc<GatewayConfig>,
    backend: Backend,
    table: Arc<PermissionTable>,
    connections: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    hooks: Arc<dyn GatewayHooks>,
    clients_timer: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionLifecycle {
    pub fn new(
        config: Arc<GatewayConfig>,
        backend: Backend,
        table: Arc<PermissionTable>,
        connections: ConnectionManager,
        registry: Arc<SubscriptionRegistry>,
        hooks: Arc<dyn GatewayHooks>,
    ) -> Self {
        Self {
            config,
            backend,
            table,
            connections,
            registry,
            hooks,
            clients_timer: Mutex::new(None),
        }
    }

    /// Register a new connection; identity is resolved separately by `authenticate`
    pub fn open(&self, transport: TransportInfo) -> (Arc<ClientConnection>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let conn = Arc::new(ClientConnection::new(transport, tx));
        self.connections.add(conn.clone());
        info!(
            conn_id = %conn.id,
            remote = ?conn.transport.remote_addr,
            path = %conn.transport.path,
            "Connection opened"
        );
        (conn, rx)
    }

    /// Resolve identity and ACL for a connection
    pub async fn authenticate(&self, conn: &ClientConnection) -> Result<()> {
        if !conn.transition_auth(AuthState::Authenticating) {
            return Err(GatewayError::NotAuthenticated);
        }

        let resolved = if self.config.auth {
            self.resolve_identity(conn).await
        } else {
            Ok(ResolvedIdentity {
                user: qualify_user(&self.config.default_user),
                secure: false,
                session_key: None,
                expires_at: None,
            })
        };

        let result = match resolved {
            Ok(resolved) => self.grant(conn, resolved).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if conn.auth_state() != AuthState::Disconnected {
                self.reject(conn, e);
            }
        }
        result
    }

    async fn resolve_identity(&self, conn: &ClientConnection) -> Result<ResolvedIdentity> {
        let now = Utc::now();

        if let Some(token) = conn.transport.bearer_token() {
            let key = format!("a:{}", token);
            let record = self
                .backend
                .sessions
                .get(&key)
                .await
                .map_err(|e| auth_failure(format!("session store: {}", e)))?
                .ok_or_else(|| auth_failure("unknown token"))?;
            let user = record
                .get("user")
                .and_then(Value::as_str)
                .ok_or_else(|| auth_failure("token without user"))?;
            let expires_at = token_expiry(&record);
            if expires_at.is_some_and(|at| at <= now) {
                return Err(auth_failure("token expired"));
            }
            return Ok(ResolvedIdentity {
                user: qualify_user(user),
                secure: true,
                session_key: Some(key),
                expires_at,
            });
        }

        if let Some(sid) = conn.transport.session_id.as_deref() {
            let record = self
                .backend
                .sessions
                .get(sid)
                .await
                .map_err(|e| auth_failure(format!("session store: {}", e)))?
                .ok_or_else(|| auth_failure("unknown session"))?;
            let user = record
                .pointer("/passport/user")
                .and_then(Value::as_str)
                .ok_or_else(|| auth_failure("session without user"))?;
            let expires_at = legacy_expiry(&record);
            if expires_at.is_some_and(|at| at <= now) {
                return Err(auth_failure("session expired"));
            }
            return Ok(ResolvedIdentity {
                user: qualify_user(user),
                secure: false,
                session_key: Some(sid.to_string()),
                expires_at,
            });
        }

        Err(auth_failure("no credentials"))
    }

    async fn grant(&self, conn: &ClientConnection, resolved: ResolvedIdentity) -> Result<()> {
        let entry: Option<WhitelistEntry> = conn
            .transport
            .remote_addr
            .and_then(|ip| self.config.whitelist.lookup(&ip).cloned());

        let mut user = resolved.user;
        if let Some(forced) = entry.as_ref().and_then(WhitelistEntry::override_user) {
            debug!(conn_id = %conn.id, from = %user, to = forced, "Whitelist overrides user");
            user = qualify_user(forced);
        }

        let computed = self
            .backend
            .acl
            .calculate_permissions(&user, &self.table)
            .await
            .map_err(|e| auth_failure(format!("permissions for {}: {}", user, e)))?;
        let grants = match &entry {
            Some(entry) => entry.narrow(&computed.grants),
            None => computed.grants,
        };
        if conn.auth_state() == AuthState::Disconnected {
            debug!(conn_id = %conn.id, "Connection closed while authenticating");
            return Err(GatewayError::NotAuthenticated);
        }

        conn.set_identity(
            Identity {
                user: user.clone(),
                groups: computed.groups,
            },
            Acl::Granted(grants),
        );
        {
            let mut session = conn.session();
            session.key = resolved.session_key;
            session.expires_at = resolved.expires_at;
            session.last_checked = Some(Instant::now());
            session.expired = false;
        }
        if !conn.transition_auth(AuthState::Authenticated { secure: resolved.secure }) {
            debug!(conn_id = %conn.id, "Connection closed while authenticating");
            return Err(GatewayError::NotAuthenticated);
        }

        info!(conn_id = %conn.id, user = %user, secure = resolved.secure, "Connection authenticated");
        self.schedule_clients_update();
        Ok(())
    }

    fn reject(&self, conn: &ClientConnection, error: &GatewayError) {
        warn!(conn_id = %conn.id, remote = ?conn.transport.remote_addr, error = %error, "Authentication failed");
        conn.emit(REAUTHENTICATE_EVENT, vec![]);
        if conn.transport.requires_explicit_disconnect {
            conn.close();
        }
        conn.transition_auth(AuthState::Failed);
    }

    /// Verify the connection's session is still alive.
    ///
    /// The cached expiry is checked every time; the session store is only
    /// re-read once per freshness interval. A failed check emits
    /// `reauthenticate` but leaves the socket open.
    pub async fn check_fresh(&self, conn: &ClientConnection) -> Result<()> {
        let (key, due) = {
            let session = conn.session();
            if !session.is_valid(Utc::now()) {
                drop(session);
                return Err(self.expire(conn));
            }
            let due = session
                .last_checked
                .map_or(true, |at| at.elapsed() >= self.config.freshness_interval());
            (session.key.clone(), due)
        };
        let Some(key) = key else {
            return Ok(());
        };
        if !due {
            return Ok(());
        }

        let record = match self.backend.sessions.get(&key).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(self.expire(conn)),
            Err(e) => {
                warn!(conn_id = %conn.id, error = %e, "Session store lookup failed");
                return Err(self.expire(conn));
            }
        };

        let expires_at = token_expiry(&record).or_else(|| legacy_expiry(&record));
        let valid = {
            let mut session = conn.session();
            session.expires_at = expires_at;
            session.last_checked = Some(Instant::now());
            session.is_valid(Utc::now())
        };
        if valid {
            Ok(())
        } else {
            Err(self.expire(conn))
        }
    }

    fn expire(&self, conn: &ClientConnection) -> GatewayError {
        conn.session().expired = true;
        debug!(conn_id = %conn.id, user = %conn.user(), "Session expired");
        conn.emit(REAUTHENTICATE_EVENT, vec![]);
        GatewayError::SessionExpired
    }

    /// Tear a connection down; repeated calls are no-ops
    pub async fn disconnect(&self, conn: &ClientConnection) {
        if self.connections.remove(conn.id).is_none() {
            return;
        }
        conn.set_auth_state(AuthState::Disconnected);
        self.registry.unsubscribe_all(conn).await;
        conn.clear_timers();

        let user = conn.user();
        self.hooks.on_disconnect(conn.id, &user);
        info!(conn_id = %conn.id, user = %user, "Connection closed");
        self.schedule_clients_update();
    }

    /// Publish the connected-clients list after the debounce delay
    pub fn schedule_clients_update(&self) {
        let mut timer = self.clients_timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        let connections = self.connections.clone();
        let hooks = self.hooks.clone();
        let delay = self.config.clients_debounce();
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let names = connections.client_names();
            debug!(clients = names.len(), "Connected clients changed");
            hooks.on_clients_changed(&names);
        }));
    }

    pub fn shutdown(&self) {
        if let Some(timer) = self.clients_timer.lock().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{Grants, IpWhitelist, OpGrants, ADMIN_USER};
    use crate::backend::MemoryBackend;
    use crate::server::relay::InstanceMessageRelay;
    use serde_json::json;
    use std::net::IpAddr;
    use std::time::Duration;

    struct Fixture {
        lifecycle: ConnectionLifecycle,
        mem: Arc<MemoryBackend>,
    }

    fn fixture(config: GatewayConfig) -> Fixture {
        let mem = Arc::new(MemoryBackend::new());
        let backend = Backend::from_memory(mem.clone());
        let relay = Arc::new(InstanceMessageRelay::new(backend.messenger.clone()));
        let registry = Arc::new(SubscriptionRegistry::new(backend.store.clone(), relay));
        let lifecycle = ConnectionLifecycle::new(
            Arc::new(config),
            backend,
            Arc::new(PermissionTable::standard()),
            ConnectionManager::new(),
            registry,
            Arc::new(crate::server::hooks::NoopHooks),
        );
        Fixture { lifecycle, mem }
    }

    fn auth_config() -> GatewayConfig {
        GatewayConfig {
            auth: true,
            ..GatewayConfig::default()
        }
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_auth_disabled_uses_default_user() {
        let f = fixture(GatewayConfig::default());
        let (conn, _rx) = f.lifecycle.open(TransportInfo::new());
        f.lifecycle.authenticate(&conn).await.unwrap();

        assert_eq!(conn.user(), ADMIN_USER);
        assert_eq!(conn.auth_state(), AuthState::Authenticated { secure: false });
        assert!(conn.acl().is_authenticated());
    }

    #[tokio::test]
    async fn test_token_auth_is_secure() {
        let f = fixture(auth_config());
        let exp = (Utc::now() + chrono::Duration::hours(1)).timestamp_millis();
        f.mem.insert_session("a:tok1", json!({"user": "admin", "aExp": exp}));

        let (conn, _rx) = f
            .lifecycle
            .open(TransportInfo::new().with_cookie_header("access_token=tok1"));
        f.lifecycle.authenticate(&conn).await.unwrap();

        assert!(conn.is_secure());
        assert_eq!(conn.session().key.as_deref(), Some("a:tok1"));
        assert!(conn.session().expires_at.is_some());
    }

    #[tokio::test]
    async fn test_legacy_session_requires_passport_user() {
        let f = fixture(auth_config());
        f.mem.insert_session(
            "sid-ok",
            json!({"passport": {"user": "admin"}, "cookie": {"expires": "2999-01-01T00:00:00Z"}}),
        );
        f.mem.insert_session("sid-anon", json!({"cookie": {}}));

        let (ok, _rx) = f.lifecycle.open(TransportInfo::new().with_session_id("sid-ok"));
        f.lifecycle.authenticate(&ok).await.unwrap();
        assert_eq!(ok.auth_state(), AuthState::Authenticated { secure: false });

        let (anon, mut rx) = f.lifecycle.open(TransportInfo::new().with_session_id("sid-anon"));
        assert!(f.lifecycle.authenticate(&anon).await.is_err());
        assert_eq!(anon.auth_state(), AuthState::Failed);
        assert_eq!(
            drain(&mut rx),
            vec![OutboundMessage::event(REAUTHENTICATE_EVENT, vec![]), OutboundMessage::Close]
        );
    }

    #[tokio::test]
    async fn test_failed_auth_without_explicit_disconnect_keeps_socket() {
        let f = fixture(auth_config());
        let (conn, mut rx) = f.lifecycle.open(TransportInfo::new().closes_itself());
        let err = f.lifecycle.authenticate(&conn).await.unwrap_err();

        assert!(matches!(err, GatewayError::AuthenticationFailure(_)));
        assert_eq!(drain(&mut rx), vec![OutboundMessage::event(REAUTHENTICATE_EVENT, vec![])]);
    }

    #[tokio::test]
    async fn test_session_store_error_fails_attempt() {
        let f = fixture(auth_config());
        f.mem.fail_sessions(true);
        let (conn, _rx) = f.lifecycle.open(TransportInfo::new().with_authorization("Bearer tok"));
        assert!(f.lifecycle.authenticate(&conn).await.is_err());
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_whitelist_overrides_user_then_narrows() {
        let mut whitelist = IpWhitelist::new();
        whitelist.insert(
            "192.168.1.*",
            WhitelistEntry {
                user: "guest".to_string(),
                object: OpGrants::all(),
                state: OpGrants::read_only(),
                file: OpGrants::none(),
            },
        );
        let f = fixture(GatewayConfig {
            whitelist,
            ..GatewayConfig::default()
        });
        f.mem.set_user("system.user.guest", vec!["system.group.user".into()], Grants::all());

        let addr: IpAddr = "::ffff:192.168.1.40".parse().unwrap();
        let (conn, _rx) = f.lifecycle.open(TransportInfo::new().with_remote_addr(addr));
        f.lifecycle.authenticate(&conn).await.unwrap();

        assert_eq!(conn.user(), "system.user.guest");
        let acl = conn.acl();
        let grants = acl.grants().unwrap();
        assert!(grants.state.read);
        assert!(!grants.state.write);
        assert!(!grants.file.read);
        assert!(grants.object.write);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_requery_is_throttled() {
        let f = fixture(auth_config());
        let exp = (Utc::now() + chrono::Duration::hours(1)).timestamp_millis();
        f.mem.insert_session("a:tok", json!({"user": "admin", "aExp": exp}));
        let (conn, mut rx) = f.lifecycle.open(TransportInfo::new().with_authorization("Bearer tok"));
        f.lifecycle.authenticate(&conn).await.unwrap();
        f.mem.clear_calls();

        f.lifecycle.check_fresh(&conn).await.unwrap();
        assert!(f.mem.calls().is_empty());

        f.mem.remove_session("a:tok");
        tokio::time::advance(Duration::from_secs(61)).await;
        let err = f.lifecycle.check_fresh(&conn).await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionExpired));
        assert!(conn.session().expired);
        assert_eq!(drain(&mut rx), vec![OutboundMessage::event(REAUTHENTICATE_EVENT, vec![])]);

        // Still open, still failing
        assert!(conn.is_authenticated());
        assert!(f.lifecycle.check_fresh(&conn).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let f = fixture(GatewayConfig::default());
        let (conn, _rx) = f.lifecycle.open(TransportInfo::new());
        f.lifecycle.authenticate(&conn).await.unwrap();

        f.lifecycle.disconnect(&conn).await;
        f.lifecycle.disconnect(&conn).await;
        assert_eq!(conn.auth_state(), AuthState::Disconnected);
        assert_eq!(f.lifecycle.connections.count(), 0);
    }
}
