//! Gateway wiring
//!
//! `Gateway` owns every component and is the only type a transport talks to:
//!
//! ```text
//! transport --connect/accept--> ConnectionLifecycle --> ClientConnection
//! transport --handle_command--> CommandRouter --> handlers --> Backend
//! backend   --on_*_change-----> BurstGuard + SubscriptionRegistry --> clients
//! ```

use crate::acl::{PermissionDescriptor, PermissionTable};
use crate::backend::Backend;
use crate::config::GatewayConfig;
use crate::patterns::SubscriptionType;
use crate::server::burst::BurstGuard;
use crate::server::cache::ResultCache;
use crate::server::connections::{ClientConnection, ConnectionManager, OutboundMessage, TransportInfo};
use crate::server::handlers::{register_defaults, Services};
use crate::server::hooks::GatewayHooks;
use crate::server::lifecycle::ConnectionLifecycle;
use crate::server::relay::InstanceMessageRelay;
use crate::server::router::{CommandHandler, CommandRouter, Reply};
use crate::server::subscriptions::SubscriptionRegistry;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct Gateway {
    services: Arc<Services>,
    router: Arc<CommandRouter>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, backend: Backend, hooks: Arc<dyn GatewayHooks>) -> Self {
        let config = Arc::new(config);
        let table = Arc::new(PermissionTable::standard());
        let connections = ConnectionManager::new();

        let relay = Arc::new(InstanceMessageRelay::new(backend.messenger.clone()));
        let registry = Arc::new(
            SubscriptionRegistry::new(backend.store.clone(), relay.clone())
                .with_system_pattern(config.burst.system_pattern.clone()),
        );
        let burst = Arc::new(BurstGuard::new(
            config.burst.clone(),
            registry.clone(),
            backend.store.clone(),
            hooks.clone(),
        ));
        let cache = Arc::new(ResultCache::new(config.cache.clone()));
        let lifecycle = Arc::new(ConnectionLifecycle::new(
            config.clone(),
            backend.clone(),
            table.clone(),
            connections.clone(),
            registry.clone(),
            hooks,
        ));

        let router = Arc::new(CommandRouter::new(table.clone()));
        register_defaults(&router);

        let services = Arc::new(Services {
            config,
            backend,
            table,
            connections,
            registry,
            relay,
            cache,
            burst,
            lifecycle,
        });
        Self { services, router }
    }

    /// Start background tasks
    pub fn start(&self) {
        self.services.burst.spawn();
        info!(
            auth = self.services.config.auth,
            instance = %self.services.config.instance,
            "Gateway started"
        );
    }

    /// Open a connection and resolve its identity before returning.
    ///
    /// On failure the receiver already holds `reauthenticate` (and `Close`
    /// when the transport needs it); check `ClientConnection::auth_state`.
    pub async fn connect(&self, transport: TransportInfo) -> (Arc<ClientConnection>, mpsc::Receiver<OutboundMessage>) {
        let (conn, rx) = self.services.lifecycle.open(transport);
        // Failures are reported to the client by the lifecycle
        let _ = self.services.lifecycle.authenticate(&conn).await;
        (conn, rx)
    }

    /// Open a connection and resolve its identity in the background.
    ///
    /// Commands may arrive right away; `authenticate` waits for the outcome.
    pub fn accept(&self, transport: TransportInfo) -> (Arc<ClientConnection>, mpsc::Receiver<OutboundMessage>) {
        let (conn, rx) = self.services.lifecycle.open(transport);
        let lifecycle = self.services.lifecycle.clone();
        let pending = conn.clone();
        // Aborted with the connection's other timers on disconnect
        conn.add_timer(tokio::spawn(async move {
            let _ = lifecycle.authenticate(&pending).await;
        }));
        (conn, rx)
    }

    pub async fn handle_command(
        &self,
        conn: &Arc<ClientConnection>,
        command: &str,
        args: Vec<Value>,
        reply: Option<Reply>,
    ) {
        self.router
            .dispatch(&self.services, conn, command, args, reply)
            .await;
    }

    pub async fn disconnect(&self, conn: &ClientConnection) {
        self.services.lifecycle.disconnect(conn).await;
    }

    /// Feed a backend state change; returns how many connections got it
    pub fn on_state_change(&self, id: &str, state: &Value) -> usize {
        self.services.burst.record_event();
        self.fan_out(SubscriptionType::StateChange, id, state)
    }

    pub fn on_object_change(&self, id: &str, obj: &Value) -> usize {
        self.fan_out(SubscriptionType::ObjectChange, id, obj)
    }

    pub fn on_log(&self, entry: &Value) -> usize {
        self.fan_out(SubscriptionType::Log, "", entry)
    }

    pub fn on_file_change(&self, id: &str, file: &str, size: Option<u64>) -> usize {
        let registry = &self.services.registry;
        self.services
            .connections
            .all()
            .iter()
            .filter(|conn| registry.publish_file(conn, id, file, size))
            .count()
    }

    fn fan_out(&self, kind: SubscriptionType, id: &str, payload: &Value) -> usize {
        let registry = &self.services.registry;
        let delivered = self
            .services
            .connections
            .all()
            .iter()
            .filter(|conn| registry.publish(conn, kind, id, payload))
            .count();
        if delivered == 0 {
            debug!(kind = %kind, id = id, "No subscribers for event");
        }
        delivered
    }

    /// Deliver an instance's message to connection `sid`
    pub async fn publish_instance_message(&self, sid: Uuid, source: &str, msg_type: &str, data: Value) -> bool {
        let relay = &self.services.relay;
        match self.services.connections.get(sid) {
            Some(conn) => relay.publish_instance_message(&conn, source, msg_type, data).await,
            None => {
                relay.no_subscriber(source, sid, msg_type).await;
                false
            }
        }
    }

    /// Emit an event to every connection
    pub fn broadcast(&self, name: &str, args: &[Value]) -> usize {
        self.services.connections.broadcast(name, args)
    }

    pub fn add_command_handler(
        &self,
        command: impl Into<String>,
        handler: CommandHandler,
        descriptor: Option<PermissionDescriptor>,
    ) {
        self.router.add_command_handler(command, handler, descriptor);
    }

    pub fn add_path_command_handler(
        &self,
        path: impl Into<String>,
        command: impl Into<String>,
        handler: CommandHandler,
        descriptor: Option<PermissionDescriptor>,
    ) {
        self.router
            .add_path_command_handler(path, command, handler, descriptor);
    }

    pub fn get_command_handler(&self, command: &str, path: Option<&str>) -> Option<CommandHandler> {
        self.router.get_command_handler(command, path)
    }

    /// Subscribe on behalf of the gateway itself rather than a client
    pub async fn subscribe(&self, kind: SubscriptionType, pattern: &str, aux: Option<&str>) {
        self.services.registry.subscribe(None, kind, pattern, aux).await;
    }

    pub async fn unsubscribe(&self, kind: SubscriptionType, pattern: Option<&str>, aux: Option<&str>) {
        self.services
            .registry
            .unsubscribe(None, kind, pattern, aux)
            .await;
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.services.connections
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.services.registry
    }

    pub fn burst(&self) -> &Arc<BurstGuard> {
        &self.services.burst
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.services.cache
    }

    pub fn relay(&self) -> &Arc<InstanceMessageRelay> {
        &self.services.relay
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.services.config
    }

    /// Disconnect every client and stop background tasks
    pub async fn shutdown(&self) {
        for conn in self.services.connections.all() {
            self.services.lifecycle.disconnect(&conn).await;
            conn.close();
        }
        self.services.burst.shutdown();
        self.services.cache.shutdown();
        self.services.lifecycle.shutdown();
        info!("Gateway stopped");
    }
}
