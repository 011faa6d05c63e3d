//! Command routing and permission gating
//!
//! Every inbound command goes through the same steps. Unauthenticated
//! connections may only `authenticate`. Authenticated connections then get
//! a session freshness check, the permission check, and finally the handler.
//! Handlers are looked up in a per-path overlay first, then in the global
//! registry.

use crate::acl::{PermissionDescriptor, PermissionTable};
use crate::error::{GatewayError, Result, PERMISSION_ERROR_EVENT};
use crate::server::connections::ClientConnection;
use crate::server::handlers::Services;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// The only command accepted before authentication completes
pub const AUTHENTICATE: &str = "authenticate";

/// Answer to a command, sent back as `[errorOrNull, ...results]`
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub error: Option<String>,
    pub results: Vec<Value>,
}

impl Response {
    pub fn ok(results: Vec<Value>) -> Self {
        Self { error: None, results }
    }

    pub fn error(error: impl Display) -> Self {
        Self {
            error: Some(error.to_string()),
            results: Vec::new(),
        }
    }

    pub fn from_result(result: Result<Vec<Value>>) -> Self {
        match result {
            Ok(results) => Self::ok(results),
            Err(e) => Self::error(e),
        }
    }

    /// Wire shape
    pub fn to_args(&self) -> Vec<Value> {
        let mut args = Vec::with_capacity(self.results.len() + 1);
        args.push(self.error.clone().map(Value::String).unwrap_or(Value::Null));
        args.extend(self.results.iter().cloned());
        args
    }
}

/// Callback the transport hands in with a command
pub type Reply = Box<dyn FnOnce(Response) + Send>;

fn respond(reply: Option<Reply>, response: Response) {
    if let Some(reply) = reply {
        reply(response);
    }
}

/// Everything a handler gets for one invocation
pub struct CommandContext {
    pub services: Arc<Services>,
    pub conn: Arc<ClientConnection>,
    pub command: String,
    pub args: Vec<Value>,
}

impl CommandContext {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index).filter(|v| !v.is_null())
    }

    /// Required string argument
    pub fn str_arg(&self, index: usize) -> Result<&str> {
        self.arg(index)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::validation(format!("{}: argument {} must be a non-empty string", self.command, index)))
    }

    pub fn opt_str(&self, index: usize) -> Option<&str> {
        self.arg(index).and_then(Value::as_str)
    }
}

pub type CommandHandler = Arc<dyn Fn(CommandContext) -> BoxFuture<'static, Result<Vec<Value>>> + Send + Sync>;

/// Wrap an async fn as a `CommandHandler`
pub fn handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Value>>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

#[derive(Clone)]
struct Route {
    handler: CommandHandler,
    /// Overrides the static table when set
    descriptor: Option<PermissionDescriptor>,
}

pub struct CommandRouter {
    table: Arc<PermissionTable>,
    routes: RwLock<HashMap<String, Route>>,
    /// Transport path -> command -> route
    path_routes: RwLock<HashMap<String, HashMap<String, Route>>>,
}

impl CommandRouter {
    pub fn new(table: Arc<PermissionTable>) -> Self {
        Self {
            table,
            routes: RwLock::new(HashMap::new()),
            path_routes: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a global handler
    pub fn add_command_handler(
        &self,
        command: impl Into<String>,
        handler: CommandHandler,
        descriptor: Option<PermissionDescriptor>,
    ) {
        self.routes
            .write()
            .insert(command.into(), Route { handler, descriptor });
    }

    /// Add or replace a handler only for connections accepted on `path`
    pub fn add_path_command_handler(
        &self,
        path: impl Into<String>,
        command: impl Into<String>,
        handler: CommandHandler,
        descriptor: Option<PermissionDescriptor>,
    ) {
        self.path_routes
            .write()
            .entry(path.into())
            .or_default()
            .insert(command.into(), Route { handler, descriptor });
    }

    fn route(&self, command: &str, path: Option<&str>) -> Option<Route> {
        if let Some(path) = path {
            let overlay = self
                .path_routes
                .read()
                .get(path)
                .and_then(|routes| routes.get(command))
                .cloned();
            if overlay.is_some() {
                return overlay;
            }
        }
        self.routes.read().get(command).cloned()
    }

    pub fn get_command_handler(&self, command: &str, path: Option<&str>) -> Option<CommandHandler> {
        self.route(command, path).map(|r| r.handler)
    }

    /// Registered descriptor, falling back to the static table
    pub fn descriptor(&self, command: &str, path: Option<&str>) -> Option<PermissionDescriptor> {
        self.route(command, path)
            .and_then(|r| r.descriptor)
            .or_else(|| self.table.get(command))
    }

    /// Permission check.
    ///
    /// On denial the reply (if any) is consumed with `permissionError`;
    /// without a reply a `permissionError` event is emitted instead.
    pub fn check(&self, conn: &ClientConnection, command: &str, args: &[Value], reply: &mut Option<Reply>) -> bool {
        if conn.is_admin() {
            return true;
        }

        let Some(descriptor) = self.descriptor(command, Some(&conn.transport.path)) else {
            warn!(conn_id = %conn.id, command = command, "Unknown command denied");
            self.deny(conn, command, PermissionDescriptor::open(), args, reply);
            return false;
        };
        if descriptor.is_open() {
            return true;
        }
        if conn.acl().permits(&descriptor) {
            return true;
        }

        debug!(
            conn_id = %conn.id,
            user = %conn.user(),
            command = command,
            resource = %descriptor.resource,
            operation = %descriptor.operation,
            "Permission denied"
        );
        self.deny(conn, command, descriptor, args, reply);
        false
    }

    fn deny(
        &self,
        conn: &ClientConnection,
        command: &str,
        descriptor: PermissionDescriptor,
        args: &[Value],
        reply: &mut Option<Reply>,
    ) {
        let denied = GatewayError::PermissionDenied {
            command: command.to_string(),
            resource: descriptor.resource,
            operation: descriptor.operation,
        };
        match reply.take() {
            Some(reply) => reply(Response::error(denied)),
            None => {
                conn.emit(PERMISSION_ERROR_EVENT, vec![denied.to_event(args)]);
            }
        }
    }

    /// Run one command end to end
    pub async fn dispatch(
        &self,
        services: &Arc<Services>,
        conn: &Arc<ClientConnection>,
        command: &str,
        args: Vec<Value>,
        reply: Option<Reply>,
    ) {
        if command != AUTHENTICATE {
            if !conn.is_authenticated() {
                debug!(conn_id = %conn.id, command = command, "Command before authentication");
                respond(reply, Response::error(GatewayError::NotAuthenticated));
                return;
            }
            if let Err(e) = services.lifecycle.check_fresh(conn).await {
                respond(reply, Response::error(e));
                return;
            }
        }

        let mut reply = reply;
        if !self.check(conn, command, &args, &mut reply) {
            return;
        }

        let Some(handler) = self.get_command_handler(command, Some(&conn.transport.path)) else {
            debug!(conn_id = %conn.id, command = command, "No handler registered");
            respond(
                reply,
                Response::error(GatewayError::validation(format!("{} is not supported", command))),
            );
            return;
        };

        let ctx = CommandContext {
            services: services.clone(),
            conn: conn.clone(),
            command: command.to_string(),
            args,
        };
        let result = handler(ctx).await;
        if let Err(e) = &result {
            debug!(conn_id = %conn.id, command = command, error = %e, "Command failed");
        }
        respond(reply, Response::from_result(result));
    }
}
