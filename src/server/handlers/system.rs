use crate::error::{GatewayError, Result};
use crate::patterns::SubscriptionType;
use crate::server::connections::AuthState;
use crate::server::router::{handler, CommandContext, CommandRouter, AUTHENTICATE};
use serde_json::{json, Value};
use tracing::info;

/// Optional capabilities clients can query with `checkFeatureSupported`
const SUPPORTED_FEATURES: &[&str] = &["INSTANCE_MESSAGES", "FILE_SUBSCRIPTIONS", "READ_DIR_AS_ZIP", "PERMISSION_EVENTS"];

pub(super) fn register(router: &CommandRouter) {
    router.add_command_handler(AUTHENTICATE, handler(authenticate), None);
    router.add_command_handler("authEnabled", handler(auth_enabled), None);
    router.add_command_handler("getVersion", handler(get_version), None);
    router.add_command_handler("getAdapterName", handler(get_adapter_name), None);
    router.add_command_handler("getCurrentInstance", handler(get_current_instance), None);
    router.add_command_handler("checkFeatureSupported", handler(check_feature_supported), None);
    router.add_command_handler("listPermissions", handler(list_permissions), None);
    router.add_command_handler("getUserPermissions", handler(get_user_permissions), None);
    router.add_command_handler("name", handler(name), None);
    router.add_command_handler("requireLog", handler(require_log), None);
    router.add_command_handler("disconnect", handler(disconnect), None);
    router.add_command_handler("logout", handler(disconnect), None);
}

/// Answers `[authenticated, secure]` once identity resolution has settled
async fn authenticate(ctx: CommandContext) -> Result<Vec<Value>> {
    let state = match ctx.conn.auth_state() {
        AuthState::Connecting | AuthState::Authenticating => ctx.conn.wait_authenticated().await,
        settled => settled,
    };
    Ok(match state {
        AuthState::Authenticated { secure } => vec![json!(true), json!(secure)],
        _ => vec![json!(false), json!(false)],
    })
}

/// `[authEnabled, userWithoutPrefix]`
async fn auth_enabled(ctx: CommandContext) -> Result<Vec<Value>> {
    let user = ctx.conn.user();
    let short = user.strip_prefix("system.user.").unwrap_or(&user).to_string();
    Ok(vec![json!(ctx.services.config.auth), json!(short)])
}

async fn get_version(_ctx: CommandContext) -> Result<Vec<Value>> {
    Ok(vec![json!(env!("CARGO_PKG_VERSION"))])
}

async fn get_adapter_name(ctx: CommandContext) -> Result<Vec<Value>> {
    Ok(vec![json!(ctx.services.config.adapter_name)])
}

async fn get_current_instance(ctx: CommandContext) -> Result<Vec<Value>> {
    Ok(vec![json!(ctx.services.config.instance)])
}

async fn check_feature_supported(ctx: CommandContext) -> Result<Vec<Value>> {
    let feature = ctx.str_arg(0)?;
    Ok(vec![json!(SUPPORTED_FEATURES.contains(&feature))])
}

async fn list_permissions(ctx: CommandContext) -> Result<Vec<Value>> {
    Ok(vec![ctx.services.table.to_json()])
}

async fn get_user_permissions(ctx: CommandContext) -> Result<Vec<Value>> {
    let acl = ctx.conn.acl();
    let grants = acl.grants().ok_or(GatewayError::NotAuthenticated)?;
    let grants = serde_json::to_value(grants).map_err(|e| GatewayError::validation(e.to_string()))?;
    Ok(vec![json!({ "user": ctx.conn.user(), "groups": ctx.conn.identity().map(|i| i.groups), "acl": grants })])
}

/// Set the display name shown in the connected-clients list
async fn name(ctx: CommandContext) -> Result<Vec<Value>> {
    let name = ctx.opt_str(0).filter(|n| !n.is_empty()).map(str::to_string);
    if ctx.conn.name() != name {
        ctx.conn.set_name(name);
        ctx.services.lifecycle.schedule_clients_update();
    }
    Ok(vec![])
}

/// `requireLog(enabled)`
async fn require_log(ctx: CommandContext) -> Result<Vec<Value>> {
    let enabled = ctx.arg(0).and_then(Value::as_bool).unwrap_or(false);
    let registry = &ctx.services.registry;
    if enabled {
        registry.subscribe(Some(ctx.conn.as_ref()), SubscriptionType::Log, "", None).await;
    } else {
        registry.unsubscribe(Some(ctx.conn.as_ref()), SubscriptionType::Log, None, None).await;
    }
    Ok(vec![])
}

async fn disconnect(ctx: CommandContext) -> Result<Vec<Value>> {
    info!(conn_id = %ctx.conn.id, command = %ctx.command, "Client asked to disconnect");
    ctx.services.lifecycle.disconnect(&ctx.conn).await;
    ctx.conn.close();
    Ok(vec![])
}
