use crate::error::{GatewayError, Result};
use crate::server::router::{handler, CommandContext, CommandRouter};
use serde_json::{json, Value};
use tracing::{debug, warn};

pub(super) fn register(router: &CommandRouter) {
    router.add_command_handler("sendTo", handler(send_to), None);
    router.add_command_handler("sendToHost", handler(send_to_host), None);
    router.add_command_handler("cmdExec", handler(cmd_exec), None);
    router.add_command_handler("readLogs", handler(read_logs), None);
    router.add_command_handler("httpGet", handler(http_get), None);
    router.add_command_handler("clientSubscribe", handler(client_subscribe), None);
    router.add_command_handler("clientUnsubscribe", handler(client_unsubscribe), None);
}

/// `sendTo(instance, command, message)`
async fn send_to(ctx: CommandContext) -> Result<Vec<Value>> {
    let instance = ctx.str_arg(0)?;
    let command = ctx.str_arg(1)?;
    let message = ctx.arg(2).cloned().unwrap_or(Value::Null);
    let answer = ctx
        .services
        .backend
        .messenger
        .request(instance, command, message)
        .await?;
    Ok(vec![answer])
}

/// Host round trip through the result cache, bounded by the host timeout
async fn host_request(ctx: &CommandContext, host: &str, command: &str, message: Value) -> Result<Value> {
    let services = &ctx.services;
    let messenger = services.backend.messenger.clone();
    let round_trip = services.cache.get(host, command, &message, || {
        messenger.request_host(host, command, message.clone())
    });

    match tokio::time::timeout(services.config.host_timeout(), round_trip).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!(conn_id = %ctx.conn.id, host = host, command = command, "Host did not answer in time");
            Err(GatewayError::Timeout)
        }
    }
}

/// `sendToHost(host, command, message)`
async fn send_to_host(ctx: CommandContext) -> Result<Vec<Value>> {
    let host = ctx.str_arg(0)?;
    let command = ctx.str_arg(1)?;
    let message = ctx.arg(2).cloned().unwrap_or(Value::Null);
    let answer = host_request(&ctx, host, command, message).await?;
    Ok(vec![answer])
}

/// `cmdExec(host, id, cmd)`; output arrives later as host events
async fn cmd_exec(ctx: CommandContext) -> Result<Vec<Value>> {
    let host = ctx.str_arg(0)?;
    let id = ctx.arg(1).cloned().unwrap_or(Value::Null);
    let cmd = ctx.str_arg(2)?;
    debug!(conn_id = %ctx.conn.id, host = host, cmd = cmd, "Executing host command");
    let answer = host_request(&ctx, host, "cmdExec", json!({ "data": cmd, "id": id })).await?;
    Ok(vec![answer])
}

/// `readLogs(host)`
async fn read_logs(ctx: CommandContext) -> Result<Vec<Value>> {
    let host = ctx.str_arg(0)?;
    let answer = host_request(&ctx, host, "getLogs", Value::Null).await?;
    Ok(vec![answer])
}

/// `httpGet(url)` -> `[status, body]`
async fn http_get(ctx: CommandContext) -> Result<Vec<Value>> {
    let url = ctx.str_arg(0)?;
    let response = ctx.services.backend.http.get(url).await?;
    Ok(vec![json!(response.status), json!(response.body)])
}

/// `clientSubscribe(target, type, data)`
async fn client_subscribe(ctx: CommandContext) -> Result<Vec<Value>> {
    let target = ctx.str_arg(0)?;
    let msg_type = ctx.str_arg(1)?;
    let data = ctx.arg(2).cloned().unwrap_or(Value::Null);
    let answer = ctx
        .services
        .relay
        .client_subscribe(&ctx.conn, target, msg_type, data)
        .await?;
    Ok(vec![answer])
}

/// `clientUnsubscribe(target, type)`
async fn client_unsubscribe(ctx: CommandContext) -> Result<Vec<Value>> {
    let target = ctx.str_arg(0)?;
    let msg_type = ctx.str_arg(1)?;
    let removed = ctx
        .services
        .relay
        .client_unsubscribe(&ctx.conn, target, msg_type)
        .await;
    Ok(vec![json!(removed)])
}
