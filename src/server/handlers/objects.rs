use super::{pattern_list, subscribe_patterns, unsubscribe_patterns};
use crate::error::{GatewayError, Result};
use crate::patterns::SubscriptionType;
use crate::server::router::{handler, CommandContext, CommandRouter};
use serde_json::{json, Map, Value};

pub(super) fn register(router: &CommandRouter) {
    router.add_command_handler("getObject", handler(get_object), None);
    router.add_command_handler("getObjects", handler(get_objects), None);
    router.add_command_handler("getForeignObjects", handler(get_foreign_objects), None);
    router.add_command_handler("setObject", handler(set_object), None);
    router.add_command_handler("extendObject", handler(extend_object), None);
    router.add_command_handler("delObject", handler(del_object), None);
    router.add_command_handler("getObjectView", handler(get_object_view), None);
    router.add_command_handler("getHostByIp", handler(get_host_by_ip), None);
    router.add_command_handler("subscribeObjects", handler(subscribe_objects), None);
    router.add_command_handler("unsubscribeObjects", handler(unsubscribe_objects), None);
}

async fn get_object(ctx: CommandContext) -> Result<Vec<Value>> {
    let id = ctx.str_arg(0)?;
    let obj = ctx
        .services
        .backend
        .store
        .get_object(id, &ctx.conn.call_context())
        .await?;
    Ok(vec![obj.unwrap_or(Value::Null)])
}

async fn get_objects(ctx: CommandContext) -> Result<Vec<Value>> {
    let objects = ctx
        .services
        .backend
        .store
        .get_objects("*", &ctx.conn.call_context())
        .await?;
    Ok(vec![Value::Object(objects)])
}

/// `getForeignObjects(pattern, type?)`
async fn get_foreign_objects(ctx: CommandContext) -> Result<Vec<Value>> {
    let pattern = ctx.opt_str(0).unwrap_or("*");
    let mut objects = ctx
        .services
        .backend
        .store
        .get_objects(pattern, &ctx.conn.call_context())
        .await?;
    if let Some(kind) = ctx.opt_str(1) {
        objects.retain(|_, obj| obj.get("type").and_then(Value::as_str) == Some(kind));
    }
    Ok(vec![Value::Object(objects)])
}

async fn set_object(ctx: CommandContext) -> Result<Vec<Value>> {
    let id = ctx.str_arg(0)?;
    let obj = match ctx.arg(1) {
        Some(obj @ Value::Object(_)) => obj.clone(),
        _ => return Err(GatewayError::validation("setObject: object required")),
    };
    ctx.services
        .backend
        .store
        .set_object(id, obj, &ctx.conn.call_context())
        .await?;
    Ok(vec![json!({ "id": id })])
}

/// Deep merge; `null` in the patch removes the key
fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge_json(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

async fn extend_object(ctx: CommandContext) -> Result<Vec<Value>> {
    let id = ctx.str_arg(0)?;
    let patch = match ctx.arg(1) {
        Some(patch @ Value::Object(_)) => patch.clone(),
        _ => return Err(GatewayError::validation("extendObject: object required")),
    };
    let call = ctx.conn.call_context();
    let store = &ctx.services.backend.store;

    let mut obj = store.get_object(id, &call).await?.unwrap_or_else(|| json!({}));
    merge_json(&mut obj, &patch);
    store.set_object(id, obj.clone(), &call).await?;
    Ok(vec![json!({ "id": id, "value": obj })])
}

async fn del_object(ctx: CommandContext) -> Result<Vec<Value>> {
    let id = ctx.str_arg(0)?;
    ctx.services
        .backend
        .store
        .del_object(id, &ctx.conn.call_context())
        .await?;
    Ok(vec![])
}

/// `getObjectView(design, search, params)`
async fn get_object_view(ctx: CommandContext) -> Result<Vec<Value>> {
    let design = ctx.str_arg(0)?;
    let search = ctx.str_arg(1)?;
    let params = ctx.arg(2).cloned().unwrap_or_else(|| json!({}));
    let view = ctx
        .services
        .backend
        .store
        .get_object_view(design, search, params, &ctx.conn.call_context())
        .await?;
    Ok(vec![view])
}

fn host_has_ip(host: &Value, ip: &str) -> bool {
    let common = &host["common"];
    if common["hostname"].as_str() == Some(ip) {
        return true;
    }
    if let Some(addresses) = common["address"].as_array() {
        if addresses.iter().any(|a| a.as_str() == Some(ip)) {
            return true;
        }
    }
    host["native"]["hardware"]["networkInterfaces"]
        .as_object()
        .map(|ifaces| {
            ifaces
                .values()
                .filter_map(Value::as_array)
                .flatten()
                .any(|addr| addr["address"].as_str() == Some(ip))
        })
        .unwrap_or(false)
}

/// Find the host object that owns an address
async fn get_host_by_ip(ctx: CommandContext) -> Result<Vec<Value>> {
    let ip = ctx.str_arg(0)?;
    let hosts: Map<String, Value> = ctx
        .services
        .backend
        .store
        .get_objects("system.host.*", &ctx.conn.call_context())
        .await?;
    let found = hosts
        .into_iter()
        .filter(|(id, _)| id.strip_prefix("system.host.").is_some_and(|name| !name.contains('.')))
        .find(|(_, host)| host_has_ip(host, ip));
    Ok(match found {
        Some((id, host)) => vec![json!(ip), json!({ "_id": id, "common": host["common"], "native": host["native"] })],
        None => vec![json!(ip), Value::Null],
    })
}

async fn subscribe_objects(ctx: CommandContext) -> Result<Vec<Value>> {
    let patterns = pattern_list(&ctx, 0)?;
    subscribe_patterns(&ctx, SubscriptionType::ObjectChange, patterns).await;
    Ok(vec![])
}

async fn unsubscribe_objects(ctx: CommandContext) -> Result<Vec<Value>> {
    let patterns = pattern_list(&ctx, 0)?;
    unsubscribe_patterns(&ctx, SubscriptionType::ObjectChange, patterns).await;
    Ok(vec![])
}
