use super::{pattern_list, subscribe_patterns, unsubscribe_patterns};
use crate::error::Result;
use crate::patterns::SubscriptionType;
use crate::server::router::{handler, CommandContext, CommandRouter};
use serde_json::{json, Map, Value};

pub(super) fn register(router: &CommandRouter) {
    router.add_command_handler("getState", handler(get_state), None);
    router.add_command_handler("getStates", handler(get_states), None);
    router.add_command_handler("getForeignStates", handler(get_states), None);
    router.add_command_handler("setState", handler(set_state), None);
    router.add_command_handler("delState", handler(del_state), None);
    router.add_command_handler("createState", handler(create_state), None);
    router.add_command_handler("getStateHistory", handler(get_state_history), None);
    router.add_command_handler("subscribe", handler(subscribe), None);
    router.add_command_handler("unsubscribe", handler(unsubscribe), None);
}

async fn get_state(ctx: CommandContext) -> Result<Vec<Value>> {
    let id = ctx.str_arg(0)?;
    let state = ctx
        .services
        .backend
        .store
        .get_state(id, &ctx.conn.call_context())
        .await?;
    Ok(vec![state.unwrap_or(Value::Null)])
}

async fn get_states(ctx: CommandContext) -> Result<Vec<Value>> {
    let pattern = ctx.opt_str(0).unwrap_or("*");
    let states = ctx
        .services
        .backend
        .store
        .get_states(pattern, &ctx.conn.call_context())
        .await?;
    Ok(vec![Value::Object(states)])
}

/// Bare values are written as `{val: x}`
fn normalize_state(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Object(obj)) if obj.contains_key("val") => Value::Object(obj.clone()),
        Some(other) => json!({ "val": other }),
        None => json!({ "val": Value::Null }),
    }
}

async fn set_state(ctx: CommandContext) -> Result<Vec<Value>> {
    let id = ctx.str_arg(0)?;
    let state = normalize_state(ctx.args.get(1));
    ctx.services
        .backend
        .store
        .set_state(id, state, &ctx.conn.call_context())
        .await?;
    Ok(vec![json!(id)])
}

async fn del_state(ctx: CommandContext) -> Result<Vec<Value>> {
    let id = ctx.str_arg(0)?;
    ctx.services
        .backend
        .store
        .del_state(id, &ctx.conn.call_context())
        .await?;
    Ok(vec![])
}

/// Create the state object and, if `common.def` is set, its initial value
async fn create_state(ctx: CommandContext) -> Result<Vec<Value>> {
    let id = ctx.str_arg(0)?;
    let common = match ctx.arg(1) {
        Some(Value::Object(common)) => common.clone(),
        _ => Map::new(),
    };
    let initial = common.get("def").cloned();
    let call = ctx.conn.call_context();
    let store = &ctx.services.backend.store;

    store
        .set_object(id, json!({ "type": "state", "common": common, "native": {} }), &call)
        .await?;
    if let Some(def) = initial {
        store.set_state(id, json!({ "val": def, "ack": true }), &call).await?;
    }
    Ok(vec![json!(id)])
}

/// Ask a history instance for a state's recorded values
async fn get_state_history(ctx: CommandContext) -> Result<Vec<Value>> {
    let id = ctx.str_arg(0)?;
    let options = ctx.arg(1).cloned().unwrap_or_else(|| json!({}));
    let instance = options
        .get("instance")
        .and_then(Value::as_str)
        .unwrap_or("history.0")
        .to_string();

    let answer = ctx
        .services
        .backend
        .messenger
        .request(&instance, "getHistory", json!({ "id": id, "options": options }))
        .await?;
    Ok(vec![answer])
}

async fn subscribe(ctx: CommandContext) -> Result<Vec<Value>> {
    let patterns = pattern_list(&ctx, 0)?;
    subscribe_patterns(&ctx, SubscriptionType::StateChange, patterns).await;
    Ok(vec![])
}

async fn unsubscribe(ctx: CommandContext) -> Result<Vec<Value>> {
    let patterns = pattern_list(&ctx, 0)?;
    unsubscribe_patterns(&ctx, SubscriptionType::StateChange, patterns).await;
    Ok(vec![])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_state() {
        assert_eq!(normalize_state(Some(&json!(21.5))), json!({"val": 21.5}));
        assert_eq!(
            normalize_state(Some(&json!({"val": true, "ack": false}))),
            json!({"val": true, "ack": false})
        );
        assert_eq!(normalize_state(Some(&json!({"on": 1}))), json!({"val": {"on": 1}}));
        assert_eq!(normalize_state(None), json!({"val": null}));
    }
}
