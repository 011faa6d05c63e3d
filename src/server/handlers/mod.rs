//! Default command handlers
//!
//! Each submodule registers the commands of one resource class:
//! - `system`: authentication, identity and gateway metadata
//! - `states`: state reads, writes and stateChange subscriptions
//! - `objects`: object reads, writes, views and objectChange subscriptions
//! - `files`: adapter file trees and fileChange subscriptions
//! - `hosts`: instance and host messaging, HTTP fetch, instance message relay

mod files;
mod hosts;
mod objects;
mod states;
mod system;

use crate::acl::PermissionTable;
use crate::backend::Backend;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::patterns::SubscriptionType;
use crate::server::burst::BurstGuard;
use crate::server::cache::ResultCache;
use crate::server::connections::ConnectionManager;
use crate::server::lifecycle::ConnectionLifecycle;
use crate::server::relay::InstanceMessageRelay;
use crate::server::router::{CommandContext, CommandRouter};
use crate::server::subscriptions::SubscriptionRegistry;
use serde_json::Value;
use std::sync::Arc;

/// Shared components handed to every handler
pub struct Services {
    pub config: Arc<GatewayConfig>,
    pub backend: Backend,
    pub table: Arc<PermissionTable>,
    pub connections: ConnectionManager,
    pub registry: Arc<SubscriptionRegistry>,
    pub relay: Arc<InstanceMessageRelay>,
    pub cache: Arc<ResultCache>,
    pub burst: Arc<BurstGuard>,
    pub lifecycle: Arc<ConnectionLifecycle>,
}

/// Install every default handler
pub fn register_defaults(router: &CommandRouter) {
    system::register(router);
    states::register(router);
    objects::register(router);
    files::register(router);
    hosts::register(router);
}

/// A single pattern or an array of patterns
fn pattern_list(ctx: &CommandContext, index: usize) -> Result<Vec<String>> {
    match ctx.arg(index) {
        Some(Value::String(p)) => Ok(vec![p.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| GatewayError::validation(format!("{}: patterns must be strings", ctx.command)))
            })
            .collect(),
        _ => Err(GatewayError::validation(format!("{}: pattern required", ctx.command))),
    }
}

async fn subscribe_patterns(ctx: &CommandContext, kind: SubscriptionType, patterns: Vec<String>) {
    for pattern in patterns {
        ctx.services
            .registry
            .subscribe(Some(ctx.conn.as_ref()), kind, &pattern, None)
            .await;
    }
}

async fn unsubscribe_patterns(ctx: &CommandContext, kind: SubscriptionType, patterns: Vec<String>) {
    for pattern in patterns {
        ctx.services
            .registry
            .unsubscribe(Some(ctx.conn.as_ref()), kind, Some(&pattern), None)
            .await;
    }
}
