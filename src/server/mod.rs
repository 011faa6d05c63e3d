//! Gateway server implementation
//!
//! Connection lifecycle, command routing, subscription fan-out, burst
//! protection and the host result cache.

pub mod burst;
pub mod cache;
mod connections;
mod gateway;
pub mod handlers;
mod hooks;
pub mod lifecycle;
pub mod relay;
pub mod router;
pub mod subscriptions;

pub use burst::BurstGuard;
pub use cache::ResultCache;
pub use connections::{
    AuthState, ClientConnection, ConnectionManager, ConnectionSubscriptions, Identity, OutboundMessage, SessionInfo,
    TransportInfo, REAUTHENTICATE_EVENT,
};
pub use gateway::Gateway;
pub use hooks::{GatewayHooks, NoopHooks};
pub use lifecycle::ConnectionLifecycle;
pub use relay::{InstanceMessageRelay, INSTANCE_MESSAGE_EVENT};
pub use router::{handler, CommandContext, CommandHandler, CommandRouter, Reply, Response};
pub use subscriptions::SubscriptionRegistry;
