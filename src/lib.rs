//! Socketgate - realtime client gateway for a home-automation state store
//!
//! Bridges many concurrent client connections to a shared state/object/file
//! store: authenticates connections, gates every command through a
//! permission table, multiplexes pattern subscriptions onto one backend
//! subscription set and shields the backend from state change storms.

pub mod acl;
pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod patterns;
pub mod server;

pub use acl::{Acl, Grants, PermissionDescriptor, PermissionTable};
pub use backend::{Backend, BackendError, MemoryBackend};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use patterns::SubscriptionType;
pub use server::{ClientConnection, Gateway, GatewayHooks, OutboundMessage, Reply, Response, TransportInfo};
