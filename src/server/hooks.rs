//! Callbacks into the embedding adapter

use uuid::Uuid;

/// Notifications the gateway raises towards its host process.
///
/// Every method has a no-op default.
pub trait GatewayHooks: Send + Sync {
    /// A connection finished its teardown
    fn on_disconnect(&self, _conn_id: Uuid, _user: &str) {}

    /// Burst protection switched on (`true`) or off (`false`)
    fn on_threshold_changed(&self, _active: bool) {}

    /// Debounced list of connected client names
    fn on_clients_changed(&self, _clients: &[String]) {}
}

/// Hooks that ignore everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl GatewayHooks for NoopHooks {}
