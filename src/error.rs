//! Gateway error types
//!
//! Every error that reaches a client reply is flattened to its display
//! string; the wire shape is always `(errorStringOrNull, ...results)`.

use crate::acl::{Operation, ResourceType};
use crate::backend::BackendError;
use serde_json::{json, Value};
use thiserror::Error;

/// Token sent to a reply callback when a command is denied
pub const PERMISSION_ERROR: &str = "permissionError";

/// Event name carrying a denial when the caller supplied no callback
pub const PERMISSION_ERROR_EVENT: &str = "permissionError";

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Unknown command or insufficient ACL
    #[error("{}", PERMISSION_ERROR)]
    PermissionDenied {
        command: String,
        resource: ResourceType,
        operation: Operation,
    },

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("session expired")]
    SessionExpired,

    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("{0}")]
    Backend(#[from] BackendError),

    /// Rejected before any side effect
    #[error("{0}")]
    Validation(String),

    #[error("timeout")]
    Timeout,
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GatewayError::Validation(msg.into())
    }

    /// Payload of the `permissionError` event sent when a denied command had no callback
    pub fn to_event(&self, args: &[Value]) -> Value {
        match self {
            GatewayError::PermissionDenied {
                command,
                resource,
                operation,
            } => json!({
                "command": command,
                "type": resource,
                "operation": operation,
                "args": args,
            }),
            other => json!({ "error": other.to_string(), "args": args }),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_displays_token() {
        let err = GatewayError::PermissionDenied {
            command: "getState".to_string(),
            resource: ResourceType::State,
            operation: Operation::Read,
        };
        assert_eq!(err.to_string(), PERMISSION_ERROR);
        assert_eq!(
            err.to_event(&[json!("a.b")]),
            json!({"command": "getState", "type": "state", "operation": "read", "args": ["a.b"]})
        );
    }

    #[test]
    fn test_backend_error_message_passes_through() {
        let err: GatewayError = BackendError::NotExists("vis.0/main.css".to_string()).into();
        assert_eq!(err.to_string(), "Not exists");
    }

    #[test]
    fn test_validation_display() {
        assert_eq!(GatewayError::validation("id is empty").to_string(), "id is empty");
        assert_eq!(GatewayError::Timeout.to_string(), "timeout");
    }
}
