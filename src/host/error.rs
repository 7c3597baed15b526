//! Host-side error types.

use std::io;

use thiserror::Error;

use crate::protocol::codes;

/// Result type for host-side plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors surfaced to the host when talking to a plugin.
///
/// Transport failures and errors returned by the plugin share one taxonomy:
/// both end a single operation, and callers usually only distinguish "the
/// subprocess is gone" (see [`PluginError::is_disconnected`]) from
/// everything else.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Failed to spawn the plugin process.
    #[error("failed to spawn plugin process: {0}")]
    SpawnFailed(#[source] io::Error),

    /// Failed to write to plugin stdin.
    #[error("failed to write to plugin: {0}")]
    WriteFailed(#[source] io::Error),

    /// Failed to serialize a request to JSON.
    #[error("failed to serialize request: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// Failed to deserialize a response from JSON.
    #[error("failed to deserialize response: {0}")]
    DeserializeFailed(#[source] serde_json::Error),

    /// The protocol version or magic cookie did not match.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The plugin process exited with the request still in flight.
    #[error("plugin process exited unexpectedly")]
    PluginExited,

    /// Response channel was closed (internal error).
    #[error("response channel closed unexpectedly")]
    ChannelClosed,

    /// The plugin reported a protocol violation (operation before
    /// Initialize, or an unregistered table index).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The table does not support the requested mutation.
    #[error("operation not supported by the table: {0}")]
    Unsupported(String),

    /// Connector code panicked inside the plugin.
    #[error("plugin panicked: {0}")]
    PluginPanic(String),

    /// The plugin rejected the request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The plugin does not know the method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Any other error returned by the plugin.
    #[error("plugin error: {message} (code: {code})")]
    Remote {
        /// Error code from the plugin.
        code: String,
        /// Error message from the plugin.
        message: String,
    },
}

impl PluginError {
    /// Create a remote error from a wire error record.
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Classify a wire error code into a typed variant.
    pub(crate) fn classify(code: &str, message: &str) -> Self {
        match code {
            codes::PROTOCOL_VIOLATION => Self::ProtocolViolation(message.to_string()),
            codes::UNSUPPORTED_OPERATION => Self::Unsupported(message.to_string()),
            codes::PLUGIN_PANIC => Self::PluginPanic(message.to_string()),
            codes::INVALID_REQUEST => Self::InvalidRequest(message.to_string()),
            codes::METHOD_NOT_FOUND => Self::MethodNotFound(message.to_string()),
            codes::HANDSHAKE_MISMATCH | codes::HANDSHAKE_REQUIRED => {
                Self::HandshakeFailed(message.to_string())
            }
            codes::PLUGIN_EXITED => Self::PluginExited,
            _ => Self::remote(code, message),
        }
    }

    /// Whether this error means the subprocess connection is dead.
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            Self::PluginExited | Self::ChannelClosed | Self::SpawnFailed(_) | Self::WriteFailed(_)
        )
    }
}

impl From<io::Error> for PluginError {
    fn from(err: io::Error) -> Self {
        Self::WriteFailed(err)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for PluginError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            PluginError::classify(codes::PROTOCOL_VIOLATION, "x"),
            PluginError::ProtocolViolation(_)
        ));
        assert!(matches!(
            PluginError::classify(codes::UNSUPPORTED_OPERATION, "x"),
            PluginError::Unsupported(_)
        ));
        assert!(matches!(
            PluginError::classify(codes::PLUGIN_PANIC, "x"),
            PluginError::PluginPanic(_)
        ));
        assert!(matches!(
            PluginError::classify(codes::PLUGIN_EXITED, "x"),
            PluginError::PluginExited
        ));
        assert!(matches!(
            PluginError::classify("SOMETHING_ELSE", "x"),
            PluginError::Remote { .. }
        ));
    }

    #[test]
    fn test_disconnected_detection() {
        assert!(PluginError::PluginExited.is_disconnected());
        assert!(PluginError::ChannelClosed.is_disconnected());
        assert!(!PluginError::ProtocolViolation("x".to_string()).is_disconnected());
    }
}
