//! Wire envelopes and per-method argument records.
//!
//! The transport is newline-delimited JSON over the subprocess's
//! stdin/stdout. Every request carries a unique id; responses may arrive out
//! of order and are correlated by that id, enabling concurrent requests over
//! a single pipe pair.

use serde::{Deserialize, Serialize};

use super::types::{PluginConfig, QueryConstraint, Row};

/// Protocol version exchanged during the handshake.
///
/// Bump on any incompatible change to the envelopes or argument records.
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic-cookie key exchanged during the handshake.
pub const MAGIC_COOKIE_KEY: &str = "TABWIRE_PLUGIN";

/// Magic-cookie value exchanged during the handshake.
pub const MAGIC_COOKIE_VALUE: &str = "1.0.0";

/// Request envelope sent to the plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation.
    pub id: String,
    /// Method name (e.g., "table.query").
    pub method: String,
    /// Method-specific parameters.
    pub params: serde_json::Value,
}

/// Response envelope sent back by the plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to.
    pub id: String,
    /// Whether the request succeeded.
    pub success: bool,
    /// Result data (present if success = true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error information (present if success = false).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ResponseEnvelope {
    /// Build a success response.
    pub fn success(id: String, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Build a failure response.
    pub fn failure(id: String, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(ErrorInfo {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

/// Error information in a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code, one of [`codes`].
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// Method names of the RPC surface.
pub mod methods {
    pub const HANDSHAKE: &str = "handshake";
    pub const INITIALIZE: &str = "table.initialize";
    pub const QUERY: &str = "table.query";
    pub const INSERT: &str = "table.insert";
    pub const UPDATE: &str = "table.update";
    pub const DELETE: &str = "table.delete";
    pub const CLOSE: &str = "connection.close";
}

/// Stable error codes carried in [`ErrorInfo`].
pub mod codes {
    /// Operation called before Initialize, or against an unregistered table.
    pub const PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";
    /// Mutation invoked on a table that does not implement it.
    pub const UNSUPPORTED_OPERATION: &str = "UNSUPPORTED_OPERATION";
    /// Connector code panicked; the operation name is in the message.
    pub const PLUGIN_PANIC: &str = "PLUGIN_PANIC";
    /// Connector code returned an error of its own.
    pub const TABLE_ERROR: &str = "TABLE_ERROR";
    /// Request parameters failed to decode.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    /// Unknown method name.
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    /// A table RPC arrived before a successful handshake.
    pub const HANDSHAKE_REQUIRED: &str = "HANDSHAKE_REQUIRED";
    /// Protocol version or magic cookie did not match.
    pub const HANDSHAKE_MISMATCH: &str = "HANDSHAKE_MISMATCH";
    /// The plugin process exited with requests still in flight.
    pub const PLUGIN_EXITED: &str = "PLUGIN_EXITED";
}

/// Parameters for `handshake`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeArgs {
    pub protocol_version: u32,
    pub cookie_key: String,
    pub cookie_value: String,
}

impl HandshakeArgs {
    /// The handshake this binary expects.
    pub fn current() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            cookie_key: MAGIC_COOKIE_KEY.to_string(),
            cookie_value: MAGIC_COOKIE_VALUE.to_string(),
        }
    }

    /// Whether the peer's handshake matches ours.
    pub fn matches(&self, other: &HandshakeArgs) -> bool {
        self.protocol_version == other.protocol_version
            && self.cookie_key == other.cookie_key
            && self.cookie_value == other.cookie_value
    }
}

/// Response from `handshake`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeReturn {
    pub protocol_version: u32,
}

/// Parameters for `table.initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeArgs {
    pub connection_id: i64,
    pub table_index: usize,
    #[serde(default)]
    pub config: PluginConfig,
}

/// Parameters for `table.query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryArgs {
    pub connection_id: i64,
    pub table_index: usize,
    pub cursor_index: usize,
    #[serde(default)]
    pub constraint: QueryConstraint,
}

/// Response from `table.query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryReturn {
    pub rows: Vec<Row>,
    /// Whether the cursor is exhausted.
    pub no_more_rows: bool,
}

/// Parameters for `table.insert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertArgs {
    pub connection_id: i64,
    pub table_index: usize,
    pub rows: Vec<Row>,
}

/// Parameters for `table.update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateArgs {
    pub connection_id: i64,
    pub table_index: usize,
    pub rows: Vec<Row>,
}

/// Parameters for `table.delete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteArgs {
    pub connection_id: i64,
    pub table_index: usize,
    pub primary_keys: Vec<serde_json::Value>,
}

/// Parameters for `connection.close`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseArgs {
    pub connection_id: i64,
}
