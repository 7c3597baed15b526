//! Wire contract between the host and its plugin subprocesses.
//!
//! This module is the single source of truth for everything that crosses
//! the process boundary: the schema and constraint data model, the NDJSON
//! request/response envelopes, the handshake constants, and the canonical
//! constraint hash used as a cache-key component.
//!
//! It has no dependency on either side of the connection; both the
//! plugin-side dispatcher ([`crate::plugin`]) and the host-side transport
//! ([`crate::host`]) build on it.

mod hash;
mod messages;
mod types;

pub use messages::{
    codes, methods, CloseArgs, DeleteArgs, ErrorInfo, HandshakeArgs, HandshakeReturn,
    InitializeArgs, InsertArgs, QueryArgs, QueryReturn, RequestEnvelope, ResponseEnvelope,
    UpdateArgs, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PROTOCOL_VERSION,
};
pub use types::{
    Column, ColumnConstraint, ColumnType, ConstraintOperator, OrderConstraint, PluginConfig,
    QueryConstraint, Row, TableSchema,
};
