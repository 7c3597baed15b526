//! Host-side transport: plugin subprocess clients and the connection pool.
//!
//! The host talks to each plugin executable through a [`PluginClient`] —
//! NDJSON over the child's stdin/stdout with request-ID correlation, so many
//! logical connections can multiplex over one pipe pair. A
//! [`ConnectionPool`] owns the clients and guarantees a single subprocess
//! per executable path, reference-counted across connections.
//!
//! # Example
//!
//! ```ignore
//! use tabwire::host::ConnectionPool;
//! use tabwire::protocol::{PluginConfig, QueryConstraint};
//!
//! let pool = ConnectionPool::new();
//! let client = pool.new_client("./my-plugin").await?;
//!
//! let schema = client.initialize(1, 0, PluginConfig::new()).await?;
//! let (rows, exhausted) = client.query(1, 0, 0, QueryConstraint::default()).await?;
//!
//! pool.close_connection("./my-plugin", 1).await;
//! ```

mod client;
mod error;
mod pool;

pub use client::PluginClient;
pub use error::{PluginError, PluginResult};
pub use pool::ConnectionPool;
