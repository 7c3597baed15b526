//! Plugin-side runtime: the dispatcher that runs inside each subprocess.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Host (ConnectionPool)                       │
//! └─────────────────────────────────────────────────────────────────┘
//!                 stdin (NDJSON) │ stdout (NDJSON)
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Plugin subprocess (this module)                │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │ serve loop    - handshake gate, request decode            │  │
//! │  │ Dispatcher    - (connection, table, cursor) registries,   │  │
//! │  │                 panic recovery around connector code      │  │
//! │  │ watchdog      - exits when the host process dies          │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │                              ▼                                  │
//! │          Connector code (Table / TableReader impls)             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tabwire::plugin::{Plugin, TableFactoryArgs};
//!
//! let mut plugin = Plugin::new();
//! plugin.register_table(0, |args: TableFactoryArgs| {
//!     let table = MyTable::connect(&args.user_config)?;
//!     let schema = MyTable::schema();
//!     Ok((Box::new(table) as Box<dyn tabwire::plugin::Table>, schema))
//! })?;
//! plugin.serve().await?;
//! ```

mod dispatcher;
mod server;
mod table;

pub use dispatcher::{DispatchError, DispatchResult};
pub use server::{Plugin, ServeError};
pub use table::{
    Table, TableDelete, TableError, TableFactory, TableFactoryArgs, TableInsert, TableReader,
    TableResult, TableUpdate,
};
