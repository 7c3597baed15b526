//! Connector contract: the traits a data source implements to become a
//! queryable table.
//!
//! A connector provides a [`TableFactory`] per table. The factory is called
//! once per (connection, table) pair and returns the table instance together
//! with its schema. Reading goes through [`TableReader`] cursors created
//! lazily per query slot; the optional mutation traits are detected
//! structurally at initialization, so a table never under-reports a
//! capability it actually implements.

use thiserror::Error;

use crate::protocol::{PluginConfig, QueryConstraint, Row, TableSchema};

/// Error returned by connector code.
///
/// Connector failures are opaque to the framework; only the message crosses
/// the process boundary.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TableError(pub String);

impl TableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for TableError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for TableError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Result type for connector code.
pub type TableResult<T> = Result<T, TableError>;

/// Arguments passed to a [`TableFactory`].
///
/// Passed as a struct so that connectors keep compiling when fields are
/// added.
#[derive(Debug, Clone)]
pub struct TableFactoryArgs {
    /// Configuration supplied by the user for this plugin profile.
    pub user_config: PluginConfig,
    /// Index of the table in the published manifest (0-based).
    pub table_index: usize,
    /// Host-assigned connection identifier. Opaque; may change between
    /// restarts.
    pub connection_id: i64,
}

/// Creates a table instance and returns its schema.
pub type TableFactory =
    Box<dyn Fn(TableFactoryArgs) -> TableResult<(Box<dyn Table>, TableSchema)> + Send + Sync>;

/// A cursor over one table.
///
/// A reader holds connector-private pagination state and is reused across
/// subsequent queries on the same (connection, table, cursor) key until the
/// connection closes.
pub trait TableReader: Send {
    /// Return rows for a SELECT query.
    ///
    /// The constraint is an optimization hint; returning a superset of the
    /// matching rows is always correct because the host re-filters. The
    /// second return value reports whether the cursor is exhausted.
    fn query(&mut self, constraint: &QueryConstraint) -> TableResult<(Vec<Row>, bool)>;
}

/// A table instance, scoped to one connection.
pub trait Table: Send {
    /// Create a new cursor. A table can have several concurrent readers.
    fn create_reader(&mut self) -> Box<dyn TableReader>;

    /// Called when the owning connection closes. Free resources here.
    fn close(&mut self) -> TableResult<()>;

    /// The insert capability of this table, if it has one.
    ///
    /// Checked once at initialization; the result is OR-ed into the
    /// schema's declared `handles_insert` flag.
    fn as_insert(&mut self) -> Option<&mut dyn TableInsert> {
        None
    }

    /// The update capability of this table, if it has one. See
    /// [`Table::as_insert`].
    fn as_update(&mut self) -> Option<&mut dyn TableUpdate> {
        None
    }

    /// The delete capability of this table, if it has one. See
    /// [`Table::as_insert`].
    fn as_delete(&mut self) -> Option<&mut dyn TableDelete> {
        None
    }
}

/// Optional insert support for a [`Table`].
pub trait TableInsert {
    /// Insert the given rows. Row values are ordered like the schema.
    fn insert(&mut self, rows: Vec<Row>) -> TableResult<()>;
}

/// Optional update support for a [`Table`].
pub trait TableUpdate {
    /// Update the given rows.
    ///
    /// Each row carries the former primary key at index 0, followed by the
    /// full new row (including the possibly-changed primary key at its
    /// schema position).
    fn update(&mut self, rows: Vec<Row>) -> TableResult<()>;
}

/// Optional delete support for a [`Table`].
pub trait TableDelete {
    /// Delete the rows with the given primary keys.
    fn delete(&mut self, primary_keys: Vec<serde_json::Value>) -> TableResult<()>;
}
