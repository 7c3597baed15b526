//! Routes RPC operations to registered tables and their cursors.
//!
//! The dispatcher owns the per-process registries: table factories by
//! manifest index, live table instances by (connection, table), and cursors
//! by (connection, table, cursor). Entries are inserted on first use and
//! removed only on explicit connection close, so cleanup is deterministic.
//!
//! Every call into connector code goes through [`guard`], which converts a
//! panic into a tagged error naming the operation. A misbehaving connector
//! can fail its own operation but can never take down the process or corrupt
//! the registries of unrelated connections.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use super::table::{Table, TableError, TableFactory, TableFactoryArgs, TableReader};
use crate::protocol::{codes, ErrorInfo, PluginConfig, QueryConstraint, Row, TableSchema};

/// Error produced while dispatching an operation.
///
/// All variants are returned values on the wire; none of them crosses the
/// process boundary as a crash.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Operation called before Initialize, or against an unregistered table.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Mutation invoked on a table that does not implement it.
    #[error("table does not support {0}")]
    Unsupported(&'static str),

    /// Connector code panicked.
    #[error("plugin panicked while running {operation}: {message}")]
    Panic { operation: String, message: String },

    /// Connector code returned an error.
    #[error(transparent)]
    Table(#[from] TableError),
}

impl DispatchError {
    /// The wire error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProtocolViolation(_) => codes::PROTOCOL_VIOLATION,
            Self::Unsupported(_) => codes::UNSUPPORTED_OPERATION,
            Self::Panic { .. } => codes::PLUGIN_PANIC,
            Self::Table(_) => codes::TABLE_ERROR,
        }
    }

    /// Convert into the wire error record.
    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TableKey {
    connection_id: i64,
    table_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CursorKey {
    connection_id: i64,
    table_index: usize,
    cursor_index: usize,
}

/// A live table instance together with its effective schema.
struct TableEntry {
    table: Box<dyn Table>,
    schema: TableSchema,
}

/// Run connector code, converting a panic into a tagged error.
///
/// This is the only panic-recovery boundary in the crate; every call into
/// factory/table/reader code must go through it.
fn guard<T>(operation: &str, f: impl FnOnce() -> DispatchResult<T>) -> DispatchResult<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(DispatchError::Panic {
            operation: operation.to_string(),
            message: panic_message(panic),
        }),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// A panic can never escape a guard()ed call, so registry locks are only
// poisoned if the runtime itself aborts mid-operation; recover the data in
// that case rather than cascading.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The per-process dispatcher.
///
/// Shared by all request-handling tasks of the serve loop. The registry
/// maps are locked only for lookup, insertion, and removal; connector calls
/// run under the per-entry lock, so operations on different tables proceed
/// independently even when one of them blocks on a slow remote.
pub(crate) struct Dispatcher {
    factories: HashMap<usize, TableFactory>,
    tables: Mutex<HashMap<TableKey, Arc<Mutex<TableEntry>>>>,
    cursors: Mutex<HashMap<CursorKey, Arc<Mutex<Box<dyn TableReader>>>>>,
}

impl Dispatcher {
    pub(crate) fn new(factories: HashMap<usize, TableFactory>) -> Self {
        Self {
            factories,
            tables: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    fn factory(&self, table_index: usize) -> DispatchResult<&TableFactory> {
        self.factories.get(&table_index).ok_or_else(|| {
            DispatchError::ProtocolViolation(format!("table {table_index} is not registered"))
        })
    }

    fn table_entry(
        &self,
        connection_id: i64,
        table_index: usize,
    ) -> DispatchResult<Arc<Mutex<TableEntry>>> {
        let key = TableKey {
            connection_id,
            table_index,
        };
        lock(&self.tables).get(&key).cloned().ok_or_else(|| {
            DispatchError::ProtocolViolation(format!(
                "table {table_index} was not initialized on connection {connection_id}"
            ))
        })
    }

    /// Create the table instance for (connection, table) and return its
    /// effective schema.
    ///
    /// The declared capability flags are OR-ed with what the concrete table
    /// structurally implements, checked once here and cached for the
    /// lifetime of the entry.
    pub(crate) fn initialize(
        &self,
        connection_id: i64,
        table_index: usize,
        config: PluginConfig,
    ) -> DispatchResult<TableSchema> {
        let factory = self.factory(table_index)?;

        let args = TableFactoryArgs {
            user_config: config,
            table_index,
            connection_id,
        };
        let (mut table, mut schema) =
            guard("the table factory", || factory(args).map_err(Into::into))?;

        schema.handles_insert |= table.as_insert().is_some();
        schema.handles_update |= table.as_update().is_some();
        schema.handles_delete |= table.as_delete().is_some();

        let entry = TableEntry {
            table,
            schema: schema.clone(),
        };
        lock(&self.tables).insert(
            TableKey {
                connection_id,
                table_index,
            },
            Arc::new(Mutex::new(entry)),
        );

        Ok(schema)
    }

    /// Fetch rows from the cursor, creating it on first use.
    pub(crate) fn query(
        &self,
        connection_id: i64,
        table_index: usize,
        cursor_index: usize,
        constraint: QueryConstraint,
    ) -> DispatchResult<(Vec<Row>, bool)> {
        self.factory(table_index)?;
        let entry = self.table_entry(connection_id, table_index)?;

        let key = CursorKey {
            connection_id,
            table_index,
            cursor_index,
        };
        let reader = {
            let mut cursors = lock(&self.cursors);
            match cursors.get(&key) {
                Some(reader) => reader.clone(),
                None => {
                    let reader = guard("CreateReader", || {
                        Ok(lock(&entry).table.create_reader())
                    })?;
                    let reader = Arc::new(Mutex::new(reader));
                    cursors.insert(key, reader.clone());
                    reader
                }
            }
        };

        let mut reader = lock(&reader);
        guard("Query", || reader.query(&constraint).map_err(Into::into))
    }

    /// Insert rows into the table.
    pub(crate) fn insert(
        &self,
        connection_id: i64,
        table_index: usize,
        rows: Vec<Row>,
    ) -> DispatchResult<()> {
        self.factory(table_index)?;
        let entry = self.table_entry(connection_id, table_index)?;
        let mut entry = lock(&entry);
        // The effective flag was fixed at initialization; a table that
        // neither declares nor implements insert is rejected without
        // entering connector code.
        if !entry.schema.handles_insert {
            return Err(DispatchError::Unsupported("Insert"));
        }
        guard("Insert", || match entry.table.as_insert() {
            Some(table) => table.insert(rows).map_err(Into::into),
            None => Err(DispatchError::Unsupported("Insert")),
        })
    }

    /// Update rows of the table.
    pub(crate) fn update(
        &self,
        connection_id: i64,
        table_index: usize,
        rows: Vec<Row>,
    ) -> DispatchResult<()> {
        self.factory(table_index)?;
        let entry = self.table_entry(connection_id, table_index)?;
        let mut entry = lock(&entry);
        if !entry.schema.handles_update {
            return Err(DispatchError::Unsupported("Update"));
        }
        guard("Update", || match entry.table.as_update() {
            Some(table) => table.update(rows).map_err(Into::into),
            None => Err(DispatchError::Unsupported("Update")),
        })
    }

    /// Delete rows from the table by primary key.
    pub(crate) fn delete(
        &self,
        connection_id: i64,
        table_index: usize,
        primary_keys: Vec<serde_json::Value>,
    ) -> DispatchResult<()> {
        self.factory(table_index)?;
        let entry = self.table_entry(connection_id, table_index)?;
        let mut entry = lock(&entry);
        if !entry.schema.handles_delete {
            return Err(DispatchError::Unsupported("Delete"));
        }
        guard("Delete", || match entry.table.as_delete() {
            Some(table) => table.delete(primary_keys).map_err(Into::into),
            None => Err(DispatchError::Unsupported("Delete")),
        })
    }

    /// Tear down every table opened under the connection.
    ///
    /// Errors are collected across all tables rather than short-circuiting;
    /// an unknown connection id is a no-op, not an error.
    pub(crate) fn close(&self, connection_id: i64) -> DispatchResult<()> {
        lock(&self.cursors).retain(|key, _| key.connection_id != connection_id);

        let removed: Vec<(usize, Arc<Mutex<TableEntry>>)> = {
            let mut tables = lock(&self.tables);
            let keys: Vec<TableKey> = tables
                .keys()
                .filter(|key| key.connection_id == connection_id)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|key| tables.remove(&key).map(|entry| (key.table_index, entry)))
                .collect()
        };

        let mut failures = Vec::new();
        for (table_index, entry) in removed {
            let mut entry = lock(&entry);
            if let Err(err) = guard("Close", || entry.table.close().map_err(Into::into)) {
                failures.push(format!("table {table_index}: {err}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::Table(TableError(failures.join("; "))))
        }
    }
}
