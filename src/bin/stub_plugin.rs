//! Stub plugin used by the integration tests.
//!
//! Exposes four tables:
//!   0, 1 - a static two-column table returning [[1,"hello"],[2,"world"]]
//!   2    - a table whose reader panics on Query
//!   3    - a table that implements insert without declaring it in its schema

use std::process::ExitCode;

use serde_json::json;
use tabwire::plugin::{
    Plugin, Table, TableFactoryArgs, TableInsert, TableReader, TableResult,
};
use tabwire::protocol::{Column, ColumnType, QueryConstraint, Row, TableSchema};

fn two_column_schema() -> TableSchema {
    TableSchema {
        columns: vec![
            Column {
                name: "id".to_string(),
                column_type: ColumnType::Int,
                ..Default::default()
            },
            Column {
                name: "name".to_string(),
                column_type: ColumnType::Text,
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}

struct StaticReader;

impl TableReader for StaticReader {
    fn query(&mut self, _constraint: &QueryConstraint) -> TableResult<(Vec<Row>, bool)> {
        Ok((
            vec![vec![json!(1), json!("hello")], vec![json!(2), json!("world")]],
            true,
        ))
    }
}

struct StaticTable;

impl Table for StaticTable {
    fn create_reader(&mut self) -> Box<dyn TableReader> {
        Box::new(StaticReader)
    }

    fn close(&mut self) -> TableResult<()> {
        Ok(())
    }
}

struct PanicReader;

impl TableReader for PanicReader {
    fn query(&mut self, _constraint: &QueryConstraint) -> TableResult<(Vec<Row>, bool)> {
        panic!("stub reader exploded");
    }
}

struct PanicTable;

impl Table for PanicTable {
    fn create_reader(&mut self) -> Box<dyn TableReader> {
        Box::new(PanicReader)
    }

    fn close(&mut self) -> TableResult<()> {
        Ok(())
    }
}

struct SinkTable;

impl Table for SinkTable {
    fn create_reader(&mut self) -> Box<dyn TableReader> {
        Box::new(StaticReader)
    }

    fn close(&mut self) -> TableResult<()> {
        Ok(())
    }

    fn as_insert(&mut self) -> Option<&mut dyn TableInsert> {
        Some(self)
    }
}

impl TableInsert for SinkTable {
    fn insert(&mut self, _rows: Vec<Row>) -> TableResult<()> {
        Ok(())
    }
}

fn static_table(_args: TableFactoryArgs) -> TableResult<(Box<dyn Table>, TableSchema)> {
    Ok((Box::new(StaticTable), two_column_schema()))
}

fn build_plugin() -> Result<Plugin, tabwire::plugin::ServeError> {
    let mut plugin = Plugin::new();
    plugin.register_table(0, static_table)?;
    plugin.register_table(1, static_table)?;
    plugin.register_table(2, |_args| {
        Ok((Box::new(PanicTable) as Box<dyn Table>, two_column_schema()))
    })?;
    // handles_insert is deliberately left false in table 3's schema: the
    // dispatcher must derive it from the concrete type.
    plugin.register_table(3, |_args| {
        Ok((Box::new(SinkTable) as Box<dyn Table>, two_column_schema()))
    })?;
    Ok(plugin)
}

#[tokio::main]
async fn main() -> ExitCode {
    let plugin = match build_plugin() {
        Ok(plugin) => plugin,
        Err(err) => {
            eprintln!("stub plugin: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = plugin.serve().await {
        eprintln!("stub plugin: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
