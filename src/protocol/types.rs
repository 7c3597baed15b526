//! Schema and constraint data model shared by both sides of the wire.
//!
//! Everything in this file crosses the process boundary, so the types are
//! restricted to primitive scalars, ordered lists of scalars, and the named
//! records below. Rows are opaque to the framework: it relays them without
//! ever inspecting their contents.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single result row: an ordered list of scalar values.
///
/// The order and types of the values must match the table's schema.
pub type Row = Vec<serde_json::Value>;

/// Scalar type tag for a column.
///
/// The tag is advisory: the framework never validates row values against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    #[default]
    Int,
    Float,
    Text,
    Blob,
    Bool,
    DateTime,
    Date,
    Time,
    Json,
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Column {
    /// The name of the column.
    pub name: String,
    /// The scalar type of the column.
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Whether the column is a table parameter.
    ///
    /// Parameter columns are hidden from SELECT results and are instead
    /// supplied as arguments of the table, typically through an equality
    /// predicate in the constraint.
    #[serde(default)]
    pub is_parameter: bool,
    /// Whether the parameter must be supplied for the table to be queried.
    #[serde(default)]
    pub is_required: bool,
    /// Human-readable description of the column.
    #[serde(default)]
    pub description: String,
}

/// Schema of one table, negotiated once per (connection, table) pair.
///
/// The column order is fixed for the lifetime of that pair and for every
/// cursor opened against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TableSchema {
    /// The columns of the table, in result order.
    pub columns: Vec<Column>,

    /// Index of the column holding a unique value for each row.
    ///
    /// `None` means the table has no primary key; the host will synthesize
    /// row identifiers, and the table cannot update or delete rows.
    #[serde(default)]
    pub primary_key: Option<usize>,

    /// Whether the table can handle an INSERT statement.
    #[serde(default)]
    pub handles_insert: bool,
    /// Whether the table can handle an UPDATE statement.
    #[serde(default)]
    pub handles_update: bool,
    /// Whether the table can handle a DELETE statement.
    #[serde(default)]
    pub handles_delete: bool,

    /// Whether the table honors the OFFSET clause itself.
    ///
    /// If false, the host skips the offset rows on its side.
    #[serde(default)]
    pub handle_offset: bool,

    /// Preferred number of rows per insert batch (0 = no preference).
    #[serde(default)]
    pub buffer_insert: u32,
    /// Preferred number of rows per update batch (0 = no preference).
    #[serde(default)]
    pub buffer_update: u32,
    /// Preferred number of rows per delete batch (0 = no preference).
    #[serde(default)]
    pub buffer_delete: u32,

    /// Whether update rows may carry only the changed columns.
    #[serde(default)]
    pub partial_update: bool,

    /// Human-readable description of the table.
    #[serde(default)]
    pub description: String,
}

/// Comparison operator of a column predicate.
///
/// The ordering derive is load-bearing: [`QueryConstraint::hash`] sorts
/// predicates by `(column_id, operator)` to compute the canonical hash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOperator {
    #[default]
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Like,
    Glob,
    Match,
    Regexp,
}

/// A single WHERE predicate pushed down to the connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnConstraint {
    /// Index of the column the predicate applies to.
    pub column_id: i64,
    /// The comparison operator.
    pub operator: ConstraintOperator,
    /// The comparison value. `null` means SQL NULL.
    pub value: serde_json::Value,
}

impl ColumnConstraint {
    /// The value as a string, if it is one.
    pub fn string_value(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// The value as a signed integer, if it is one.
    pub fn int_value(&self) -> Option<i64> {
        self.value.as_i64()
    }

    /// The value as a float. Integer values are widened.
    pub fn float_value(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// The value as a boolean.
    ///
    /// Accepts a JSON bool, the strings `"true"`/`"false"`, and integers
    /// (non-zero is true), since hosts differ in how they encode booleans.
    pub fn bool_value(&self) -> Option<bool> {
        match &self.value {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::Number(n) => n.as_i64().map(|i| i != 0),
            serde_json::Value::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Whether this predicate is an equality check.
    pub fn is_equal(&self) -> bool {
        self.operator == ConstraintOperator::Equal
    }
}

/// One ORDER BY fragment pushed down to the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConstraint {
    /// Index of the column to order by.
    pub column_id: i64,
    /// Whether the sort order is descending.
    #[serde(default)]
    pub descending: bool,
}

/// Constraints of a SELECT query, passed to the connector as an
/// optimization hint.
///
/// A connector is free to ignore any part of it: the host re-filters the
/// returned rows, so ignoring a constraint only costs bandwidth, never
/// correctness. Returning a superset of the matching rows is always valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QueryConstraint {
    /// WHERE predicates, one per referenced column.
    #[serde(default)]
    pub columns: Vec<ColumnConstraint>,

    /// ORDER BY fragments, outermost first.
    #[serde(default)]
    pub order_by: Vec<OrderConstraint>,

    /// Maximum number of rows to return. `None` means no limit.
    #[serde(default)]
    pub limit: Option<i64>,

    /// Number of rows to skip. `None` means no offset.
    #[serde(default)]
    pub offset: Option<i64>,
}

impl QueryConstraint {
    /// The first predicate referencing `column_id`, if any.
    pub fn column_constraint(&self, column_id: i64) -> Option<&ColumnConstraint> {
        self.columns.iter().find(|c| c.column_id == column_id)
    }
}

/// User-supplied configuration handed to a table factory at initialization.
///
/// Values are JSON scalars or lists of strings; the typed accessors return
/// `None` when a key is absent or holds a different type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct PluginConfig(pub HashMap<String, serde_json::Value>);

impl PluginConfig {
    /// An empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, for building configurations in host code and tests.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// The value under `key` as a string.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// The value under `key` as a signed integer.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(|v| v.as_i64())
    }

    /// The value under `key` as a float. Integer values are widened.
    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(|v| v.as_f64())
    }

    /// The value under `key` as a list of strings.
    ///
    /// Returns `None` if any element of the list is not a string.
    pub fn get_string_array(&self, key: &str) -> Option<Vec<String>> {
        let array = self.0.get(key)?.as_array()?;
        array
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }
}

impl<K: Into<String>, V: Into<serde_json::Value>> FromIterator<(K, V)> for PluginConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_constraint_value_accessors() {
        let constraint = QueryConstraint {
            columns: vec![
                ColumnConstraint {
                    column_id: 0,
                    operator: ConstraintOperator::Equal,
                    value: json!("value"),
                },
                ColumnConstraint {
                    column_id: 3,
                    operator: ConstraintOperator::Equal,
                    value: json!(1_704_067_200_i64),
                },
                ColumnConstraint {
                    column_id: 4,
                    operator: ConstraintOperator::Equal,
                    value: json!("true"),
                },
                ColumnConstraint {
                    column_id: 5,
                    operator: ConstraintOperator::Equal,
                    value: json!(1),
                },
            ],
            ..Default::default()
        };

        let first = constraint.column_constraint(0).unwrap();
        assert_eq!(first.string_value(), Some("value"));
        assert_eq!(first.int_value(), None);
        assert_eq!(first.float_value(), None);
        assert!(first.is_equal());

        // A column without a predicate has no constraint at all.
        assert!(constraint.column_constraint(1).is_none());

        assert_eq!(
            constraint.column_constraint(3).unwrap().int_value(),
            Some(1_704_067_200)
        );
        assert_eq!(
            constraint.column_constraint(4).unwrap().bool_value(),
            Some(true)
        );
        assert_eq!(
            constraint.column_constraint(5).unwrap().bool_value(),
            Some(true)
        );
    }

    #[test]
    fn test_plugin_config_accessors() {
        let config: PluginConfig = [
            ("apiKey", json!("1234")),
            ("count", json!(42)),
            ("float", json!(42.42)),
            ("array", json!(["a", "b", "c"])),
        ]
        .into_iter()
        .collect();

        assert_eq!(config.get_string("apiKey"), Some("1234"));
        assert_eq!(config.get_int("count"), Some(42));
        assert_eq!(config.get_float("float"), Some(42.42));
        assert_eq!(
            config.get_string_array("array"),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );

        // Missing keys and type mismatches are both None.
        assert_eq!(config.get_string("missing"), None);
        assert_eq!(config.get_int("apiKey"), None);
        assert_eq!(config.get_string_array("count"), None);
    }

    #[test]
    fn test_schema_serde_round_trip() {
        let schema = TableSchema {
            columns: vec![
                Column {
                    name: "id".to_string(),
                    column_type: ColumnType::Int,
                    ..Default::default()
                },
                Column {
                    name: "name".to_string(),
                    column_type: ColumnType::Text,
                    description: "display name".to_string(),
                    ..Default::default()
                },
            ],
            primary_key: Some(0),
            handles_insert: true,
            buffer_insert: 100,
            ..Default::default()
        };

        let json = serde_json::to_string(&schema).unwrap();
        let back: TableSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, back);
    }

    #[test]
    fn test_operator_ordering_is_stable() {
        use ConstraintOperator::*;
        assert!(Equal < NotEqual);
        assert!(NotEqual < Greater);
        assert!(Less < LessOrEqual);
    }
}
