use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::migration::Database;
use crate::schema::{
    ColumnDefinition, ConstraintDefinition, ForeignKeyDefinition, IndexDefinition, RowFilter,
    SqlValue, TableDefinition,
};
use crate::MigrationError;

/// A single schema or data change, captured as data until a syntax provider
/// renders it for a dialect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expression {
    CreateTable {
        table: TableDefinition,
    },
    DeleteTable {
        table: String,
    },
    RenameTable {
        old_name: String,
        new_name: String,
    },
    CreateColumn {
        table: String,
        column: ColumnDefinition,
    },
    AlterColumn {
        table: String,
        column: ColumnDefinition,
    },
    DeleteColumn {
        table: String,
        columns: Vec<String>,
    },
    RenameColumn {
        table: String,
        old_name: String,
        new_name: String,
    },
    CreateIndex {
        index: IndexDefinition,
    },
    DeleteIndex {
        table: String,
        name: String,
    },
    CreateForeignKey {
        foreign_key: ForeignKeyDefinition,
    },
    DeleteForeignKey {
        table: String,
        name: String,
    },
    CreateConstraint {
        constraint: ConstraintDefinition,
    },
    DeleteConstraint {
        table: String,
        name: String,
    },
    InsertData {
        table: String,
        rows: Vec<BTreeMap<String, SqlValue>>,
    },
    UpdateData {
        table: String,
        set: BTreeMap<String, SqlValue>,
        filter: RowFilter,
    },
    DeleteData {
        table: String,
        filter: RowFilter,
    },
    ExecuteSql {
        sql: String,
    },
}

impl Expression {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::CreateTable { table } => format!("create table {}", table.name),
            Self::DeleteTable { table } => format!("delete table {table}"),
            Self::RenameTable { old_name, new_name } => {
                format!("rename table {old_name} to {new_name}")
            }
            Self::CreateColumn { table, column } => {
                format!("create column {table}.{}", column.name)
            }
            Self::AlterColumn { table, column } => format!("alter column {table}.{}", column.name),
            Self::DeleteColumn { table, columns } => {
                format!("delete column {table}.{}", columns.join(","))
            }
            Self::RenameColumn {
                table,
                old_name,
                new_name,
            } => format!("rename column {table}.{old_name} to {new_name}"),
            Self::CreateIndex { index } => format!("create index {}", index.name),
            Self::DeleteIndex { name, .. } => format!("delete index {name}"),
            Self::CreateForeignKey { foreign_key } => {
                format!("create foreign key {}", foreign_key.effective_name())
            }
            Self::DeleteForeignKey { name, .. } => format!("delete foreign key {name}"),
            Self::CreateConstraint { constraint } => {
                format!("create constraint {}", constraint.name)
            }
            Self::DeleteConstraint { name, .. } => format!("delete constraint {name}"),
            Self::InsertData { table, rows } => format!("insert {} row(s) into {table}", rows.len()),
            Self::UpdateData { table, .. } => format!("update data in {table}"),
            Self::DeleteData { table, .. } => format!("delete data from {table}"),
            Self::ExecuteSql { .. } => "execute sql".to_string(),
        }
    }

    /// Structural validation, independent of any dialect.
    ///
    /// # Errors
    /// Returns [`MigrationError::Validation`] when required names or lists are empty.
    pub fn validate(&self) -> Result<(), MigrationError> {
        match self {
            Self::CreateTable { table } => table.validate(),
            Self::CreateColumn { table, column } | Self::AlterColumn { table, column } => {
                require_name("table", table)?;
                column.validate()
            }
            Self::DeleteColumn { table, columns } => {
                require_name("table", table)?;
                if columns.is_empty() {
                    return Err(MigrationError::validation(format!(
                        "delete column on {table} MUST name at least one column"
                    )));
                }
                Ok(())
            }
            Self::RenameTable { old_name, new_name } => {
                require_name("table", old_name)?;
                require_name("new table", new_name)
            }
            Self::RenameColumn {
                table,
                old_name,
                new_name,
            } => {
                require_name("table", table)?;
                require_name("column", old_name)?;
                require_name("new column", new_name)
            }
            Self::CreateIndex { index } => index.validate(),
            Self::CreateForeignKey { foreign_key } => foreign_key.validate(),
            Self::CreateConstraint { constraint } => constraint.validate(),
            Self::DeleteTable { table } => require_name("table", table),
            Self::DeleteIndex { table, name }
            | Self::DeleteForeignKey { table, name }
            | Self::DeleteConstraint { table, name } => {
                require_name("table", table)?;
                require_name("object", name)
            }
            Self::InsertData { table, rows } => {
                require_name("table", table)?;
                if rows.iter().any(BTreeMap::is_empty) {
                    return Err(MigrationError::validation(format!(
                        "insert into {table} contains an empty row"
                    )));
                }
                Ok(())
            }
            Self::UpdateData { table, set, filter } => {
                require_name("table", table)?;
                if set.is_empty() {
                    return Err(MigrationError::validation(format!(
                        "update of {table} MUST set at least one column"
                    )));
                }
                validate_filter(table, filter)
            }
            Self::DeleteData { table, filter } => {
                require_name("table", table)?;
                validate_filter(table, filter)
            }
            Self::ExecuteSql { sql } => {
                if sql.trim().is_empty() {
                    return Err(MigrationError::validation("sql statement MUST not be empty"));
                }
                Ok(())
            }
        }
    }

    /// The existence check that makes this expression safe to run again.
    #[must_use]
    pub fn natural_guard(&self) -> Option<Guard> {
        match self {
            Self::CreateTable { table } => Some(Guard::TableMissing {
                table: table.name.clone(),
            }),
            Self::DeleteTable { table } => Some(Guard::TableExists {
                table: table.clone(),
            }),
            Self::RenameTable { old_name, .. } => Some(Guard::TableExists {
                table: old_name.clone(),
            }),
            Self::CreateColumn { table, column } => Some(Guard::ColumnMissing {
                table: table.clone(),
                column: column.name.clone(),
            }),
            Self::DeleteColumn { table, columns } if columns.len() == 1 => {
                Some(Guard::ColumnExists {
                    table: table.clone(),
                    column: columns[0].clone(),
                })
            }
            Self::RenameColumn {
                table, old_name, ..
            } => Some(Guard::ColumnExists {
                table: table.clone(),
                column: old_name.clone(),
            }),
            Self::CreateIndex { index } => Some(Guard::IndexMissing {
                table: index.table.clone(),
                index: index.name.clone(),
            }),
            Self::DeleteIndex { table, name } => Some(Guard::IndexExists {
                table: table.clone(),
                index: name.clone(),
            }),
            _ => None,
        }
    }
}

fn require_name(what: &str, value: &str) -> Result<(), MigrationError> {
    if value.trim().is_empty() {
        return Err(MigrationError::validation(format!(
            "{what} name MUST be provided"
        )));
    }
    Ok(())
}

fn validate_filter(table: &str, filter: &RowFilter) -> Result<(), MigrationError> {
    match filter {
        RowFilter::Where(criteria) if criteria.is_empty() => Err(MigrationError::validation(
            format!("filter on {table} is empty; use all_rows to target every row"),
        )),
        _ => Ok(()),
    }
}

/// Existence precondition evaluated against a live database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum Guard {
    TableMissing { table: String },
    TableExists { table: String },
    ColumnMissing { table: String, column: String },
    ColumnExists { table: String, column: String },
    IndexMissing { table: String, index: String },
    IndexExists { table: String, index: String },
}

impl Guard {
    /// # Errors
    /// Propagates schema introspection failures from the database.
    pub fn holds(&self, database: &dyn Database) -> Result<bool, MigrationError> {
        match self {
            Self::TableMissing { table } => Ok(!database.table_exists(table)?),
            Self::TableExists { table } => database.table_exists(table),
            Self::ColumnMissing { table, column } => {
                Ok(!column_present(database, table, column)?)
            }
            Self::ColumnExists { table, column } => column_present(database, table, column),
            Self::IndexMissing { table, index } => Ok(!index_present(database, table, index)?),
            Self::IndexExists { table, index } => index_present(database, table, index),
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::TableMissing { table } => format!("table {table} is missing"),
            Self::TableExists { table } => format!("table {table} exists"),
            Self::ColumnMissing { table, column } => format!("column {table}.{column} is missing"),
            Self::ColumnExists { table, column } => format!("column {table}.{column} exists"),
            Self::IndexMissing { index, .. } => format!("index {index} is missing"),
            Self::IndexExists { index, .. } => format!("index {index} exists"),
        }
    }
}

pub(crate) fn column_present(
    database: &dyn Database,
    table: &str,
    column: &str,
) -> Result<bool, MigrationError> {
    if !database.table_exists(table)? {
        return Ok(false);
    }
    Ok(database
        .column_names(table)?
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(column)))
}

pub(crate) fn index_present(
    database: &dyn Database,
    table: &str,
    index: &str,
) -> Result<bool, MigrationError> {
    if !database.table_exists(table)? {
        return Ok(false);
    }
    Ok(database
        .index_names(table)?
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(index)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, IndexColumn};

    #[test]
    fn expressions_round_trip_through_tagged_json() {
        let raw = r#"{
            "kind": "create_column",
            "table": "node",
            "column": {"name": "sortOrder", "type": "int32", "nullable": false,
                       "default": {"value": 0}}
        }"#;
        let expression: Expression = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => panic!("invalid expression json: {err}"),
        };

        let Expression::CreateColumn { table, column } = &expression else {
            panic!("expected create_column, got {expression:?}");
        };
        assert_eq!(table, "node");
        assert_eq!(column.column_type, ColumnType::Int32);
        assert!(!column.nullable);
        assert_eq!(
            column.default,
            Some(crate::DefaultValue::Value(SqlValue::Integer(0)))
        );
        assert_eq!(expression.describe(), "create column node.sortOrder");
    }

    #[test]
    fn natural_guards_cover_idempotent_operations() {
        let create_index = Expression::CreateIndex {
            index: IndexDefinition {
                name: "IX_node_path".to_string(),
                table: "node".to_string(),
                columns: vec![IndexColumn::ascending("path")],
                unique: false,
            },
        };
        assert_eq!(
            create_index.natural_guard(),
            Some(Guard::IndexMissing {
                table: "node".to_string(),
                index: "IX_node_path".to_string(),
            })
        );

        let delete_two = Expression::DeleteColumn {
            table: "node".to_string(),
            columns: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(delete_two.natural_guard(), None);

        let raw_sql = Expression::ExecuteSql {
            sql: "SELECT 1".to_string(),
        };
        assert_eq!(raw_sql.natural_guard(), None);
    }

    #[test]
    fn validate_rejects_empty_filters_and_updates() {
        let update = Expression::UpdateData {
            table: "node".to_string(),
            set: BTreeMap::new(),
            filter: RowFilter::AllRows,
        };
        assert!(update.validate().is_err());

        let delete = Expression::DeleteData {
            table: "node".to_string(),
            filter: RowFilter::Where(BTreeMap::new()),
        };
        let err = match delete.validate() {
            Ok(()) => panic!("empty filter should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("use all_rows"));
    }
}
