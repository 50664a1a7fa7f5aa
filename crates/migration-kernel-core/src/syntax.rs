use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::expression::Expression;
use crate::schema::{
    ColumnDefinition, ColumnType, ConstraintDefinition, ConstraintKind, DefaultValue,
    ForeignKeyDefinition, IndexDefinition, RowFilter, SqlValue, TableDefinition,
};
use crate::MigrationError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    SqlServer,
}

impl Dialect {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::SqlServer => "sqlserver",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(Self::Sqlite),
            "sqlserver" | "mssql" => Some(Self::SqlServer),
            _ => None,
        }
    }
}

/// Renders [`Expression`]s into SQL statements for one dialect.
pub trait SqlSyntax: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn quote_identifier(&self, name: &str) -> String;

    fn format_column_type(&self, column_type: ColumnType) -> String;

    fn format_value(&self, value: &SqlValue) -> String;

    fn format_default(&self, default: &DefaultValue) -> String;

    /// Renders an expression into the statements that perform it, in order.
    ///
    /// # Errors
    /// Returns [`MigrationError::Unsupported`] for expressions the dialect
    /// cannot express and [`MigrationError::Validation`] for definitions it
    /// cannot accept.
    fn render(&self, expression: &Expression) -> Result<Vec<String>, MigrationError>;
}

#[must_use]
pub fn syntax_for(dialect: Dialect) -> &'static dyn SqlSyntax {
    match dialect {
        Dialect::Sqlite => &SqliteSyntax,
        Dialect::SqlServer => &SqlServerSyntax,
    }
}

/// `SQLite` syntax; the dialect migrations actually execute against.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteSyntax;

impl SqliteSyntax {
    fn unsupported(operation: &str) -> MigrationError {
        MigrationError::Unsupported {
            dialect: Dialect::Sqlite.as_str(),
            operation: operation.to_string(),
        }
    }

    fn column_sql(&self, column: &ColumnDefinition, inline_key: bool) -> String {
        let mut sql = format!(
            "{} {}",
            self.quote_identifier(&column.name),
            self.format_column_type(column.column_type)
        );
        if inline_key {
            sql.push_str(" PRIMARY KEY AUTOINCREMENT");
            return sql;
        }
        sql.push_str(if column.nullable { " NULL" } else { " NOT NULL" });
        if let Some(default) = &column.default {
            let _ = write!(sql, " DEFAULT {}", self.format_default(default));
        }
        if column.unique {
            sql.push_str(" UNIQUE");
        }
        sql
    }

    fn create_table(&self, table: &TableDefinition) -> Vec<String> {
        let identity = table.columns.iter().find(|item| item.identity);
        let mut parts = table
            .columns
            .iter()
            .map(|column| self.column_sql(column, column.identity))
            .collect::<Vec<_>>();

        let keys = table.primary_key_columns();
        if identity.is_none() && !keys.is_empty() {
            parts.push(format!(
                "CONSTRAINT {} PRIMARY KEY ({})",
                self.quote_identifier(&table.effective_primary_key_name()),
                join_identifiers(self, keys.iter().map(|item| item.name.as_str()))
            ));
        }
        for foreign_key in &table.foreign_keys {
            parts.push(foreign_key_clause(self, foreign_key));
        }

        let mut statements = vec![format!(
            "CREATE TABLE {} ({})",
            self.quote_identifier(&table.name),
            parts.join(", ")
        )];
        statements.extend(table.indexes.iter().map(|index| self.create_index(index)));
        statements
    }

    fn create_index(&self, index: &IndexDefinition) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote_identifier(&index.name),
            self.quote_identifier(&index.table),
            index_columns(self, index)
        )
    }

    fn add_column(&self, table: &str, column: &ColumnDefinition) -> Result<String, MigrationError> {
        if column.primary_key || column.identity || column.unique {
            return Err(MigrationError::validation(format!(
                "sqlite cannot add key or unique column {table}.{} to an existing table",
                column.name
            )));
        }
        // ADD COLUMN only accepts constant defaults.
        if matches!(
            column.default,
            Some(DefaultValue::CurrentTimestamp | DefaultValue::NewGuid)
        ) {
            return Err(MigrationError::validation(format!(
                "sqlite cannot add column {table}.{} with a non-constant default",
                column.name
            )));
        }
        let has_value_default = matches!(column.default, Some(DefaultValue::Value(_)));
        if !column.nullable && !has_value_default {
            return Err(MigrationError::validation(format!(
                "sqlite cannot add NOT NULL column {table}.{} without a constant default",
                column.name
            )));
        }
        Ok(format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote_identifier(table),
            self.column_sql(column, false)
        ))
    }

    fn create_constraint(&self, constraint: &ConstraintDefinition) -> Result<String, MigrationError> {
        match constraint.kind {
            ConstraintKind::PrimaryKey => Err(Self::unsupported(&format!(
                "adding primary key {} to existing table {}",
                constraint.name, constraint.table
            ))),
            ConstraintKind::Unique => Ok(format!(
                "CREATE UNIQUE INDEX {} ON {} ({})",
                self.quote_identifier(&constraint.name),
                self.quote_identifier(&constraint.table),
                join_identifiers(self, constraint.columns.iter().map(String::as_str))
            )),
        }
    }
}

impl SqlSyntax for SqliteSyntax {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn format_column_type(&self, column_type: ColumnType) -> String {
        match column_type {
            ColumnType::Int32 | ColumnType::Int64 | ColumnType::Boolean => "INTEGER",
            ColumnType::Double => "REAL",
            ColumnType::Decimal { .. } => "NUMERIC",
            ColumnType::String { .. } => "TEXT COLLATE NOCASE",
            ColumnType::Text | ColumnType::DateTime | ColumnType::Guid => "TEXT",
            ColumnType::Binary => "BLOB",
        }
        .to_string()
    }

    fn format_value(&self, value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Boolean(value) => i64::from(*value).to_string(),
            SqlValue::Integer(value) => value.to_string(),
            SqlValue::Real(value) => real_literal(*value),
            SqlValue::Text(value) => format!("'{}'", value.replace('\'', "''")),
            SqlValue::Blob(bytes) => format!("X'{}'", hex::encode_upper(bytes)),
        }
    }

    fn format_default(&self, default: &DefaultValue) -> String {
        match default {
            DefaultValue::Null => "NULL".to_string(),
            DefaultValue::Value(value) => self.format_value(value),
            DefaultValue::CurrentTimestamp => "CURRENT_TIMESTAMP".to_string(),
            DefaultValue::NewGuid => "(lower(hex(randomblob(16))))".to_string(),
        }
    }

    fn render(&self, expression: &Expression) -> Result<Vec<String>, MigrationError> {
        let statements = match expression {
            Expression::CreateTable { table } => self.create_table(table),
            Expression::DeleteTable { table } => {
                vec![format!("DROP TABLE {}", self.quote_identifier(table))]
            }
            Expression::RenameTable { old_name, new_name } => vec![format!(
                "ALTER TABLE {} RENAME TO {}",
                self.quote_identifier(old_name),
                self.quote_identifier(new_name)
            )],
            Expression::CreateColumn { table, column } => vec![self.add_column(table, column)?],
            Expression::AlterColumn { table, column } => {
                return Err(Self::unsupported(&format!(
                    "altering column {table}.{}",
                    column.name
                )))
            }
            Expression::DeleteColumn { table, columns } => columns
                .iter()
                .map(|column| {
                    format!(
                        "ALTER TABLE {} DROP COLUMN {}",
                        self.quote_identifier(table),
                        self.quote_identifier(column)
                    )
                })
                .collect(),
            Expression::RenameColumn {
                table,
                old_name,
                new_name,
            } => vec![format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                self.quote_identifier(table),
                self.quote_identifier(old_name),
                self.quote_identifier(new_name)
            )],
            Expression::CreateIndex { index } => vec![self.create_index(index)],
            Expression::DeleteIndex { name, .. } => {
                vec![format!("DROP INDEX {}", self.quote_identifier(name))]
            }
            Expression::CreateForeignKey { foreign_key } => {
                return Err(Self::unsupported(&format!(
                    "adding foreign key {} to existing table {}",
                    foreign_key.effective_name(),
                    foreign_key.foreign_table
                )))
            }
            Expression::DeleteForeignKey { table, name } => {
                return Err(Self::unsupported(&format!(
                    "dropping foreign key {name} from {table}"
                )))
            }
            Expression::CreateConstraint { constraint } => {
                vec![self.create_constraint(constraint)?]
            }
            Expression::DeleteConstraint { table, name } => {
                return Err(Self::unsupported(&format!(
                    "dropping constraint {name} from {table}"
                )))
            }
            Expression::InsertData { table, rows } => insert_rows(self, table, rows),
            Expression::UpdateData { table, set, filter } => {
                vec![update_rows(self, table, set, filter)]
            }
            Expression::DeleteData { table, filter } => vec![delete_rows(self, table, filter)],
            Expression::ExecuteSql { sql } => vec![sql.clone()],
        };
        Ok(statements)
    }
}

/// SQL Server syntax. Used to produce scripts; nothing in this workspace
/// executes it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerSyntax;

impl SqlServerSyntax {
    const MAX_NVARCHAR: u32 = 4000;

    fn default_constraint_name(table: &str, column: &str) -> String {
        format!("DF_{table}_{column}")
    }

    fn column_sql(&self, table: &str, column: &ColumnDefinition) -> String {
        let mut sql = format!(
            "{} {}",
            self.quote_identifier(&column.name),
            self.format_column_type(column.column_type)
        );
        if column.identity {
            sql.push_str(" IDENTITY(1,1)");
        }
        sql.push_str(if column.nullable { " NULL" } else { " NOT NULL" });
        if let Some(default) = &column.default {
            let _ = write!(
                sql,
                " CONSTRAINT {} DEFAULT ({})",
                self.quote_identifier(&Self::default_constraint_name(table, &column.name)),
                self.format_default(default)
            );
        }
        sql
    }

    fn create_table(&self, table: &TableDefinition) -> Vec<String> {
        let mut parts = table
            .columns
            .iter()
            .map(|column| self.column_sql(&table.name, column))
            .collect::<Vec<_>>();

        let keys = table.primary_key_columns();
        if !keys.is_empty() {
            parts.push(format!(
                "CONSTRAINT {} PRIMARY KEY CLUSTERED ({})",
                self.quote_identifier(&table.effective_primary_key_name()),
                join_identifiers(self, keys.iter().map(|item| item.name.as_str()))
            ));
        }
        for column in table.columns.iter().filter(|item| item.unique) {
            parts.push(format!(
                "CONSTRAINT {} UNIQUE NONCLUSTERED ({})",
                self.quote_identifier(&Self::unique_constraint_name(&table.name, &column.name)),
                self.quote_identifier(&column.name)
            ));
        }
        for foreign_key in &table.foreign_keys {
            parts.push(foreign_key_clause(self, foreign_key));
        }

        let mut statements = vec![format!(
            "CREATE TABLE {} ({})",
            self.quote_identifier(&table.name),
            parts.join(", ")
        )];
        statements.extend(table.indexes.iter().map(|index| self.create_index(index)));
        statements
    }

    fn create_index(&self, index: &IndexDefinition) -> String {
        format!(
            "CREATE {}NONCLUSTERED INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote_identifier(&index.name),
            self.quote_identifier(&index.table),
            index_columns(self, index)
        )
    }

    fn unsupported(operation: &str) -> MigrationError {
        MigrationError::Unsupported {
            dialect: Dialect::SqlServer.as_str(),
            operation: operation.to_string(),
        }
    }

    fn unique_constraint_name(table: &str, column: &str) -> String {
        format!("UQ_{table}_{column}")
    }

    fn add_column(&self, table: &str, column: &ColumnDefinition) -> String {
        let mut sql = format!(
            "ALTER TABLE {} ADD {}",
            self.quote_identifier(table),
            self.column_sql(table, column)
        );
        if column.primary_key {
            let _ = write!(
                sql,
                " CONSTRAINT {} PRIMARY KEY CLUSTERED",
                self.quote_identifier(&format!("PK_{table}"))
            );
        }
        if column.unique {
            let _ = write!(
                sql,
                " CONSTRAINT {} UNIQUE NONCLUSTERED",
                self.quote_identifier(&Self::unique_constraint_name(table, &column.name))
            );
        }
        sql
    }

    /// The column's default constraint is dropped first whether or not one
    /// exists, then re-added when the new definition has a default.
    fn alter_column(
        &self,
        table: &str,
        column: &ColumnDefinition,
    ) -> Result<Vec<String>, MigrationError> {
        if column.primary_key || column.identity || column.unique {
            return Err(Self::unsupported(&format!(
                "altering {table}.{} into a key, identity or unique column",
                column.name
            )));
        }
        let default_name = Self::default_constraint_name(table, &column.name);
        let mut statements = vec![
            format!(
                "IF OBJECT_ID({}, 'D') IS NOT NULL ALTER TABLE {} DROP CONSTRAINT {}",
                self.format_value(&SqlValue::Text(self.quote_identifier(&default_name))),
                self.quote_identifier(table),
                self.quote_identifier(&default_name)
            ),
            format!(
                "ALTER TABLE {} ALTER COLUMN {} {} {}",
                self.quote_identifier(table),
                self.quote_identifier(&column.name),
                self.format_column_type(column.column_type),
                if column.nullable { "NULL" } else { "NOT NULL" }
            ),
        ];
        if let Some(default) = &column.default {
            statements.push(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} DEFAULT ({}) FOR {}",
                self.quote_identifier(table),
                self.quote_identifier(&default_name),
                self.format_default(default),
                self.quote_identifier(&column.name)
            ));
        }
        Ok(statements)
    }

    fn drop_constraint(&self, table: &str, name: &str) -> String {
        format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            self.quote_identifier(table),
            self.quote_identifier(name)
        )
    }
}

impl SqlSyntax for SqlServerSyntax {
    fn dialect(&self) -> Dialect {
        Dialect::SqlServer
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn format_column_type(&self, column_type: ColumnType) -> String {
        match column_type {
            ColumnType::Int32 => "INT".to_string(),
            ColumnType::Int64 => "BIGINT".to_string(),
            ColumnType::Boolean => "BIT".to_string(),
            ColumnType::Double => "FLOAT".to_string(),
            ColumnType::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
            ColumnType::String { length: None } => "NVARCHAR(255)".to_string(),
            ColumnType::String {
                length: Some(length),
            } if length <= Self::MAX_NVARCHAR => format!("NVARCHAR({length})"),
            ColumnType::String { .. } | ColumnType::Text => "NVARCHAR(MAX)".to_string(),
            ColumnType::DateTime => "DATETIME2".to_string(),
            ColumnType::Guid => "UNIQUEIDENTIFIER".to_string(),
            ColumnType::Binary => "VARBINARY(MAX)".to_string(),
        }
    }

    fn format_value(&self, value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Boolean(value) => i64::from(*value).to_string(),
            SqlValue::Integer(value) => value.to_string(),
            SqlValue::Real(value) => real_literal(*value),
            SqlValue::Text(value) => format!("N'{}'", value.replace('\'', "''")),
            SqlValue::Blob(bytes) => format!("0x{}", hex::encode_upper(bytes)),
        }
    }

    fn format_default(&self, default: &DefaultValue) -> String {
        match default {
            DefaultValue::Null => "NULL".to_string(),
            DefaultValue::Value(value) => self.format_value(value),
            DefaultValue::CurrentTimestamp => "GETUTCDATE()".to_string(),
            DefaultValue::NewGuid => "NEWID()".to_string(),
        }
    }

    fn render(&self, expression: &Expression) -> Result<Vec<String>, MigrationError> {
        let statements = match expression {
            Expression::CreateTable { table } => self.create_table(table),
            Expression::DeleteTable { table } => {
                vec![format!("DROP TABLE {}", self.quote_identifier(table))]
            }
            Expression::RenameTable { old_name, new_name } => vec![format!(
                "EXEC sp_rename {}, {}",
                self.format_value(&SqlValue::from(old_name.as_str())),
                self.format_value(&SqlValue::from(new_name.as_str()))
            )],
            Expression::CreateColumn { table, column } => vec![self.add_column(table, column)],
            Expression::AlterColumn { table, column } => self.alter_column(table, column)?,
            Expression::DeleteColumn { table, columns } => columns
                .iter()
                .map(|column| {
                    format!(
                        "ALTER TABLE {} DROP COLUMN {}",
                        self.quote_identifier(table),
                        self.quote_identifier(column)
                    )
                })
                .collect(),
            Expression::RenameColumn {
                table,
                old_name,
                new_name,
            } => vec![format!(
                "EXEC sp_rename {}, {}, 'COLUMN'",
                self.format_value(&SqlValue::Text(format!("{table}.{old_name}"))),
                self.format_value(&SqlValue::from(new_name.as_str()))
            )],
            Expression::CreateIndex { index } => vec![self.create_index(index)],
            Expression::DeleteIndex { table, name } => vec![format!(
                "DROP INDEX {} ON {}",
                self.quote_identifier(name),
                self.quote_identifier(table)
            )],
            Expression::CreateForeignKey { foreign_key } => vec![format!(
                "ALTER TABLE {} ADD {}",
                self.quote_identifier(&foreign_key.foreign_table),
                foreign_key_clause(self, foreign_key)
            )],
            Expression::DeleteForeignKey { table, name }
            | Expression::DeleteConstraint { table, name } => {
                vec![self.drop_constraint(table, name)]
            }
            Expression::CreateConstraint { constraint } => vec![format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {} ({})",
                self.quote_identifier(&constraint.table),
                self.quote_identifier(&constraint.name),
                match constraint.kind {
                    ConstraintKind::PrimaryKey => "PRIMARY KEY CLUSTERED",
                    ConstraintKind::Unique => "UNIQUE NONCLUSTERED",
                },
                join_identifiers(self, constraint.columns.iter().map(String::as_str))
            )],
            Expression::InsertData { table, rows } => insert_rows(self, table, rows),
            Expression::UpdateData { table, set, filter } => {
                vec![update_rows(self, table, set, filter)]
            }
            Expression::DeleteData { table, filter } => vec![delete_rows(self, table, filter)],
            Expression::ExecuteSql { sql } => vec![sql.clone()],
        };
        Ok(statements)
    }
}

fn real_literal(value: f64) -> String {
    if value.is_finite() {
        format!("{value:?}")
    } else {
        "NULL".to_string()
    }
}

fn join_identifiers<'a>(
    syntax: &dyn SqlSyntax,
    names: impl Iterator<Item = &'a str>,
) -> String {
    names
        .map(|name| syntax.quote_identifier(name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn index_columns(syntax: &dyn SqlSyntax, index: &IndexDefinition) -> String {
    index
        .columns
        .iter()
        .map(|column| {
            let name = syntax.quote_identifier(&column.name);
            if column.descending {
                format!("{name} DESC")
            } else {
                name
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn foreign_key_clause(syntax: &dyn SqlSyntax, foreign_key: &ForeignKeyDefinition) -> String {
    let mut sql = format!(
        "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
        syntax.quote_identifier(&foreign_key.effective_name()),
        join_identifiers(syntax, foreign_key.foreign_columns.iter().map(String::as_str)),
        syntax.quote_identifier(&foreign_key.primary_table),
        join_identifiers(syntax, foreign_key.primary_columns.iter().map(String::as_str))
    );
    if let Some(rule) = foreign_key.on_delete.as_sql() {
        let _ = write!(sql, " ON DELETE {rule}");
    }
    if let Some(rule) = foreign_key.on_update.as_sql() {
        let _ = write!(sql, " ON UPDATE {rule}");
    }
    sql
}

fn insert_rows(
    syntax: &dyn SqlSyntax,
    table: &str,
    rows: &[BTreeMap<String, SqlValue>],
) -> Vec<String> {
    rows.iter()
        .map(|row| {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                syntax.quote_identifier(table),
                join_identifiers(syntax, row.keys().map(String::as_str)),
                row.values()
                    .map(|value| syntax.format_value(value))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
        .collect()
}

fn where_clause(syntax: &dyn SqlSyntax, filter: &RowFilter) -> String {
    match filter {
        RowFilter::AllRows => String::new(),
        RowFilter::Where(criteria) => {
            let terms = criteria
                .iter()
                .map(|(column, value)| {
                    let column = syntax.quote_identifier(column);
                    if value.is_null() {
                        format!("{column} IS NULL")
                    } else {
                        format!("{column} = {}", syntax.format_value(value))
                    }
                })
                .collect::<Vec<_>>();
            format!(" WHERE {}", terms.join(" AND "))
        }
    }
}

fn update_rows(
    syntax: &dyn SqlSyntax,
    table: &str,
    set: &BTreeMap<String, SqlValue>,
    filter: &RowFilter,
) -> String {
    let assignments = set
        .iter()
        .map(|(column, value)| {
            format!(
                "{} = {}",
                syntax.quote_identifier(column),
                syntax.format_value(value)
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {assignments}{}",
        syntax.quote_identifier(table),
        where_clause(syntax, filter)
    )
}

fn delete_rows(syntax: &dyn SqlSyntax, table: &str, filter: &RowFilter) -> String {
    format!(
        "DELETE FROM {}{}",
        syntax.quote_identifier(table),
        where_clause(syntax, filter)
    )
}
