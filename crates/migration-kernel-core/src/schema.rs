use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::MigrationError;

/// Logical column type; rendered per dialect by a [`crate::SqlSyntax`].
///
/// Serialized in plan documents as its textual form, e.g. `"string(255)"`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    Int32,
    Int64,
    Boolean,
    Double,
    Decimal { precision: u8, scale: u8 },
    String { length: Option<u32> },
    Text,
    DateTime,
    Guid,
    Binary,
}

impl ColumnType {
    pub const DEFAULT_DECIMAL: Self = Self::Decimal {
        precision: 18,
        scale: 2,
    };

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match value {
            "int32" => return Some(Self::Int32),
            "int64" => return Some(Self::Int64),
            "boolean" => return Some(Self::Boolean),
            "double" => return Some(Self::Double),
            "decimal" => return Some(Self::DEFAULT_DECIMAL),
            "string" => return Some(Self::String { length: None }),
            "text" => return Some(Self::Text),
            "datetime" => return Some(Self::DateTime),
            "guid" => return Some(Self::Guid),
            "binary" => return Some(Self::Binary),
            _ => {}
        }

        let (head, args) = value.split_once('(')?;
        let args = args.strip_suffix(')')?;
        match head {
            "string" => {
                let length = args.trim().parse::<u32>().ok()?;
                if length == 0 {
                    return None;
                }
                Some(Self::String {
                    length: Some(length),
                })
            }
            "decimal" => {
                let (precision, scale) = args.split_once(',')?;
                let precision = precision.trim().parse::<u8>().ok()?;
                let scale = scale.trim().parse::<u8>().ok()?;
                if precision == 0 || scale > precision {
                    return None;
                }
                Some(Self::Decimal { precision, scale })
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int32 | Self::Int64)
    }
}

impl Display for ColumnType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int32 => f.write_str("int32"),
            Self::Int64 => f.write_str("int64"),
            Self::Boolean => f.write_str("boolean"),
            Self::Double => f.write_str("double"),
            Self::Decimal { precision, scale } => write!(f, "decimal({precision},{scale})"),
            Self::String { length: None } => f.write_str("string"),
            Self::String {
                length: Some(length),
            } => write!(f, "string({length})"),
            Self::Text => f.write_str("text"),
            Self::DateTime => f.write_str("datetime"),
            Self::Guid => f.write_str("guid"),
            Self::Binary => f.write_str("binary"),
        }
    }
}

impl TryFrom<String> for ColumnType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid column type: {value}"))
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Boolean(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    Null,
    Value(SqlValue),
    CurrentTimestamp,
    NewGuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub identity: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            primary_key: false,
            identity: false,
            unique: false,
            default: None,
        }
    }

    /// Validates a single column outside of any table context.
    ///
    /// # Errors
    /// Returns [`MigrationError::Validation`] for an empty name, a zero string
    /// length, a decimal precision or scale out of range, or an identity
    /// column that is not integer typed.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.name.trim().is_empty() {
            return Err(MigrationError::validation("column name MUST be provided"));
        }

        match self.column_type {
            ColumnType::String { length: Some(0) } => {
                return Err(MigrationError::validation(format!(
                    "string column {} MUST have a positive length",
                    self.name
                )));
            }
            ColumnType::Decimal { precision, scale } if precision == 0 || scale > precision => {
                return Err(MigrationError::validation(format!(
                    "decimal column {} MUST have 0 < precision and scale <= precision, found {}",
                    self.name, self.column_type
                )));
            }
            _ => {}
        }

        if self.identity && !self.column_type.is_integer() {
            return Err(MigrationError::validation(format!(
                "identity column {} MUST be int32 or int64, found {}",
                self.name, self.column_type
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexColumn {
    pub name: String,
    #[serde(default)]
    pub descending: bool,
}

impl IndexColumn {
    #[must_use]
    pub fn ascending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descending: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: String,
    pub table: String,
    pub columns: Vec<IndexColumn>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    #[must_use]
    pub fn default_name(table: &str, columns: &[IndexColumn]) -> String {
        let mut name = format!("IX_{table}");
        for column in columns {
            name.push('_');
            name.push_str(&column.name);
        }
        name
    }

    /// # Errors
    /// Returns [`MigrationError::Validation`] when the index has no name,
    /// table, or columns.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.name.trim().is_empty() {
            return Err(MigrationError::validation("index name MUST be provided"));
        }
        if self.table.trim().is_empty() {
            return Err(MigrationError::validation(format!(
                "index {} MUST name a table",
                self.name
            )));
        }
        if self.columns.is_empty() {
            return Err(MigrationError::validation(format!(
                "index {} MUST have at least one column",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyRule {
    #[default]
    None,
    Cascade,
    SetNull,
    SetDefault,
}

impl ForeignKeyRule {
    #[must_use]
    pub fn as_sql(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Cascade => Some("CASCADE"),
            Self::SetNull => Some("SET NULL"),
            Self::SetDefault => Some("SET DEFAULT"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub foreign_table: String,
    pub foreign_columns: Vec<String>,
    pub primary_table: String,
    pub primary_columns: Vec<String>,
    #[serde(default)]
    pub on_delete: ForeignKeyRule,
    #[serde(default)]
    pub on_update: ForeignKeyRule,
}

impl ForeignKeyDefinition {
    #[must_use]
    pub fn effective_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!(
                "FK_{}_{}_{}",
                self.foreign_table,
                self.primary_table,
                self.primary_columns.join("_")
            ),
        }
    }

    /// # Errors
    /// Returns [`MigrationError::Validation`] when either side has no table or
    /// columns, or the column counts differ.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let name = self.effective_name();
        if self.foreign_table.trim().is_empty() || self.primary_table.trim().is_empty() {
            return Err(MigrationError::validation(format!(
                "foreign key {name} MUST name both tables"
            )));
        }
        if self.foreign_columns.is_empty() || self.primary_columns.is_empty() {
            return Err(MigrationError::validation(format!(
                "foreign key {name} MUST list columns on both sides"
            )));
        }
        if self.foreign_columns.len() != self.primary_columns.len() {
            return Err(MigrationError::validation(format!(
                "foreign key {name} column count mismatch: {} foreign vs {} primary",
                self.foreign_columns.len(),
                self.primary_columns.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConstraintDefinition {
    pub name: String,
    pub table: String,
    pub kind: ConstraintKind,
    pub columns: Vec<String>,
}

impl ConstraintDefinition {
    /// # Errors
    /// Returns [`MigrationError::Validation`] for a nameless or columnless constraint.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.name.trim().is_empty() || self.table.trim().is_empty() {
            return Err(MigrationError::validation(
                "constraint MUST have a name and a table",
            ));
        }
        if self.columns.is_empty() {
            return Err(MigrationError::validation(format!(
                "constraint {} MUST have at least one column",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKeyDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key_name: Option<String>,
}

impl TableDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            primary_key_name: None,
        }
    }

    #[must_use]
    pub fn primary_key_columns(&self) -> Vec<&ColumnDefinition> {
        self.columns.iter().filter(|item| item.primary_key).collect()
    }

    #[must_use]
    pub fn effective_primary_key_name(&self) -> String {
        self.primary_key_name
            .clone()
            .unwrap_or_else(|| format!("PK_{}", self.name))
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|item| item.name == name)
    }

    /// Checks the table as a whole: names, duplicate columns, identity rules,
    /// and every nested index and foreign key.
    ///
    /// # Errors
    /// Returns the first [`MigrationError::Validation`] found.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.name.trim().is_empty() {
            return Err(MigrationError::validation("table name MUST be provided"));
        }
        if self.columns.is_empty() {
            return Err(MigrationError::validation(format!(
                "table {} MUST have at least one column",
                self.name
            )));
        }

        let mut seen = BTreeSet::new();
        for column in &self.columns {
            column.validate()?;
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(MigrationError::validation(format!(
                    "table {} declares column {} more than once",
                    self.name, column.name
                )));
            }
        }

        let primary_keys = self.primary_key_columns();
        let identities = self.columns.iter().filter(|item| item.identity).count();
        if identities > 1 {
            return Err(MigrationError::validation(format!(
                "table {} declares more than one identity column",
                self.name
            )));
        }
        if let Some(identity) = self.columns.iter().find(|item| item.identity) {
            if primary_keys.len() != 1 || !identity.primary_key {
                return Err(MigrationError::validation(format!(
                    "identity column {}.{} MUST be the only primary key column",
                    self.name, identity.name
                )));
            }
        }

        for index in &self.indexes {
            index.validate()?;
            ensure_columns_declared(self, index.columns.iter().map(|item| item.name.as_str()))?;
        }
        for foreign_key in &self.foreign_keys {
            foreign_key.validate()?;
            ensure_columns_declared(self, foreign_key.foreign_columns.iter().map(String::as_str))?;
        }

        Ok(())
    }
}

fn ensure_columns_declared<'a>(
    table: &TableDefinition,
    columns: impl Iterator<Item = &'a str>,
) -> Result<(), MigrationError> {
    for column in columns {
        if table.column(column).is_none() {
            return Err(MigrationError::validation(format!(
                "table {} has no column {column}",
                table.name
            )));
        }
    }
    Ok(())
}

/// Row selection for update and delete data expressions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RowFilter {
    AllRows,
    Where(BTreeMap<String, SqlValue>),
}

impl RowFilter {
    #[must_use]
    pub fn where_eq(column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        let mut criteria = BTreeMap::new();
        criteria.insert(column.into(), value.into());
        Self::Where(criteria)
    }
}
