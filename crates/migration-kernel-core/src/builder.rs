//! Fluent builders that produce [`Expression`]s.
//!
//! ```ignore
//! context.apply(
//!     Create::table("node")
//!         .with_column("id").as_int32().primary_key().identity()
//!         .with_column("path").as_string(255).not_nullable(),
//! )?;
//! ```

use std::collections::BTreeMap;

use crate::expression::Expression;
use crate::schema::{
    ColumnDefinition, ColumnType, ConstraintDefinition, ConstraintKind, DefaultValue,
    ForeignKeyDefinition, ForeignKeyRule, IndexColumn, IndexDefinition, RowFilter, SqlValue,
    TableDefinition,
};
use crate::MigrationError;

/// Conversion into a finished [`Expression`]; fails for incomplete builders.
pub trait IntoExpression {
    /// # Errors
    /// Returns [`MigrationError::IncompleteExpression`] when required parts are missing.
    fn into_expression(self) -> Result<Expression, MigrationError>;
}

impl IntoExpression for Expression {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        Ok(self)
    }
}

#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct ColumnDraft {
    name: String,
    column_type: Option<ColumnType>,
    nullable: bool,
    primary_key: bool,
    identity: bool,
    unique: bool,
    default: Option<DefaultValue>,
}

impl ColumnDraft {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: None,
            nullable: true,
            primary_key: false,
            identity: false,
            unique: false,
            default: None,
        }
    }

    fn finish(self, table: &str) -> Result<ColumnDefinition, MigrationError> {
        let Some(column_type) = self.column_type else {
            return Err(MigrationError::incomplete(format!(
                "column {table}.{} has no type",
                self.name
            )));
        };
        Ok(ColumnDefinition {
            name: self.name,
            column_type,
            nullable: self.nullable,
            primary_key: self.primary_key,
            identity: self.identity,
            unique: self.unique,
            default: self.default,
        })
    }
}

/// Column modifiers shared by every builder that declares a column.
/// Modifiers apply to the most recently declared column.
#[allow(clippy::wrong_self_convention)]
pub trait ColumnOptions: Sized {
    #[doc(hidden)]
    fn column_draft(&mut self) -> Option<&mut ColumnDraft>;

    #[doc(hidden)]
    fn record_misuse(&mut self, message: String);

    #[doc(hidden)]
    #[must_use]
    fn modify_column(mut self, operation: &str, apply: impl FnOnce(&mut ColumnDraft)) -> Self {
        match self.column_draft() {
            Some(draft) => apply(draft),
            None => self.record_misuse(format!("{operation} called before any column")),
        }
        self
    }

    #[must_use]
    fn as_type(self, column_type: ColumnType) -> Self {
        self.modify_column("as_type", |draft| draft.column_type = Some(column_type))
    }

    #[must_use]
    fn as_int32(self) -> Self {
        self.as_type(ColumnType::Int32)
    }

    #[must_use]
    fn as_int64(self) -> Self {
        self.as_type(ColumnType::Int64)
    }

    #[must_use]
    fn as_boolean(self) -> Self {
        self.as_type(ColumnType::Boolean)
    }

    #[must_use]
    fn as_double(self) -> Self {
        self.as_type(ColumnType::Double)
    }

    #[must_use]
    fn as_decimal(self, precision: u8, scale: u8) -> Self {
        self.as_type(ColumnType::Decimal { precision, scale })
    }

    #[must_use]
    fn as_string(self, length: u32) -> Self {
        self.as_type(ColumnType::String {
            length: Some(length),
        })
    }

    #[must_use]
    fn as_text(self) -> Self {
        self.as_type(ColumnType::Text)
    }

    #[must_use]
    fn as_datetime(self) -> Self {
        self.as_type(ColumnType::DateTime)
    }

    #[must_use]
    fn as_guid(self) -> Self {
        self.as_type(ColumnType::Guid)
    }

    #[must_use]
    fn as_binary(self) -> Self {
        self.as_type(ColumnType::Binary)
    }

    #[must_use]
    fn nullable(self) -> Self {
        self.modify_column("nullable", |draft| draft.nullable = true)
    }

    #[must_use]
    fn not_nullable(self) -> Self {
        self.modify_column("not_nullable", |draft| draft.nullable = false)
    }

    /// Marks the column as (part of) the primary key; implies `NOT NULL`.
    #[must_use]
    fn primary_key(self) -> Self {
        self.modify_column("primary_key", |draft| {
            draft.primary_key = true;
            draft.nullable = false;
        })
    }

    #[must_use]
    fn identity(self) -> Self {
        self.modify_column("identity", |draft| draft.identity = true)
    }

    #[must_use]
    fn unique(self) -> Self {
        self.modify_column("unique", |draft| draft.unique = true)
    }

    #[must_use]
    fn with_default(self, value: impl Into<SqlValue>) -> Self {
        let value = value.into();
        self.modify_column("with_default", |draft| {
            draft.default = Some(if value.is_null() {
                DefaultValue::Null
            } else {
                DefaultValue::Value(value)
            });
        })
    }

    #[must_use]
    fn with_default_current_timestamp(self) -> Self {
        self.modify_column("with_default_current_timestamp", |draft| {
            draft.default = Some(DefaultValue::CurrentTimestamp);
        })
    }

    #[must_use]
    fn with_default_new_guid(self) -> Self {
        self.modify_column("with_default_new_guid", |draft| {
            draft.default = Some(DefaultValue::NewGuid);
        })
    }
}

fn first_misuse(misuse: &mut Option<String>, message: String) {
    if misuse.is_none() {
        *misuse = Some(message);
    }
}

fn require_table(table: Option<String>, what: &str) -> Result<String, MigrationError> {
    match table {
        Some(table) if !table.trim().is_empty() => Ok(table),
        _ => Err(MigrationError::incomplete(format!("{what} has no table"))),
    }
}

pub struct Create;

impl Create {
    pub fn table(name: impl Into<String>) -> CreateTableBuilder {
        CreateTableBuilder {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            primary_key_name: None,
            misuse: None,
        }
    }

    pub fn column(name: impl Into<String>) -> CreateColumnBuilder {
        CreateColumnBuilder {
            table: None,
            draft: ColumnDraft::new(name),
            misuse: None,
        }
    }

    pub fn index() -> CreateIndexBuilder {
        CreateIndexBuilder {
            name: None,
            table: None,
            columns: Vec::new(),
            unique: false,
        }
    }

    pub fn foreign_key() -> CreateForeignKeyBuilder {
        CreateForeignKeyBuilder {
            name: None,
            foreign_table: None,
            foreign_columns: Vec::new(),
            primary_table: None,
            primary_columns: Vec::new(),
            on_delete: ForeignKeyRule::None,
            on_update: ForeignKeyRule::None,
        }
    }

    pub fn primary_key(name: impl Into<String>) -> CreateConstraintBuilder {
        CreateConstraintBuilder::new(name, ConstraintKind::PrimaryKey)
    }

    pub fn unique_constraint(name: impl Into<String>) -> CreateConstraintBuilder {
        CreateConstraintBuilder::new(name, ConstraintKind::Unique)
    }
}

#[must_use = "builders do nothing until applied to a MigrationContext"]
#[derive(Debug, Clone)]
pub struct CreateTableBuilder {
    name: String,
    columns: Vec<ColumnDraft>,
    indexes: Vec<IndexDefinition>,
    foreign_keys: Vec<ForeignKeyDefinition>,
    primary_key_name: Option<String>,
    misuse: Option<String>,
}

impl CreateTableBuilder {
    pub fn with_column(mut self, name: impl Into<String>) -> Self {
        self.columns.push(ColumnDraft::new(name));
        self
    }

    pub fn with_primary_key_name(mut self, name: impl Into<String>) -> Self {
        self.primary_key_name = Some(name.into());
        self
    }

    /// Adds an index on the given columns, named `IX_{table}_{columns}`.
    pub fn with_index(mut self, columns: &[&str], unique: bool) -> Self {
        let columns = columns
            .iter()
            .map(|name| IndexColumn::ascending(*name))
            .collect::<Vec<_>>();
        self.indexes.push(IndexDefinition {
            name: IndexDefinition::default_name(&self.name, &columns),
            table: self.name.clone(),
            columns,
            unique,
        });
        self
    }

    /// Adds a foreign key from the last declared column to `primary_table.primary_column`.
    pub fn foreign_key_to(
        mut self,
        primary_table: impl Into<String>,
        primary_column: impl Into<String>,
        on_delete: ForeignKeyRule,
    ) -> Self {
        let Some(column) = self.columns.last().map(|draft| draft.name.clone()) else {
            first_misuse(
                &mut self.misuse,
                "foreign_key_to called before any column".to_string(),
            );
            return self;
        };
        self.foreign_keys.push(ForeignKeyDefinition {
            name: None,
            foreign_table: self.name.clone(),
            foreign_columns: vec![column],
            primary_table: primary_table.into(),
            primary_columns: vec![primary_column.into()],
            on_delete,
            on_update: ForeignKeyRule::None,
        });
        self
    }

    /// # Errors
    /// Returns [`MigrationError::IncompleteExpression`] for misuse or untyped columns.
    pub fn into_definition(self) -> Result<TableDefinition, MigrationError> {
        if let Some(message) = self.misuse {
            return Err(MigrationError::incomplete(format!(
                "create table {}: {message}",
                self.name
            )));
        }
        let columns = self
            .columns
            .into_iter()
            .map(|draft| draft.finish(&self.name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TableDefinition {
            name: self.name,
            columns,
            indexes: self.indexes,
            foreign_keys: self.foreign_keys,
            primary_key_name: self.primary_key_name,
        })
    }
}

impl ColumnOptions for CreateTableBuilder {
    fn column_draft(&mut self) -> Option<&mut ColumnDraft> {
        self.columns.last_mut()
    }

    fn record_misuse(&mut self, message: String) {
        first_misuse(&mut self.misuse, message);
    }
}

impl IntoExpression for CreateTableBuilder {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        Ok(Expression::CreateTable {
            table: self.into_definition()?,
        })
    }
}

#[must_use = "builders do nothing until applied to a MigrationContext"]
#[derive(Debug, Clone)]
pub struct CreateColumnBuilder {
    table: Option<String>,
    draft: ColumnDraft,
    misuse: Option<String>,
}

impl CreateColumnBuilder {
    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

impl ColumnOptions for CreateColumnBuilder {
    fn column_draft(&mut self) -> Option<&mut ColumnDraft> {
        Some(&mut self.draft)
    }

    fn record_misuse(&mut self, message: String) {
        first_misuse(&mut self.misuse, message);
    }
}

impl IntoExpression for CreateColumnBuilder {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        if let Some(message) = self.misuse {
            return Err(MigrationError::incomplete(message));
        }
        let table = require_table(self.table, &format!("create column {}", self.draft.name))?;
        let column = self.draft.finish(&table)?;
        Ok(Expression::CreateColumn { table, column })
    }
}

#[must_use = "builders do nothing until applied to a MigrationContext"]
#[derive(Debug, Clone)]
pub struct CreateIndexBuilder {
    name: Option<String>,
    table: Option<String>,
    columns: Vec<IndexColumn>,
    unique: bool,
}

impl CreateIndexBuilder {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn on_column(mut self, column: impl Into<String>) -> Self {
        self.columns.push(IndexColumn::ascending(column));
        self
    }

    /// Sorts the last added column descending.
    pub fn descending(mut self) -> Self {
        if let Some(column) = self.columns.last_mut() {
            column.descending = true;
        }
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

impl IntoExpression for CreateIndexBuilder {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        let table = require_table(self.table, "create index")?;
        if self.columns.is_empty() {
            return Err(MigrationError::incomplete(format!(
                "create index on {table} has no columns"
            )));
        }
        let name = self
            .name
            .unwrap_or_else(|| IndexDefinition::default_name(&table, &self.columns));
        Ok(Expression::CreateIndex {
            index: IndexDefinition {
                name,
                table,
                columns: self.columns,
                unique: self.unique,
            },
        })
    }
}

#[must_use = "builders do nothing until applied to a MigrationContext"]
#[derive(Debug, Clone)]
pub struct CreateForeignKeyBuilder {
    name: Option<String>,
    foreign_table: Option<String>,
    foreign_columns: Vec<String>,
    primary_table: Option<String>,
    primary_columns: Vec<String>,
    on_delete: ForeignKeyRule,
    on_update: ForeignKeyRule,
}

impl CreateForeignKeyBuilder {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.foreign_table = Some(table.into());
        self
    }

    pub fn foreign_column(mut self, column: impl Into<String>) -> Self {
        self.foreign_columns.push(column.into());
        self
    }

    pub fn references(mut self, table: impl Into<String>) -> Self {
        self.primary_table = Some(table.into());
        self
    }

    pub fn primary_column(mut self, column: impl Into<String>) -> Self {
        self.primary_columns.push(column.into());
        self
    }

    pub fn on_delete(mut self, rule: ForeignKeyRule) -> Self {
        self.on_delete = rule;
        self
    }

    pub fn on_update(mut self, rule: ForeignKeyRule) -> Self {
        self.on_update = rule;
        self
    }
}

impl IntoExpression for CreateForeignKeyBuilder {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        let foreign_table = require_table(self.foreign_table, "foreign key source")?;
        let primary_table = require_table(self.primary_table, "foreign key target")?;
        if self.foreign_columns.is_empty() || self.primary_columns.is_empty() {
            return Err(MigrationError::incomplete(format!(
                "foreign key {foreign_table} -> {primary_table} has no columns"
            )));
        }
        Ok(Expression::CreateForeignKey {
            foreign_key: ForeignKeyDefinition {
                name: self.name,
                foreign_table,
                foreign_columns: self.foreign_columns,
                primary_table,
                primary_columns: self.primary_columns,
                on_delete: self.on_delete,
                on_update: self.on_update,
            },
        })
    }
}

#[must_use = "builders do nothing until applied to a MigrationContext"]
#[derive(Debug, Clone)]
pub struct CreateConstraintBuilder {
    name: String,
    kind: ConstraintKind,
    table: Option<String>,
    columns: Vec<String>,
}

impl CreateConstraintBuilder {
    fn new(name: impl Into<String>, kind: ConstraintKind) -> Self {
        Self {
            name: name.into(),
            kind,
            table: None,
            columns: Vec::new(),
        }
    }

    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.columns.push(column.into());
        self
    }
}

impl IntoExpression for CreateConstraintBuilder {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        let table = require_table(self.table, &format!("constraint {}", self.name))?;
        if self.columns.is_empty() {
            return Err(MigrationError::incomplete(format!(
                "constraint {} has no columns",
                self.name
            )));
        }
        Ok(Expression::CreateConstraint {
            constraint: ConstraintDefinition {
                name: self.name,
                table,
                kind: self.kind,
                columns: self.columns,
            },
        })
    }
}

pub struct Alter;

impl Alter {
    pub fn column(name: impl Into<String>) -> AlterColumnBuilder {
        AlterColumnBuilder {
            table: None,
            draft: ColumnDraft::new(name),
            misuse: None,
        }
    }

    /// Shorthand for adding a column to an existing table.
    pub fn add_column(table: impl Into<String>, name: impl Into<String>) -> CreateColumnBuilder {
        Create::column(name).on_table(table)
    }
}

/// Redefines an existing column. The full new definition is required.
#[must_use = "builders do nothing until applied to a MigrationContext"]
#[derive(Debug, Clone)]
pub struct AlterColumnBuilder {
    table: Option<String>,
    draft: ColumnDraft,
    misuse: Option<String>,
}

impl AlterColumnBuilder {
    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

impl ColumnOptions for AlterColumnBuilder {
    fn column_draft(&mut self) -> Option<&mut ColumnDraft> {
        Some(&mut self.draft)
    }

    fn record_misuse(&mut self, message: String) {
        first_misuse(&mut self.misuse, message);
    }
}

impl IntoExpression for AlterColumnBuilder {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        if let Some(message) = self.misuse {
            return Err(MigrationError::incomplete(message));
        }
        let table = require_table(self.table, &format!("alter column {}", self.draft.name))?;
        let column = self.draft.finish(&table)?;
        Ok(Expression::AlterColumn { table, column })
    }
}

pub struct Delete;

impl Delete {
    #[must_use]
    pub fn table(name: impl Into<String>) -> Expression {
        Expression::DeleteTable { table: name.into() }
    }

    pub fn column(name: impl Into<String>) -> DeleteColumnBuilder {
        DeleteColumnBuilder {
            table: None,
            columns: vec![name.into()],
        }
    }

    pub fn index(name: impl Into<String>) -> DeleteNamedBuilder {
        DeleteNamedBuilder::new(name, DeleteTarget::Index)
    }

    pub fn foreign_key(name: impl Into<String>) -> DeleteNamedBuilder {
        DeleteNamedBuilder::new(name, DeleteTarget::ForeignKey)
    }

    pub fn constraint(name: impl Into<String>) -> DeleteNamedBuilder {
        DeleteNamedBuilder::new(name, DeleteTarget::Constraint)
    }

    pub fn from_table(table: impl Into<String>) -> DeleteDataBuilder {
        DeleteDataBuilder {
            table: table.into(),
            criteria: BTreeMap::new(),
            all_rows: false,
        }
    }
}

#[must_use = "builders do nothing until applied to a MigrationContext"]
#[derive(Debug, Clone)]
pub struct DeleteColumnBuilder {
    table: Option<String>,
    columns: Vec<String>,
}

impl DeleteColumnBuilder {
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.columns.push(name.into());
        self
    }

    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

impl IntoExpression for DeleteColumnBuilder {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        let table = require_table(self.table, "delete column")?;
        Ok(Expression::DeleteColumn {
            table,
            columns: self.columns,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum DeleteTarget {
    Index,
    ForeignKey,
    Constraint,
}

#[must_use = "builders do nothing until applied to a MigrationContext"]
#[derive(Debug, Clone)]
pub struct DeleteNamedBuilder {
    name: String,
    target: DeleteTarget,
    table: Option<String>,
}

impl DeleteNamedBuilder {
    fn new(name: impl Into<String>, target: DeleteTarget) -> Self {
        Self {
            name: name.into(),
            target,
            table: None,
        }
    }

    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

impl IntoExpression for DeleteNamedBuilder {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        let table = require_table(self.table, &format!("delete {}", self.name))?;
        let name = self.name;
        Ok(match self.target {
            DeleteTarget::Index => Expression::DeleteIndex { table, name },
            DeleteTarget::ForeignKey => Expression::DeleteForeignKey { table, name },
            DeleteTarget::Constraint => Expression::DeleteConstraint { table, name },
        })
    }
}

#[must_use = "builders do nothing until applied to a MigrationContext"]
#[derive(Debug, Clone)]
pub struct DeleteDataBuilder {
    table: String,
    criteria: BTreeMap<String, SqlValue>,
    all_rows: bool,
}

impl DeleteDataBuilder {
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.criteria.insert(column.into(), value.into());
        self
    }

    pub fn all_rows(mut self) -> Self {
        self.all_rows = true;
        self
    }
}

impl IntoExpression for DeleteDataBuilder {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        Ok(Expression::DeleteData {
            filter: filter_from(&self.table, self.criteria, self.all_rows)?,
            table: self.table,
        })
    }
}

fn filter_from(
    table: &str,
    criteria: BTreeMap<String, SqlValue>,
    all_rows: bool,
) -> Result<RowFilter, MigrationError> {
    match (criteria.is_empty(), all_rows) {
        (true, true) => Ok(RowFilter::AllRows),
        (false, false) => Ok(RowFilter::Where(criteria)),
        (true, false) => Err(MigrationError::incomplete(format!(
            "data change on {table} needs where_eq(..) or all_rows()"
        ))),
        (false, true) => Err(MigrationError::incomplete(format!(
            "data change on {table} cannot combine where_eq(..) with all_rows()"
        ))),
    }
}

pub struct Rename;

impl Rename {
    pub fn table(old_name: impl Into<String>) -> RenameTableBuilder {
        RenameTableBuilder {
            old_name: old_name.into(),
            new_name: None,
        }
    }

    pub fn column(old_name: impl Into<String>) -> RenameColumnBuilder {
        RenameColumnBuilder {
            table: None,
            old_name: old_name.into(),
            new_name: None,
        }
    }
}

#[must_use = "builders do nothing until applied to a MigrationContext"]
#[derive(Debug, Clone)]
pub struct RenameTableBuilder {
    old_name: String,
    new_name: Option<String>,
}

impl RenameTableBuilder {
    pub fn to(mut self, new_name: impl Into<String>) -> Self {
        self.new_name = Some(new_name.into());
        self
    }
}

impl IntoExpression for RenameTableBuilder {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        let Some(new_name) = self.new_name else {
            return Err(MigrationError::incomplete(format!(
                "rename table {} has no target name",
                self.old_name
            )));
        };
        Ok(Expression::RenameTable {
            old_name: self.old_name,
            new_name,
        })
    }
}

#[must_use = "builders do nothing until applied to a MigrationContext"]
#[derive(Debug, Clone)]
pub struct RenameColumnBuilder {
    table: Option<String>,
    old_name: String,
    new_name: Option<String>,
}

impl RenameColumnBuilder {
    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn to(mut self, new_name: impl Into<String>) -> Self {
        self.new_name = Some(new_name.into());
        self
    }
}

impl IntoExpression for RenameColumnBuilder {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        let table = require_table(self.table, &format!("rename column {}", self.old_name))?;
        let Some(new_name) = self.new_name else {
            return Err(MigrationError::incomplete(format!(
                "rename column {table}.{} has no target name",
                self.old_name
            )));
        };
        Ok(Expression::RenameColumn {
            table,
            old_name: self.old_name,
            new_name,
        })
    }
}

pub struct Insert;

impl Insert {
    pub fn into_table(table: impl Into<String>) -> InsertBuilder {
        InsertBuilder {
            table: table.into(),
            rows: Vec::new(),
        }
    }
}

#[must_use = "builders do nothing until applied to a MigrationContext"]
#[derive(Debug, Clone)]
pub struct InsertBuilder {
    table: String,
    rows: Vec<BTreeMap<String, SqlValue>>,
}

impl InsertBuilder {
    pub fn row<I, K, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<SqlValue>,
    {
        self.rows.push(
            values
                .into_iter()
                .map(|(column, value)| (column.into(), value.into()))
                .collect(),
        );
        self
    }
}

impl IntoExpression for InsertBuilder {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        if self.rows.is_empty() {
            return Err(MigrationError::incomplete(format!(
                "insert into {} has no rows",
                self.table
            )));
        }
        Ok(Expression::InsertData {
            table: self.table,
            rows: self.rows,
        })
    }
}

pub struct Update;

impl Update {
    pub fn table(table: impl Into<String>) -> UpdateBuilder {
        UpdateBuilder {
            table: table.into(),
            set: BTreeMap::new(),
            criteria: BTreeMap::new(),
            all_rows: false,
        }
    }
}

#[must_use = "builders do nothing until applied to a MigrationContext"]
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    table: String,
    set: BTreeMap<String, SqlValue>,
    criteria: BTreeMap<String, SqlValue>,
    all_rows: bool,
}

impl UpdateBuilder {
    pub fn set(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.set.insert(column.into(), value.into());
        self
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.criteria.insert(column.into(), value.into());
        self
    }

    pub fn all_rows(mut self) -> Self {
        self.all_rows = true;
        self
    }
}

impl IntoExpression for UpdateBuilder {
    fn into_expression(self) -> Result<Expression, MigrationError> {
        if self.set.is_empty() {
            return Err(MigrationError::incomplete(format!(
                "update of {} has no set(..)",
                self.table
            )));
        }
        Ok(Expression::UpdateData {
            filter: filter_from(&self.table, self.criteria, self.all_rows)?,
            table: self.table,
            set: self.set,
        })
    }
}

pub struct Execute;

impl Execute {
    #[must_use]
    pub fn sql(sql: impl Into<String>) -> Expression {
        Expression::ExecuteSql { sql: sql.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T, MigrationError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn create_table_builder_collects_columns_indexes_and_keys() {
        let expression = must(
            Create::table("document")
                .with_column("id")
                .as_int32()
                .primary_key()
                .identity()
                .with_column("nodeId")
                .as_int32()
                .not_nullable()
                .foreign_key_to("node", "id", ForeignKeyRule::Cascade)
                .with_column("published")
                .as_boolean()
                .not_nullable()
                .with_default(false)
                .with_index(&["nodeId", "published"], true)
                .into_expression(),
        );

        let Expression::CreateTable { table } = expression else {
            panic!("expected create table");
        };
        assert_eq!(table.columns.len(), 3);
        let id = &table.columns[0];
        assert!(id.primary_key && id.identity && !id.nullable);
        assert_eq!(
            table.columns[2].default,
            Some(DefaultValue::Value(SqlValue::Boolean(false)))
        );
        assert_eq!(table.indexes[0].name, "IX_document_nodeId_published");
        assert!(table.indexes[0].unique);
        assert_eq!(table.foreign_keys[0].effective_name(), "FK_document_node_id");
        must(table.validate());
    }

    #[test]
    fn column_sizes_out_of_range_fail_validation() {
        for builder in [
            Create::column("slug").on_table("post").as_string(0),
            Create::column("price").on_table("post").as_decimal(0, 5),
        ] {
            let expression = must(builder.into_expression());
            assert!(matches!(
                expression.validate(),
                Err(MigrationError::Validation(_))
            ));
        }

        let expression = must(
            Alter::column("price")
                .on_table("post")
                .as_decimal(4, 6)
                .into_expression(),
        );
        assert!(matches!(
            expression.validate(),
            Err(MigrationError::Validation(_))
        ));
    }

    #[test]
    fn modifier_before_any_column_is_incomplete() {
        let err = match Create::table("node").as_int32().into_expression() {
            Ok(value) => panic!("expected misuse error, got {value:?}"),
            Err(err) => err,
        };
        assert_eq!(
            err,
            MigrationError::IncompleteExpression(
                "create table node: as_type called before any column".to_string()
            )
        );
    }

    #[test]
    fn create_column_requires_table_and_type() {
        assert!(Create::column("level").as_int32().into_expression().is_err());
        assert!(Create::column("level").on_table("node").into_expression().is_err());

        let expression = must(
            Alter::add_column("node", "level")
                .as_int32()
                .not_nullable()
                .with_default(0)
                .into_expression(),
        );
        assert_eq!(expression.describe(), "create column node.level");
    }

    #[test]
    fn index_builder_defaults_name_and_orders_columns() {
        let expression = must(
            Create::index()
                .on_table("log")
                .on_column("userId")
                .on_column("datestamp")
                .descending()
                .into_expression(),
        );
        let Expression::CreateIndex { index } = expression else {
            panic!("expected create index");
        };
        assert_eq!(index.name, "IX_log_userId_datestamp");
        assert!(!index.columns[0].descending);
        assert!(index.columns[1].descending);
    }

    #[test]
    fn data_builders_require_explicit_row_selection() {
        assert!(Update::table("node")
            .set("trashed", false)
            .into_expression()
            .is_err());
        assert!(Update::table("node")
            .set("trashed", false)
            .where_eq("id", 1)
            .all_rows()
            .into_expression()
            .is_err());

        let expression = must(Delete::from_table("lock").all_rows().into_expression());
        assert_eq!(
            expression,
            Expression::DeleteData {
                table: "lock".to_string(),
                filter: RowFilter::AllRows,
            }
        );

        assert!(Insert::into_table("lock").into_expression().is_err());
    }

    #[test]
    fn rename_builders_require_target() {
        assert!(Rename::table("a").into_expression().is_err());
        assert!(Rename::column("a").on_table("t").into_expression().is_err());
        let expression = must(Rename::column("a").on_table("t").to("b").into_expression());
        assert_eq!(expression.describe(), "rename column t.a to b");
    }

    #[test]
    fn delete_named_builders_map_to_expressions() {
        let expression = must(Delete::foreign_key("FK_a_b_id").on_table("a").into_expression());
        assert_eq!(
            expression,
            Expression::DeleteForeignKey {
                table: "a".to_string(),
                name: "FK_a_b_id".to_string(),
            }
        );
        assert!(Delete::index("IX_a").into_expression().is_err());
    }
}
