//! Schema-migration engine: expressions, fluent builders, SQL syntax providers,
//! migration plans, and the upgrader that walks a plan against a database.
//!
//! Storage backends plug in through [`ScopeProvider`] / [`MigrationScope`];
//! see `migration-kernel-store-sqlite` for the `SQLite` implementation.

#![allow(clippy::module_name_repetitions)]

mod builder;
mod document;
mod expression;
mod migration;
mod plan;
mod schema;
mod syntax;
mod upgrader;

pub use builder::{
    Alter, AlterColumnBuilder, ColumnOptions, Create, CreateColumnBuilder,
    CreateConstraintBuilder, CreateForeignKeyBuilder, CreateIndexBuilder, CreateTableBuilder,
    Delete, DeleteColumnBuilder, DeleteDataBuilder, DeleteNamedBuilder, Execute, Insert,
    InsertBuilder, IntoExpression, Rename, RenameColumnBuilder, RenameTableBuilder, Update,
    UpdateBuilder,
};
pub use document::{MigrationDocument, OperationDocument, PlanDocument, StepDocument};
pub use expression::{Expression, Guard};
pub use migration::{
    migration_fn, Database, FnMigration, KeyValueStore, Migration, MigrationContext,
    NoopMigration, Row,
};
pub use plan::{MigrationPlan, Transition, INITIAL_STATE};
pub use schema::{
    ColumnDefinition, ColumnType, ConstraintDefinition, ConstraintKind, DefaultValue,
    ForeignKeyDefinition, ForeignKeyRule, IndexColumn, IndexDefinition, RowFilter, SqlValue,
    TableDefinition,
};
pub use syntax::{syntax_for, Dialect, SqlServerSyntax, SqlSyntax, SqliteSyntax};
pub use upgrader::{
    CompletedTransition, ExecutedMigrationPlan, MigrationScope, PendingTransition,
    ScopeProvider, TransitionRecord, UpgradeStatus, Upgrader, POST_MIGRATIONS_KEY_PREFIX,
    STATE_KEY_PREFIX,
};

/// Convenience imports for code that defines migrations.
pub mod prelude {
    pub use crate::{
        migration_fn, Alter, ColumnOptions, Create, Delete, Execute, Expression, Guard, Insert,
        Migration, MigrationContext, MigrationError, MigrationPlan, Rename, RowFilter, SqlValue,
        Update,
    };
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrationError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("incomplete expression: {0}")]
    IncompleteExpression(String),
    #[error("{dialect} does not support {operation}")]
    Unsupported {
        dialect: &'static str,
        operation: String,
    },
    #[error("plan error: {0}")]
    Plan(String),
    #[error("unknown state \"{0}\"")]
    UnknownState(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("migration {migration} failed: {message}")]
    Migration { migration: String, message: String },
    #[error("document error: {0}")]
    Document(String),
}

impl MigrationError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn incomplete(message: impl Into<String>) -> Self {
        Self::IncompleteExpression(message.into())
    }

    pub(crate) fn plan(message: impl Into<String>) -> Self {
        Self::Plan(message.into())
    }
}
