use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::builder::IntoExpression;
use crate::expression::{column_present, index_present, Expression, Guard};
use crate::schema::{ColumnDefinition, SqlValue, TableDefinition};
use crate::syntax::SqlSyntax;
use crate::MigrationError;

/// A result row keyed by column name.
pub type Row = BTreeMap<String, SqlValue>;

/// Live database handle a migration runs against, usually inside a transaction.
pub trait Database {
    fn syntax(&self) -> &dyn SqlSyntax;

    /// Executes a single statement and returns the number of affected rows.
    ///
    /// # Errors
    /// Returns [`MigrationError::Database`] when the statement fails.
    fn execute(&self, sql: &str) -> Result<usize, MigrationError>;

    /// # Errors
    /// Returns [`MigrationError::Database`] when the query fails.
    fn query(&self, sql: &str) -> Result<Vec<Row>, MigrationError>;

    /// # Errors
    /// Returns [`MigrationError::Database`] when introspection fails.
    fn table_exists(&self, table: &str) -> Result<bool, MigrationError>;

    /// # Errors
    /// Returns [`MigrationError::Database`] when introspection fails.
    fn column_names(&self, table: &str) -> Result<Vec<String>, MigrationError>;

    /// # Errors
    /// Returns [`MigrationError::Database`] when introspection fails.
    fn index_names(&self, table: &str) -> Result<Vec<String>, MigrationError>;
}

/// Persistent key-value pairs; the upgrader keeps each plan's state here.
pub trait KeyValueStore {
    /// # Errors
    /// Returns [`MigrationError::Database`] when the read fails.
    fn get_value(&self, key: &str) -> Result<Option<String>, MigrationError>;

    /// # Errors
    /// Returns [`MigrationError::Database`] when the write fails.
    fn set_value(&self, key: &str, value: &str) -> Result<(), MigrationError>;
}

/// A named unit of schema or data change.
pub trait Migration: Send + Sync {
    fn name(&self) -> &str;

    /// # Errors
    /// Any error aborts the enclosing transition and rolls back its scope.
    fn migrate(&self, context: &mut MigrationContext<'_>) -> Result<(), MigrationError>;
}

/// Migration that changes nothing; used to rename or alias a state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMigration;

impl Migration for NoopMigration {
    fn name(&self) -> &str {
        "noop"
    }

    fn migrate(&self, _context: &mut MigrationContext<'_>) -> Result<(), MigrationError> {
        Ok(())
    }
}

pub struct FnMigration<F> {
    name: String,
    body: F,
}

impl<F> Migration for FnMigration<F>
where
    F: Fn(&mut MigrationContext<'_>) -> Result<(), MigrationError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn migrate(&self, context: &mut MigrationContext<'_>) -> Result<(), MigrationError> {
        (self.body)(context)
    }
}

/// Wraps a closure as a [`Migration`].
pub fn migration_fn<F>(name: impl Into<String>, body: F) -> FnMigration<F>
where
    F: Fn(&mut MigrationContext<'_>) -> Result<(), MigrationError> + Send + Sync,
{
    FnMigration {
        name: name.into(),
        body,
    }
}

/// Execution context handed to [`Migration::migrate`].
///
/// Expressions are rendered with the database's syntax provider and executed
/// immediately, so a later existence check in the same migration sees the
/// effect of an earlier expression.
pub struct MigrationContext<'a> {
    database: &'a dyn Database,
    plan_name: &'a str,
    migration_name: String,
    statements: Vec<String>,
    skipped: Vec<String>,
    post_migrations: Vec<Arc<dyn Migration>>,
}

impl<'a> MigrationContext<'a> {
    #[must_use]
    pub fn new(database: &'a dyn Database, plan_name: &'a str, migration_name: &str) -> Self {
        Self {
            database,
            plan_name,
            migration_name: migration_name.to_string(),
            statements: Vec::new(),
            skipped: Vec::new(),
            post_migrations: Vec::new(),
        }
    }

    #[must_use]
    pub fn database(&self) -> &dyn Database {
        self.database
    }

    #[must_use]
    pub fn plan_name(&self) -> &str {
        self.plan_name
    }

    #[must_use]
    pub fn migration_name(&self) -> &str {
        &self.migration_name
    }

    /// Statements executed so far, in order.
    #[must_use]
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// Descriptions of expressions skipped because their guard did not hold.
    #[must_use]
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    #[must_use]
    pub fn post_migrations(&self) -> &[Arc<dyn Migration>] {
        &self.post_migrations
    }

    pub(crate) fn into_parts(self) -> (Vec<String>, Vec<String>, Vec<Arc<dyn Migration>>) {
        (self.statements, self.skipped, self.post_migrations)
    }

    /// Validates, renders, and executes an expression.
    ///
    /// # Errors
    /// Returns incomplete-builder, validation, dialect, or database errors.
    pub fn apply(&mut self, expression: impl IntoExpression) -> Result<(), MigrationError> {
        let expression = expression.into_expression()?;
        expression.validate()?;
        let statements = self.database.syntax().render(&expression)?;
        debug!(
            plan = self.plan_name,
            migration = %self.migration_name,
            expression = %expression.describe(),
            statements = statements.len(),
            "applying expression"
        );
        for statement in statements {
            self.run_statement(statement)?;
        }
        Ok(())
    }

    /// Applies the expression only when `guard` holds. Returns whether it ran.
    ///
    /// # Errors
    /// Propagates guard evaluation and [`MigrationContext::apply`] errors.
    pub fn apply_guarded(
        &mut self,
        guard: &Guard,
        expression: impl IntoExpression,
    ) -> Result<bool, MigrationError> {
        let expression = expression.into_expression()?;
        if !guard.holds(self.database)? {
            self.skip(&expression, guard);
            return Ok(false);
        }
        self.apply(expression)?;
        Ok(true)
    }

    /// Applies the expression unless its natural guard says it already ran.
    /// Expressions without a natural guard always run.
    ///
    /// # Errors
    /// Propagates guard evaluation and [`MigrationContext::apply`] errors.
    pub fn apply_if_needed(
        &mut self,
        expression: impl IntoExpression,
    ) -> Result<bool, MigrationError> {
        let expression = expression.into_expression()?;
        match expression.natural_guard() {
            Some(guard) => self.apply_guarded(&guard, expression),
            None => {
                self.apply(expression)?;
                Ok(true)
            }
        }
    }

    /// # Errors
    /// Propagates introspection failures.
    pub fn table_exists(&self, table: &str) -> Result<bool, MigrationError> {
        self.database.table_exists(table)
    }

    /// # Errors
    /// Propagates introspection failures.
    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool, MigrationError> {
        column_present(self.database, table, column)
    }

    /// # Errors
    /// Propagates introspection failures.
    pub fn index_exists(&self, table: &str, index: &str) -> Result<bool, MigrationError> {
        index_present(self.database, table, index)
    }

    /// # Errors
    /// Propagates guard evaluation and [`MigrationContext::apply`] errors.
    pub fn add_column_if_missing(
        &mut self,
        table: &str,
        column: ColumnDefinition,
    ) -> Result<bool, MigrationError> {
        self.apply_if_needed(Expression::CreateColumn {
            table: table.to_string(),
            column,
        })
    }

    /// # Errors
    /// Propagates guard evaluation and [`MigrationContext::apply`] errors.
    pub fn create_table_if_missing(
        &mut self,
        table: TableDefinition,
    ) -> Result<bool, MigrationError> {
        self.apply_if_needed(Expression::CreateTable { table })
    }

    /// # Errors
    /// Returns [`MigrationError::Database`] when the statement fails.
    pub fn execute_sql(&mut self, sql: impl Into<String>) -> Result<(), MigrationError> {
        self.apply(Expression::ExecuteSql { sql: sql.into() })
    }

    /// Runs a data-fixup code block against the database.
    ///
    /// # Errors
    /// Errors from the block are wrapped with its description.
    pub fn execute_code<T, F>(&mut self, description: &str, block: F) -> Result<T, MigrationError>
    where
        F: FnOnce(&dyn Database) -> Result<T, MigrationError>,
    {
        debug!(
            plan = self.plan_name,
            migration = %self.migration_name,
            description,
            "executing code block"
        );
        let value = block(self.database).map_err(|err| MigrationError::Migration {
            migration: self.migration_name.clone(),
            message: format!("{description}: {err}"),
        })?;
        self.statements.push(format!("-- code: {description}"));
        Ok(value)
    }

    /// Registers a migration to run once after the whole plan completes.
    /// Registering the same name twice keeps the first registration.
    pub fn add_post_migration(&mut self, migration: Arc<dyn Migration>) {
        if self
            .post_migrations
            .iter()
            .any(|existing| existing.name() == migration.name())
        {
            return;
        }
        self.post_migrations.push(migration);
    }

    fn run_statement(&mut self, statement: String) -> Result<(), MigrationError> {
        self.database.execute(&statement)?;
        self.statements.push(statement);
        Ok(())
    }

    fn skip(&mut self, expression: &Expression, guard: &Guard) {
        debug!(
            plan = self.plan_name,
            migration = %self.migration_name,
            expression = %expression.describe(),
            guard = %guard.describe(),
            "skipping expression; guard does not hold"
        );
        self.skipped.push(format!(
            "{} (guard: {})",
            expression.describe(),
            guard.describe()
        ));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::collections::{BTreeMap, BTreeSet};

    use super::{Database, KeyValueStore, Row};
    use crate::syntax::{SqlSyntax, SqliteSyntax};
    use crate::MigrationError;

    /// In-memory stand-in; tests seed tables and inspect executed statements.
    #[derive(Default, Clone)]
    pub(crate) struct RecordingDatabase {
        pub executed: RefCell<Vec<String>>,
        pub tables: RefCell<BTreeMap<String, BTreeSet<String>>>,
        pub indexes: RefCell<BTreeMap<String, BTreeSet<String>>>,
        pub values: RefCell<BTreeMap<String, String>>,
        pub fail_on: RefCell<Option<String>>,
    }

    impl RecordingDatabase {
        pub(crate) fn with_table(self, table: &str, columns: &[&str]) -> Self {
            self.tables.borrow_mut().insert(
                table.to_string(),
                columns.iter().map(|item| (*item).to_string()).collect(),
            );
            self
        }
    }

    impl Database for RecordingDatabase {
        fn syntax(&self) -> &dyn SqlSyntax {
            &SqliteSyntax
        }

        fn execute(&self, sql: &str) -> Result<usize, MigrationError> {
            if let Some(fragment) = self.fail_on.borrow().as_deref() {
                if sql.contains(fragment) {
                    return Err(MigrationError::Database(format!("forced failure: {sql}")));
                }
            }
            self.executed.borrow_mut().push(sql.to_string());
            Ok(0)
        }

        fn query(&self, _sql: &str) -> Result<Vec<Row>, MigrationError> {
            Ok(Vec::new())
        }

        fn table_exists(&self, table: &str) -> Result<bool, MigrationError> {
            Ok(self.tables.borrow().contains_key(table))
        }

        fn column_names(&self, table: &str) -> Result<Vec<String>, MigrationError> {
            Ok(self
                .tables
                .borrow()
                .get(table)
                .map(|columns| columns.iter().cloned().collect())
                .unwrap_or_default())
        }

        fn index_names(&self, table: &str) -> Result<Vec<String>, MigrationError> {
            Ok(self
                .indexes
                .borrow()
                .get(table)
                .map(|indexes| indexes.iter().cloned().collect())
                .unwrap_or_default())
        }
    }

    impl KeyValueStore for RecordingDatabase {
        fn get_value(&self, key: &str) -> Result<Option<String>, MigrationError> {
            Ok(self.values.borrow().get(key).cloned())
        }

        fn set_value(&self, key: &str, value: &str) -> Result<(), MigrationError> {
            self.values
                .borrow_mut()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }
    }
}
