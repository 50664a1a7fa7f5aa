#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use migration_kernel_core::{
    Database, ExecutedMigrationPlan, KeyValueStore, MigrationError, MigrationPlan,
    MigrationScope, Row, ScopeProvider, SqlSyntax, SqlValue, SqliteSyntax, TableDefinition,
    TransitionRecord, UpgradeStatus, Upgrader,
};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};
use ulid::Ulid;

const SCHEMA_MIGRATION_STATE_V1: &str = r"
CREATE TABLE IF NOT EXISTS migration_key_value (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS migration_history (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  plan TEXT NOT NULL,
  source_state TEXT NOT NULL,
  target_state TEXT NOT NULL,
  migration TEXT NOT NULL,
  statements_json TEXT NOT NULL DEFAULT '[]',
  skipped_json TEXT NOT NULL DEFAULT '[]',
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_migration_history_no_update
BEFORE UPDATE ON migration_history
BEGIN
  SELECT RAISE(FAIL, 'migration_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_migration_history_no_delete
BEFORE DELETE ON migration_history
BEGIN
  SELECT RAISE(FAIL, 'migration_history is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_migration_history_plan_seq
  ON migration_history(plan, seq);
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub busy_timeout_ms: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
        }
    }
}

pub struct SqliteMigrationStore {
    conn: Connection,
    run_id: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub seq: i64,
    pub run_id: String,
    pub plan: String,
    pub source_state: String,
    pub target_state: String,
    pub migration: String,
    pub statements: Vec<String>,
    pub skipped: Vec<String>,
    pub recorded_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct KeyValueEntry {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchemaIssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaIssue {
    pub code: String,
    pub severity: SchemaIssueSeverity,
    pub table: String,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub tables_checked: usize,
    pub issues: Vec<SchemaIssue>,
}

impl SqliteMigrationStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &StoreOptions::default())
    }

    pub fn open_with(path: &Path, options: &StoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            options.busy_timeout_ms
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            run_id: Ulid::new().to_string(),
        })
    }

    /// Creates the key-value and history tables. Safe to call repeatedly.
    pub fn bootstrap(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_MIGRATION_STATE_V1)
            .context("failed to apply migration state schema")?;
        Ok(())
    }

    pub fn upgrade(&mut self, plan: MigrationPlan) -> Result<ExecutedMigrationPlan> {
        self.bootstrap()?;
        self.run_id = Ulid::new().to_string();
        let upgrader = Upgrader::new(plan);
        info!(
            plan = upgrader.plan().name(),
            run_id = %self.run_id,
            "starting upgrade run"
        );
        let report = upgrader
            .execute(self)
            .with_context(|| format!("failed to upgrade plan {}", upgrader.plan().name()))?;
        Ok(report)
    }

    pub fn upgrade_status(&mut self, plan: MigrationPlan) -> Result<UpgradeStatus> {
        self.bootstrap()?;
        let upgrader = Upgrader::new(plan);
        let status = upgrader
            .status(self)
            .with_context(|| format!("failed to read status of plan {}", upgrader.plan().name()))?;
        Ok(status)
    }

    /// The most recent `limit` history entries, oldest first.
    pub fn history(&self, plan: Option<&str>, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        if !table_exists(&self.conn, "migration_history")? {
            return Ok(Vec::new());
        }

        let limit = match limit {
            Some(value) => i64::try_from(value).context("history limit is too large")?,
            None => -1,
        };
        let mut stmt = self
            .conn
            .prepare(
                "SELECT seq, run_id, plan, source_state, target_state, migration,
                        statements_json, skipped_json, recorded_at
                 FROM migration_history
                 WHERE ?1 IS NULL OR plan = ?1
                 ORDER BY seq DESC
                 LIMIT ?2",
            )
            .context("failed to prepare history query")?;
        let rows = stmt
            .query_map(params![plan, limit], parse_history_row)
            .context("failed to query migration history")?;
        let mut entries = collect_rows(rows)?;
        entries.reverse();
        Ok(entries)
    }

    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        if !table_exists(&self.conn, "migration_key_value")? {
            return Ok(None);
        }
        read_value(&self.conn, key).with_context(|| format!("failed to read key {key}"))
    }

    pub fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.bootstrap()?;
        write_value(&self.conn, key, value).with_context(|| format!("failed to write key {key}"))
    }

    pub fn key_values(&self) -> Result<Vec<KeyValueEntry>> {
        if !table_exists(&self.conn, "migration_key_value")? {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, updated_at FROM migration_key_value ORDER BY key ASC")
            .context("failed to prepare key-value query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(KeyValueEntry {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })
            .context("failed to query key-value pairs")?;
        collect_rows(rows)
    }

    /// Compares the live schema with the expected table definitions.
    pub fn schema_check(&self, expected: &[TableDefinition]) -> Result<SchemaCheck> {
        let mut issues = Vec::new();

        for table in expected {
            if !table_exists(&self.conn, &table.name)? {
                issues.push(SchemaIssue {
                    code: "missing_table".to_string(),
                    severity: SchemaIssueSeverity::Error,
                    table: table.name.clone(),
                    message: format!("table {} does not exist", table.name),
                });
                continue;
            }

            let actual = table_columns(&self.conn, &table.name)?;
            for column in &table.columns {
                if !actual
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(&column.name))
                {
                    issues.push(SchemaIssue {
                        code: "missing_column".to_string(),
                        severity: SchemaIssueSeverity::Error,
                        table: table.name.clone(),
                        message: format!("missing column {}.{}", table.name, column.name),
                    });
                }
            }
            for candidate in &actual {
                if !table
                    .columns
                    .iter()
                    .any(|column| column.name.eq_ignore_ascii_case(candidate))
                {
                    issues.push(SchemaIssue {
                        code: "unexpected_column".to_string(),
                        severity: SchemaIssueSeverity::Warning,
                        table: table.name.clone(),
                        message: format!("unexpected column {}.{candidate}", table.name),
                    });
                }
            }

            let indexes = index_names(&self.conn, &table.name)?
                .into_iter()
                .map(|name| name.to_ascii_lowercase())
                .collect::<BTreeSet<_>>();
            for index in &table.indexes {
                if !indexes.contains(&index.name.to_ascii_lowercase()) {
                    issues.push(SchemaIssue {
                        code: "missing_index".to_string(),
                        severity: SchemaIssueSeverity::Warning,
                        table: table.name.clone(),
                        message: format!("missing index {} on {}", index.name, table.name),
                    });
                }
            }
        }

        let healthy = !issues
            .iter()
            .any(|item| item.severity == SchemaIssueSeverity::Error);

        Ok(SchemaCheck {
            contract_version: "schema_check.v1".to_string(),
            healthy,
            tables_checked: expected.len(),
            issues,
        })
    }
}

impl ScopeProvider for SqliteMigrationStore {
    type Scope<'s> = SqliteScope<'s> where Self: 's;

    fn begin(&mut self) -> Result<Self::Scope<'_>, MigrationError> {
        let run_id = self.run_id.clone();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| database_error("failed to begin migration scope", &err))?;
        Ok(SqliteScope { tx, run_id })
    }
}

/// One transaction. Dropping it without [`MigrationScope::complete`] rolls back.
pub struct SqliteScope<'s> {
    tx: Transaction<'s>,
    run_id: String,
}

impl SqliteScope<'_> {
    // `changes()` keeps the last DML count across DDL, so diff the running total.
    fn total_changes(&self) -> Result<i64, MigrationError> {
        self.tx
            .query_row("SELECT total_changes()", [], |row| row.get(0))
            .map_err(|err| database_error("failed to read total_changes", &err))
    }
}

impl Database for SqliteScope<'_> {
    fn syntax(&self) -> &dyn SqlSyntax {
        &SqliteSyntax
    }

    /// Returns the rows changed by `sql` itself. DDL reports 0.
    fn execute(&self, sql: &str) -> Result<usize, MigrationError> {
        debug!(sql, "executing statement");
        let before = self.total_changes()?;
        self.tx
            .execute_batch(sql)
            .map_err(|err| database_error(&format!("statement failed: {sql}"), &err))?;
        let after = self.total_changes()?;
        Ok(usize::try_from(after.saturating_sub(before)).unwrap_or(usize::MAX))
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>, MigrationError> {
        let mut stmt = self
            .tx
            .prepare(sql)
            .map_err(|err| database_error(&format!("failed to prepare query: {sql}"), &err))?;
        let columns = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let mut rows = stmt
            .query([])
            .map_err(|err| database_error(&format!("query failed: {sql}"), &err))?;

        let mut result = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|err| database_error("failed to read query row", &err))?
        {
            let mut values = Row::new();
            for (index, column) in columns.iter().enumerate() {
                let value = row
                    .get_ref(index)
                    .map_err(|err| database_error("failed to read query column", &err))?;
                values.insert(column.clone(), sql_value(value));
            }
            result.push(values);
        }
        Ok(result)
    }

    fn table_exists(&self, table: &str) -> Result<bool, MigrationError> {
        table_exists(&self.tx, table).map_err(|err| MigrationError::Database(format!("{err:#}")))
    }

    fn column_names(&self, table: &str) -> Result<Vec<String>, MigrationError> {
        table_columns(&self.tx, table).map_err(|err| MigrationError::Database(format!("{err:#}")))
    }

    fn index_names(&self, table: &str) -> Result<Vec<String>, MigrationError> {
        index_names(&self.tx, table).map_err(|err| MigrationError::Database(format!("{err:#}")))
    }
}

impl KeyValueStore for SqliteScope<'_> {
    fn get_value(&self, key: &str) -> Result<Option<String>, MigrationError> {
        read_value(&self.tx, key).map_err(|err| MigrationError::Database(format!("{err:#}")))
    }

    fn set_value(&self, key: &str, value: &str) -> Result<(), MigrationError> {
        write_value(&self.tx, key, value)
            .map_err(|err| MigrationError::Database(format!("{err:#}")))
    }
}

impl MigrationScope for SqliteScope<'_> {
    fn record_transition(&self, record: &TransitionRecord) -> Result<(), MigrationError> {
        let statements_json = serde_json::to_string(&record.statements)
            .map_err(|err| MigrationError::Database(format!("failed to encode statements: {err}")))?;
        let skipped_json = serde_json::to_string(&record.skipped)
            .map_err(|err| MigrationError::Database(format!("failed to encode skipped: {err}")))?;
        let recorded_at = now_rfc3339().map_err(|err| MigrationError::Database(format!("{err:#}")))?;

        self.tx
            .execute(
                "INSERT INTO migration_history(
                    run_id, plan, source_state, target_state, migration,
                    statements_json, skipped_json, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    self.run_id,
                    record.plan,
                    record.source,
                    record.target,
                    record.migration,
                    statements_json,
                    skipped_json,
                    recorded_at,
                ],
            )
            .map_err(|err| database_error("failed to append migration history", &err))?;
        Ok(())
    }

    fn complete(self) -> Result<(), MigrationError> {
        self.tx
            .commit()
            .map_err(|err| database_error("failed to commit migration scope", &err))
    }
}

fn database_error(message: &str, err: &rusqlite::Error) -> MigrationError {
    MigrationError::Database(format!("{message}: {err}"))
}

fn sql_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(value) => SqlValue::Integer(value),
        ValueRef::Real(value) => SqlValue::Real(value),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}

fn read_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM migration_key_value WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("failed to query migration_key_value")?;
    Ok(value)
}

fn write_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT INTO migration_key_value(key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now],
    )
    .context("failed to upsert migration_key_value")?;
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1 COLLATE NOCASE
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!(
            "PRAGMA table_info({})",
            SqliteSyntax.quote_identifier(table_name)
        ))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    Ok(available)
}

fn index_names(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!(
            "PRAGMA index_list({})",
            SqliteSyntax.quote_identifier(table_name)
        ))
        .with_context(|| format!("failed to inspect index_list for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut names = Vec::new();
    while let Some(row) = rows.next()? {
        names.push(row.get::<_, String>(1)?);
    }

    Ok(names)
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let statements_json: String = row.get(6)?;
    let skipped_json: String = row.get(7)?;
    Ok(HistoryEntry {
        seq: row.get(0)?,
        run_id: row.get(1)?,
        plan: row.get(2)?,
        source_state: row.get(3)?,
        target_state: row.get(4)?,
        migration: row.get(5)?,
        statements: parse_json_list(6, &statements_json)?,
        skipped: parse_json_list(7, &skipped_json)?,
        recorded_at: row.get(8)?,
    })
}

fn parse_json_list(index: usize, raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
