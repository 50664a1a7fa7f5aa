//! JSON plan documents.
//!
//! ```json
//! {
//!   "name": "Blog",
//!   "steps": [
//!     { "to": "{posts}", "migration": { "name": "CreatePosts", "operations": [
//!         { "if_needed": true, "kind": "create_table", "table": { "name": "post", "columns": [
//!             { "name": "id", "type": "int32", "nullable": false, "primary_key": true, "identity": true }
//!         ] } }
//!     ] } }
//!   ]
//! }
//! ```

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::expression::{Expression, Guard};
use crate::migration::{Migration, MigrationContext};
use crate::plan::{MigrationPlan, INITIAL_STATE};
use crate::syntax::{syntax_for, Dialect};
use crate::MigrationError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanDocument {
    pub name: String,
    #[serde(default)]
    pub ignore_current_state: bool,
    pub steps: Vec<StepDocument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_migrations: Vec<MigrationDocument>,
}

/// One transition. `from` moves the build cursor first; a step without a
/// migration is a state rename.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationDocument {
    pub name: String,
    #[serde(default)]
    pub operations: Vec<OperationDocument>,
}

/// An expression plus how it is guarded: an explicit `guard`, the
/// expression's natural guard (`if_needed`), or none.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub if_needed: bool,
    #[serde(flatten)]
    pub expression: Expression,
}

impl OperationDocument {
    fn effective_guard(&self) -> Option<Guard> {
        match &self.guard {
            Some(guard) => Some(guard.clone()),
            None if self.if_needed => self.expression.natural_guard(),
            None => None,
        }
    }
}

impl Migration for MigrationDocument {
    fn name(&self) -> &str {
        &self.name
    }

    fn migrate(&self, context: &mut MigrationContext<'_>) -> Result<(), MigrationError> {
        for operation in &self.operations {
            match operation.effective_guard() {
                Some(guard) => {
                    context.apply_guarded(&guard, operation.expression.clone())?;
                }
                None => context.apply(operation.expression.clone())?,
            }
        }
        Ok(())
    }
}

impl PlanDocument {
    /// Parses and structurally validates a plan document.
    ///
    /// # Errors
    /// Returns [`MigrationError::Document`] for malformed JSON or an invalid
    /// operation.
    pub fn from_json(raw: &str) -> Result<Self, MigrationError> {
        let document: Self = serde_json::from_str(raw)
            .map_err(|err| MigrationError::Document(format!("invalid plan document: {err}")))?;
        document.validate()?;
        Ok(document)
    }

    /// # Errors
    /// Returns [`MigrationError::Document`] naming the first invalid operation.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.name.trim().is_empty() {
            return Err(MigrationError::Document(
                "plan name MUST be provided".to_string(),
            ));
        }
        let migrations = self
            .steps
            .iter()
            .filter_map(|step| step.migration.as_ref())
            .chain(self.post_migrations.iter());
        for migration in migrations {
            for (index, operation) in migration.operations.iter().enumerate() {
                operation.expression.validate().map_err(|err| {
                    MigrationError::Document(format!(
                        "migration {} operation {index}: {err}",
                        migration.name
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Builds and validates the [`MigrationPlan`] the document describes.
    ///
    /// # Errors
    /// Returns [`MigrationError::Plan`] for an invalid plan shape.
    pub fn into_plan(self) -> Result<MigrationPlan, MigrationError> {
        let mut plan = MigrationPlan::new(self.name);
        if self.ignore_current_state {
            plan.ignore_current_state();
        }
        for step in self.steps {
            if let Some(from) = step.from {
                plan.from(from);
            }
            match step.migration {
                Some(migration) => plan.to(step.to, migration)?,
                None => plan.to_noop(step.to)?,
            };
        }
        for migration in self.post_migrations {
            plan.add_post_migration(migration);
        }
        plan.validate()?;
        Ok(plan)
    }

    /// Renders the SQL for the path from `from` (the initial state when
    /// `None`) to `to` (the final state when `None`) without a database.
    /// Guarded operations are emitted with their guard as a comment.
    ///
    /// # Errors
    /// Returns plan errors, [`MigrationError::UnknownState`], and dialect
    /// rendering errors.
    pub fn script(
        &self,
        dialect: Dialect,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<String, MigrationError> {
        let plan = self.clone().into_plan()?;
        let path = plan.follow_path(from.unwrap_or(INITIAL_STATE), to)?;
        let syntax = syntax_for(dialect);

        let mut script = String::new();
        let _ = writeln!(
            script,
            "-- plan {} ({})",
            self.name,
            dialect.as_str()
        );
        for transition in path {
            let _ = writeln!(
                script,
                "\n-- {} -> {}: {}",
                display_state(transition.source()),
                transition.target(),
                transition.migration_name()
            );
            let Some(migration) = self.migration_for(transition.source(), transition.target())
            else {
                continue;
            };
            for operation in &migration.operations {
                if let Some(guard) = operation.effective_guard() {
                    let _ = writeln!(script, "-- when {}", guard.describe());
                }
                for statement in syntax.render(&operation.expression)? {
                    let _ = writeln!(script, "{statement};");
                }
            }
        }
        Ok(script)
    }

    fn migration_for(&self, source: &str, target: &str) -> Option<&MigrationDocument> {
        let mut cursor = INITIAL_STATE;
        for step in &self.steps {
            if let Some(from) = &step.from {
                cursor = from.as_str();
            }
            if cursor == source && step.to == target {
                return step.migration.as_ref();
            }
            cursor = step.to.as_str();
        }
        None
    }
}

fn display_state(state: &str) -> &str {
    if state.is_empty() {
        "(initial)"
    } else {
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upgrader::testing::MemoryProvider;
    use crate::upgrader::Upgrader;

    const BLOG: &str = r#"{
        "name": "Blog",
        "steps": [
            {
                "to": "{posts}",
                "migration": {
                    "name": "CreatePosts",
                    "operations": [
                        {
                            "if_needed": true,
                            "kind": "create_table",
                            "table": {
                                "name": "post",
                                "columns": [
                                    {"name": "id", "type": "int32", "nullable": false,
                                     "primary_key": true, "identity": true},
                                    {"name": "title", "type": "string(200)", "nullable": false}
                                ]
                            }
                        }
                    ]
                }
            },
            {
                "to": "{slug}",
                "migration": {
                    "name": "AddSlug",
                    "operations": [
                        {
                            "guard": {"when": "column_missing", "table": "post", "column": "slug"},
                            "kind": "create_column",
                            "table": "post",
                            "column": {"name": "slug", "type": "string(200)"}
                        },
                        {
                            "kind": "update_data",
                            "table": "post",
                            "set": {"slug": ""},
                            "filter": "all_rows"
                        }
                    ]
                }
            },
            { "to": "1.0.0" }
        ]
    }"#;

    fn must<T>(result: Result<T, MigrationError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn document_builds_a_valid_plan() {
        let document = must(PlanDocument::from_json(BLOG));
        assert_eq!(document.steps.len(), 3);
        assert!(document.steps[0].migration.as_ref().is_some_and(|item| item.operations[0].if_needed));

        let plan = must(document.into_plan());
        assert_eq!(must(plan.validate()), "1.0.0");
        let names = plan
            .transitions()
            .iter()
            .map(|item| item.migration_name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, ["CreatePosts", "AddSlug", "noop"]);
    }

    #[test]
    fn guarded_operations_skip_when_column_exists() {
        let plan = must(must(PlanDocument::from_json(BLOG)).into_plan());
        let upgrader = Upgrader::new(plan);
        let mut provider = MemoryProvider::default();
        provider.committed = provider
            .committed
            .clone()
            .with_table("post", &["id", "title", "slug"]);

        let report = must(upgrader.execute(&mut provider));
        assert!(report.successful);
        let first = &report.completed_transitions[0];
        assert!(first.statements.is_empty());
        assert_eq!(first.skipped.len(), 1);
        let second = &report.completed_transitions[1];
        assert_eq!(second.skipped.len(), 1);
        assert_eq!(
            second.statements,
            ["UPDATE \"post\" SET \"slug\" = ''"]
        );
    }

    #[test]
    fn script_renders_sql_server_path_with_guard_comments() {
        let document = must(PlanDocument::from_json(BLOG));
        let script = must(document.script(Dialect::SqlServer, Some("{posts}"), None));

        assert!(script.starts_with("-- plan Blog (sqlserver)\n"));
        assert!(script.contains("-- {posts} -> {slug}: AddSlug\n"));
        assert!(script.contains("-- when column post.slug is missing\n"));
        assert!(script.contains("ALTER TABLE [post] ADD [slug] NVARCHAR(200) NULL;\n"));
        assert!(script.contains("-- {slug} -> 1.0.0: noop\n"));
        assert!(!script.contains("CREATE TABLE"));
    }

    #[test]
    fn script_from_initial_state_includes_create_table() {
        let document = must(PlanDocument::from_json(BLOG));
        let script = must(document.script(Dialect::Sqlite, None, Some("{posts}")));
        assert!(script.contains("-- (initial) -> {posts}: CreatePosts\n"));
        assert!(script.contains("-- when table post is missing\n"));
        assert!(script.contains("CREATE TABLE \"post\""));
        assert!(!script.contains("AddSlug"));
    }

    #[test]
    fn invalid_documents_are_rejected_with_context() {
        let raw = r#"{"name": "Bad", "steps": [{"to": "{a}", "migration": {"name": "Wipe",
            "operations": [{"kind": "delete_data", "table": "post", "filter": {"where": {}}}]}}]}"#;
        let err = match PlanDocument::from_json(raw) {
            Ok(value) => panic!("empty filter should be rejected: {value:?}"),
            Err(err) => err,
        };
        assert!(matches!(err, MigrationError::Document(_)));
        assert!(err.to_string().contains("migration Wipe operation 0"));

        let raw = r#"{"name": "Bad", "steps": [{"to": "{a}", "migration": {"name": "X",
            "operations": [{"kind": "drop_everything"}]}}]}"#;
        assert!(matches!(
            PlanDocument::from_json(raw),
            Err(MigrationError::Document(_))
        ));
    }

    #[test]
    fn duplicate_sources_fail_when_building_the_plan() {
        let raw = r#"{"name": "Fork", "steps": [
            {"to": "{a}"},
            {"from": "", "to": "{b}"}
        ]}"#;
        let document = must(PlanDocument::from_json(raw));
        assert!(matches!(document.into_plan(), Err(MigrationError::Plan(_))));
    }
}
