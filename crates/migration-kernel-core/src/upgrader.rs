use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::migration::{Database, KeyValueStore, Migration, MigrationContext};
use crate::plan::{MigrationPlan, Transition, INITIAL_STATE};
use crate::MigrationError;

/// Key-value prefix under which each plan's current state is stored.
pub const STATE_KEY_PREFIX: &str = "Migrations.Upgrader.State+";

/// Key-value prefix for the JSON list of post-migrations that still have to
/// run for a plan. Written with every transition and cleared when the
/// post-migration scope commits.
pub const POST_MIGRATIONS_KEY_PREFIX: &str = "Migrations.Upgrader.PostMigrations+";

/// A unit of work over the database. Dropping a scope without calling
/// [`MigrationScope::complete`] rolls back everything done through it.
pub trait MigrationScope: Database + KeyValueStore {
    /// Appends an entry to the migration history.
    ///
    /// # Errors
    /// Returns [`MigrationError::Database`] when the write fails.
    fn record_transition(&self, record: &TransitionRecord) -> Result<(), MigrationError>;

    /// Commits the scope.
    ///
    /// # Errors
    /// Returns [`MigrationError::Database`] when the commit fails.
    fn complete(self) -> Result<(), MigrationError>
    where
        Self: Sized;
}

/// Hands out scopes, one at a time.
pub trait ScopeProvider {
    type Scope<'s>: MigrationScope
    where
        Self: 's;

    /// # Errors
    /// Returns [`MigrationError::Database`] when a scope cannot be started.
    fn begin(&mut self) -> Result<Self::Scope<'_>, MigrationError>;
}

/// What gets persisted for every completed transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionRecord {
    pub plan: String,
    pub source: String,
    pub target: String,
    pub migration: String,
    pub statements: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedTransition {
    pub source: String,
    pub target: String,
    pub migration: String,
    pub statements: Vec<String>,
    pub skipped: Vec<String>,
}

impl From<TransitionRecord> for CompletedTransition {
    fn from(record: TransitionRecord) -> Self {
        Self {
            source: record.source,
            target: record.target,
            migration: record.migration,
            statements: record.statements,
            skipped: record.skipped,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingTransition {
    pub source: String,
    pub target: String,
    pub migration: String,
}

impl From<&Transition> for PendingTransition {
    fn from(transition: &Transition) -> Self {
        Self {
            source: transition.source().to_string(),
            target: transition.target().to_string(),
            migration: transition.migration_name().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpgradeStatus {
    pub plan: String,
    pub current_state: String,
    pub final_state: String,
    pub requires_upgrade: bool,
    pub pending: Vec<PendingTransition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_post_migrations: Vec<String>,
}

/// Outcome of [`Upgrader::execute`].
///
/// `final_state` is the state the database actually reached; on failure it is
/// the target of the last completed transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutedMigrationPlan {
    pub plan: String,
    pub initial_state: String,
    pub final_state: String,
    pub completed_transitions: Vec<CompletedTransition>,
    pub post_migrations: Vec<String>,
    pub successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Walks a [`MigrationPlan`] from the stored state to the plan's final state.
pub struct Upgrader {
    plan: MigrationPlan,
}

impl Upgrader {
    #[must_use]
    pub fn new(plan: MigrationPlan) -> Self {
        Self { plan }
    }

    #[must_use]
    pub fn plan(&self) -> &MigrationPlan {
        &self.plan
    }

    #[must_use]
    pub fn state_value_key(&self) -> String {
        format!("{STATE_KEY_PREFIX}{}", self.plan.name())
    }

    #[must_use]
    pub fn post_migrations_value_key(&self) -> String {
        format!("{POST_MIGRATIONS_KEY_PREFIX}{}", self.plan.name())
    }

    /// Reports where the database stands relative to the plan without changing it.
    ///
    /// # Errors
    /// Returns plan validation errors, [`MigrationError::UnknownState`] for a
    /// stored state the plan does not know, and scope errors.
    pub fn status<P: ScopeProvider>(&self, provider: &mut P) -> Result<UpgradeStatus, MigrationError> {
        let final_state = self.plan.validate()?;
        let current_state = self.current_state(provider)?;
        let pending_post_migrations = self.pending_post_migrations(provider)?;
        let pending = self
            .plan
            .follow_path(&current_state, None)?
            .into_iter()
            .map(PendingTransition::from)
            .collect::<Vec<_>>();

        Ok(UpgradeStatus {
            plan: self.plan.name().to_string(),
            current_state,
            final_state,
            requires_upgrade: !pending.is_empty() || !pending_post_migrations.is_empty(),
            pending,
            pending_post_migrations,
        })
    }

    /// Runs every pending transition, each in its own scope, then the
    /// post-migrations in one final scope.
    ///
    /// A failing migration does not produce an `Err`: its scope is rolled
    /// back, execution stops, and the report carries `successful = false`.
    /// Post-migrations left over by an earlier run that failed in its
    /// post-migration scope are retried even when no transition is pending.
    ///
    /// # Errors
    /// Returns plan validation errors, [`MigrationError::UnknownState`], and
    /// failures to read the stored state.
    pub fn execute<P: ScopeProvider>(
        &self,
        provider: &mut P,
    ) -> Result<ExecutedMigrationPlan, MigrationError> {
        let final_state = self.plan.validate()?;
        let initial_state = self.current_state(provider)?;
        let carried = self.pending_post_migrations(provider)?;
        let path = self.plan.follow_path(&initial_state, None)?;

        let mut report = ExecutedMigrationPlan {
            plan: self.plan.name().to_string(),
            initial_state: initial_state.clone(),
            final_state: initial_state.clone(),
            completed_transitions: Vec::new(),
            post_migrations: Vec::new(),
            successful: true,
            error: None,
        };

        if path.is_empty() {
            if carried.is_empty() {
                debug!(
                    plan = self.plan.name(),
                    state = %initial_state,
                    "plan already at final state"
                );
                return Ok(report);
            }
            let retry = self.resolve_carried(&carried, &[]);
            info!(
                plan = self.plan.name(),
                pending = retry.len(),
                "retrying post-migrations from an earlier run"
            );
            self.finish_post_migrations(provider, &retry, &mut report);
            return Ok(report);
        }

        info!(
            plan = self.plan.name(),
            from = %initial_state,
            to = %final_state,
            pending = path.len(),
            "upgrading"
        );

        let mut post_migrations = self.plan.post_migrations().to_vec();
        for transition in path {
            match self.run_transition(provider, transition, &mut post_migrations) {
                Ok(record) => {
                    info!(
                        plan = self.plan.name(),
                        migration = %record.migration,
                        from = %record.source,
                        to = %record.target,
                        statements = record.statements.len(),
                        skipped = record.skipped.len(),
                        "transition completed"
                    );
                    report.final_state.clone_from(&record.target);
                    report.completed_transitions.push(record.into());
                }
                Err(err) => {
                    warn!(
                        plan = self.plan.name(),
                        migration = transition.migration_name(),
                        from = transition.source(),
                        to = transition.target(),
                        error = %err,
                        "transition failed; scope rolled back"
                    );
                    report.successful = false;
                    report.error = Some(err.to_string());
                    return Ok(report);
                }
            }
        }

        let leftover = self.resolve_carried(&carried, &post_migrations);
        post_migrations.extend(leftover);
        if !post_migrations.is_empty() || !carried.is_empty() {
            self.finish_post_migrations(provider, &post_migrations, &mut report);
        }

        Ok(report)
    }

    fn finish_post_migrations<P: ScopeProvider>(
        &self,
        provider: &mut P,
        migrations: &[Arc<dyn Migration>],
        report: &mut ExecutedMigrationPlan,
    ) {
        match self.run_post_migrations(provider, migrations) {
            Ok(names) => report.post_migrations = names,
            Err(err) => {
                warn!(
                    plan = self.plan.name(),
                    error = %err,
                    "post-migrations failed; scope rolled back, kept pending"
                );
                report.successful = false;
                report.error = Some(err.to_string());
            }
        }
    }

    fn pending_post_migrations<P: ScopeProvider>(
        &self,
        provider: &mut P,
    ) -> Result<Vec<String>, MigrationError> {
        let scope = provider.begin()?;
        let stored = scope.get_value(&self.post_migrations_value_key())?;
        drop(scope);
        match stored {
            Some(raw) => serde_json::from_str(&raw).map_err(|err| {
                MigrationError::Database(format!(
                    "invalid pending post-migrations for plan {}: {err}",
                    self.plan.name()
                ))
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Post-migrations registered on the plan whose names are still pending
    /// and not already in `scheduled`. Names registered by a migration context
    /// cannot be rebuilt without rerunning that migration and are dropped with
    /// a warning.
    fn resolve_carried(
        &self,
        carried: &[String],
        scheduled: &[Arc<dyn Migration>],
    ) -> Vec<Arc<dyn Migration>> {
        let registered = self.plan.post_migrations();
        let mut resolved = Vec::with_capacity(carried.len());
        for name in carried {
            if scheduled.iter().any(|migration| migration.name() == name) {
                continue;
            }
            match registered.iter().find(|migration| migration.name() == name) {
                Some(migration) => resolved.push(Arc::clone(migration)),
                None => warn!(
                    plan = self.plan.name(),
                    migration = %name,
                    "pending post-migration is not registered on the plan; dropped"
                ),
            }
        }
        resolved
    }

    fn current_state<P: ScopeProvider>(&self, provider: &mut P) -> Result<String, MigrationError> {
        if self.plan.ignores_current_state() {
            return Ok(INITIAL_STATE.to_string());
        }
        let scope = provider.begin()?;
        let stored = scope.get_value(&self.state_value_key())?;
        drop(scope);
        let state = stored.unwrap_or_else(|| INITIAL_STATE.to_string());
        if !self.plan.known_state(&state) {
            return Err(MigrationError::UnknownState(state));
        }
        Ok(state)
    }

    fn run_transition<P: ScopeProvider>(
        &self,
        provider: &mut P,
        transition: &Transition,
        post_migrations: &mut Vec<Arc<dyn Migration>>,
    ) -> Result<TransitionRecord, MigrationError> {
        let scope = provider.begin()?;
        let mut context =
            MigrationContext::new(&scope, self.plan.name(), transition.migration_name());
        transition
            .migration()
            .migrate(&mut context)
            .map_err(|err| attribute(transition.migration_name(), err))?;
        let (statements, skipped, collected) = context.into_parts();
        for migration in collected {
            if !post_migrations
                .iter()
                .any(|existing| existing.name() == migration.name())
            {
                post_migrations.push(migration);
            }
        }

        scope.set_value(&self.state_value_key(), transition.target())?;
        if !post_migrations.is_empty() {
            scope.set_value(
                &self.post_migrations_value_key(),
                &encode_names(post_migrations)?,
            )?;
        }
        let record = TransitionRecord {
            plan: self.plan.name().to_string(),
            source: transition.source().to_string(),
            target: transition.target().to_string(),
            migration: transition.migration_name().to_string(),
            statements,
            skipped,
        };
        scope.record_transition(&record)?;
        scope.complete()?;
        Ok(record)
    }

    fn run_post_migrations<P: ScopeProvider>(
        &self,
        provider: &mut P,
        migrations: &[Arc<dyn Migration>],
    ) -> Result<Vec<String>, MigrationError> {
        let scope = provider.begin()?;
        let mut names = Vec::with_capacity(migrations.len());
        for migration in migrations {
            let mut context = MigrationContext::new(&scope, self.plan.name(), migration.name());
            migration
                .migrate(&mut context)
                .map_err(|err| attribute(migration.name(), err))?;
            debug!(
                plan = self.plan.name(),
                migration = migration.name(),
                "post-migration completed"
            );
            names.push(migration.name().to_string());
        }
        scope.set_value(&self.post_migrations_value_key(), "[]")?;
        scope.complete()?;
        Ok(names)
    }
}

fn encode_names(migrations: &[Arc<dyn Migration>]) -> Result<String, MigrationError> {
    let names = migrations
        .iter()
        .map(|migration| migration.name())
        .collect::<Vec<_>>();
    serde_json::to_string(&names).map_err(|err| {
        MigrationError::Database(format!("failed to encode pending post-migrations: {err}"))
    })
}

fn attribute(migration: &str, err: MigrationError) -> MigrationError {
    match err {
        MigrationError::Migration { .. } => err,
        other => MigrationError::Migration {
            migration: migration.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;

    use super::{MigrationScope, ScopeProvider, TransitionRecord};
    use crate::migration::testing::RecordingDatabase;
    use crate::migration::{Database, KeyValueStore, Row};
    use crate::syntax::SqlSyntax;
    use crate::MigrationError;

    /// Provider whose scopes work on a copy of the committed state and write
    /// it back only on completion.
    #[derive(Default)]
    pub(crate) struct MemoryProvider {
        pub committed: RecordingDatabase,
        pub history: Vec<TransitionRecord>,
        pub scopes_begun: usize,
    }

    pub(crate) struct MemoryScope<'s> {
        provider: &'s mut MemoryProvider,
        working: RecordingDatabase,
        records: RefCell<Vec<TransitionRecord>>,
    }

    impl ScopeProvider for MemoryProvider {
        type Scope<'s> = MemoryScope<'s>;

        fn begin(&mut self) -> Result<Self::Scope<'_>, MigrationError> {
            self.scopes_begun += 1;
            let working = self.committed.clone();
            Ok(MemoryScope {
                provider: self,
                working,
                records: RefCell::new(Vec::new()),
            })
        }
    }

    impl Database for MemoryScope<'_> {
        fn syntax(&self) -> &dyn SqlSyntax {
            self.working.syntax()
        }

        fn execute(&self, sql: &str) -> Result<usize, MigrationError> {
            self.working.execute(sql)
        }

        fn query(&self, sql: &str) -> Result<Vec<Row>, MigrationError> {
            self.working.query(sql)
        }

        fn table_exists(&self, table: &str) -> Result<bool, MigrationError> {
            self.working.table_exists(table)
        }

        fn column_names(&self, table: &str) -> Result<Vec<String>, MigrationError> {
            self.working.column_names(table)
        }

        fn index_names(&self, table: &str) -> Result<Vec<String>, MigrationError> {
            self.working.index_names(table)
        }
    }

    impl KeyValueStore for MemoryScope<'_> {
        fn get_value(&self, key: &str) -> Result<Option<String>, MigrationError> {
            self.working.get_value(key)
        }

        fn set_value(&self, key: &str, value: &str) -> Result<(), MigrationError> {
            self.working.set_value(key, value)
        }
    }

    impl MigrationScope for MemoryScope<'_> {
        fn record_transition(&self, record: &TransitionRecord) -> Result<(), MigrationError> {
            self.records.borrow_mut().push(record.clone());
            Ok(())
        }

        fn complete(self) -> Result<(), MigrationError> {
            let Self {
                provider,
                working,
                records,
            } = self;
            provider.committed = working;
            provider.history.extend(records.into_inner());
            Ok(())
        }
    }
}
