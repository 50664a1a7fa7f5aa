use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::migration::{Migration, NoopMigration};
use crate::MigrationError;

/// State of a database no plan has touched yet.
pub const INITIAL_STATE: &str = "";

/// One edge of a plan: running `migration` moves the database from `source` to `target`.
#[derive(Clone)]
pub struct Transition {
    source: String,
    target: String,
    migration: Arc<dyn Migration>,
}

impl Transition {
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[must_use]
    pub fn migration(&self) -> &Arc<dyn Migration> {
        &self.migration
    }

    #[must_use]
    pub fn migration_name(&self) -> &str {
        self.migration.name()
    }
}

impl Debug for Transition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("migration", &self.migration.name())
            .finish()
    }
}

/// A chain of named states joined by migrations.
///
/// Plans are built with a cursor: [`MigrationPlan::from`] moves it, and every
/// [`MigrationPlan::to`] adds a transition from the cursor and advances it to
/// the new target. Each state may be the source of at most one transition, so
/// the path from any known state to the final state is unique.
pub struct MigrationPlan {
    name: String,
    transitions: Vec<Transition>,
    by_source: BTreeMap<String, usize>,
    states: Vec<String>,
    cursor: String,
    post_migrations: Vec<Arc<dyn Migration>>,
    ignore_current_state: bool,
}

#[allow(clippy::wrong_self_convention)]
impl MigrationPlan {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transitions: Vec::new(),
            by_source: BTreeMap::new(),
            states: Vec::new(),
            cursor: INITIAL_STATE.to_string(),
            post_migrations: Vec::new(),
            ignore_current_state: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Moves the build cursor to `state`.
    pub fn from(&mut self, state: impl Into<String>) -> &mut Self {
        self.cursor = state.into();
        self
    }

    /// Adds a transition from the cursor to `target`.
    ///
    /// # Errors
    /// Returns [`MigrationError::Plan`] for an empty target, a target equal to
    /// the cursor, or a cursor state that already has an outgoing transition.
    pub fn to(
        &mut self,
        target: impl Into<String>,
        migration: impl Migration + 'static,
    ) -> Result<&mut Self, MigrationError> {
        self.to_shared(target, Arc::new(migration))
    }

    /// Same as [`MigrationPlan::to`] for an already shared migration.
    ///
    /// # Errors
    /// See [`MigrationPlan::to`].
    pub fn to_shared(
        &mut self,
        target: impl Into<String>,
        migration: Arc<dyn Migration>,
    ) -> Result<&mut Self, MigrationError> {
        let target = target.into();
        let source = self.cursor.clone();
        self.add_transition(source, target.clone(), migration)?;
        self.cursor = target;
        Ok(self)
    }

    /// Adds a transition that changes nothing but the state name.
    ///
    /// # Errors
    /// See [`MigrationPlan::to`].
    pub fn to_noop(&mut self, target: impl Into<String>) -> Result<&mut Self, MigrationError> {
        self.to(target, NoopMigration)
    }

    /// Adds the normal transition to `target` plus an alternate one from
    /// `recover_state`, for databases that took a since-replaced path.
    ///
    /// # Errors
    /// See [`MigrationPlan::to`].
    pub fn to_with_replace(
        &mut self,
        target: impl Into<String>,
        recover_state: impl Into<String>,
        recover_migration: impl Migration + 'static,
        migration: impl Migration + 'static,
    ) -> Result<&mut Self, MigrationError> {
        let target = target.into();
        self.to(target.clone(), migration)?;
        self.from(recover_state).to(target.clone(), recover_migration)?;
        self.cursor = target;
        Ok(self)
    }

    /// Replays the transitions between `start` and `end` from the cursor,
    /// ending at `target`. Intermediate states are named `{target}~{n}`.
    ///
    /// # Errors
    /// Returns [`MigrationError::Plan`] when `start` equals `end`, when the
    /// path between them is missing or loops, or when adding a cloned
    /// transition fails.
    pub fn to_with_clone(
        &mut self,
        start: &str,
        end: &str,
        target: impl Into<String>,
    ) -> Result<&mut Self, MigrationError> {
        let target = target.into();
        if start == end {
            return Err(MigrationError::plan(format!(
                "cannot clone an empty path: start and end are both \"{start}\""
            )));
        }

        let mut migrations = Vec::new();
        let mut visited = BTreeSet::new();
        let mut state = start.to_string();
        while state != end {
            if !visited.insert(state.clone()) {
                return Err(MigrationError::plan(format!(
                    "loop detected while cloning from \"{start}\" at \"{state}\""
                )));
            }
            let Some(transition) = self.transition_from(&state) else {
                return Err(MigrationError::plan(format!(
                    "cannot clone from \"{start}\" to \"{end}\": no transition from \"{state}\""
                )));
            };
            migrations.push(Arc::clone(&transition.migration));
            state = transition.target.clone();
        }

        let count = migrations.len();
        for (index, migration) in migrations.into_iter().enumerate() {
            let next = if index + 1 == count {
                target.clone()
            } else {
                format!("{target}~{}", index + 1)
            };
            self.to_shared(next, migration)?;
        }
        Ok(self)
    }

    /// Registers a migration to run once after every upgrade that executed at
    /// least one transition. Names are deduplicated.
    pub fn add_post_migration(&mut self, migration: impl Migration + 'static) -> &mut Self {
        if !self
            .post_migrations
            .iter()
            .any(|existing| existing.name() == migration.name())
        {
            self.post_migrations.push(Arc::new(migration));
        }
        self
    }

    /// Always execute from the initial state, whatever the stored state says.
    pub fn ignore_current_state(&mut self) -> &mut Self {
        self.ignore_current_state = true;
        self
    }

    #[must_use]
    pub fn ignores_current_state(&self) -> bool {
        self.ignore_current_state
    }

    #[must_use]
    pub fn post_migrations(&self) -> &[Arc<dyn Migration>] {
        &self.post_migrations
    }

    #[must_use]
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Every state mentioned by the plan, in declaration order.
    #[must_use]
    pub fn states(&self) -> &[String] {
        &self.states
    }

    #[must_use]
    pub fn known_state(&self, state: &str) -> bool {
        self.states.iter().any(|item| item == state)
    }

    #[must_use]
    pub fn transition_from(&self, state: &str) -> Option<&Transition> {
        self.by_source
            .get(state)
            .and_then(|index| self.transitions.get(*index))
    }

    /// Checks the plan shape and returns its final state.
    ///
    /// # Errors
    /// Returns [`MigrationError::Plan`] when the plan is empty, has zero or
    /// several final states, or contains a loop.
    pub fn validate(&self) -> Result<String, MigrationError> {
        if self.transitions.is_empty() {
            return Err(MigrationError::plan(format!(
                "plan {} has no transitions",
                self.name
            )));
        }

        let mut finals = Vec::new();
        for transition in &self.transitions {
            if !self.by_source.contains_key(&transition.target) && !finals.contains(&&transition.target)
            {
                finals.push(&transition.target);
            }
        }

        let mut verified = BTreeSet::new();
        for transition in &self.transitions {
            let mut visited = BTreeSet::new();
            let mut current = Some(transition);
            while let Some(step) = current {
                if verified.contains(step.source.as_str()) {
                    break;
                }
                if !visited.insert(step.source.as_str()) {
                    return Err(MigrationError::plan(format!(
                        "plan {} contains a loop through state \"{}\"",
                        self.name, step.source
                    )));
                }
                current = self.transition_from(&step.target);
            }
            verified.extend(visited);
        }

        match finals.as_slice() {
            [single] => Ok((*single).clone()),
            [] => Err(MigrationError::plan(format!(
                "plan {} has no final state",
                self.name
            ))),
            many => Err(MigrationError::plan(format!(
                "plan {} has multiple final states: {}",
                self.name,
                many.iter()
                    .map(|state| format!("\"{state}\""))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Transitions leading from `from` to `to` (the final state when `None`).
    ///
    /// # Errors
    /// Returns [`MigrationError::UnknownState`] when `from` is not part of the
    /// plan and [`MigrationError::Plan`] when `to` is not reachable from it.
    pub fn follow_path(
        &self,
        from: &str,
        to: Option<&str>,
    ) -> Result<Vec<&Transition>, MigrationError> {
        if !self.known_state(from) {
            return Err(MigrationError::UnknownState(from.to_string()));
        }

        let mut path = Vec::new();
        let mut visited = BTreeSet::new();
        let mut state = from;
        loop {
            if to == Some(state) {
                return Ok(path);
            }
            if !visited.insert(state) {
                return Err(MigrationError::plan(format!(
                    "plan {} loops at state \"{state}\"",
                    self.name
                )));
            }
            match self.transition_from(state) {
                Some(transition) => {
                    path.push(transition);
                    state = &transition.target;
                }
                None => break,
            }
        }

        match to {
            None => Ok(path),
            Some(to) => Err(MigrationError::plan(format!(
                "state \"{to}\" is not reachable from \"{from}\" in plan {}",
                self.name
            ))),
        }
    }

    fn add_transition(
        &mut self,
        source: String,
        target: String,
        migration: Arc<dyn Migration>,
    ) -> Result<(), MigrationError> {
        if target.trim().is_empty() {
            return Err(MigrationError::plan(format!(
                "plan {}: target state MUST not be empty",
                self.name
            )));
        }
        if source == target {
            return Err(MigrationError::plan(format!(
                "plan {}: source and target state are both \"{source}\"",
                self.name
            )));
        }
        if let Some(existing) = self.transition_from(&source) {
            return Err(MigrationError::plan(format!(
                "plan {}: a transition from state \"{source}\" to \"{}\" is already defined",
                self.name, existing.target
            )));
        }

        self.remember_state(&source);
        self.remember_state(&target);
        self.by_source.insert(source.clone(), self.transitions.len());
        self.transitions.push(Transition {
            source,
            target,
            migration,
        });
        Ok(())
    }

    fn remember_state(&mut self, state: &str) {
        if !self.known_state(state) {
            self.states.push(state.to_string());
        }
    }
}

impl Debug for MigrationPlan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationPlan")
            .field("name", &self.name)
            .field("transitions", &self.transitions)
            .field("ignore_current_state", &self.ignore_current_state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::migration_fn;
    use proptest::prelude::*;

    fn must<T>(result: Result<T, MigrationError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn named(name: &'static str) -> impl Migration {
        migration_fn(name, |_| Ok(()))
    }

    fn chain_plan() -> MigrationPlan {
        let mut plan = MigrationPlan::new("Cms.Core");
        must(plan.to("{A}", named("CreateNode")));
        must(plan.to("{B}", named("AddPath")));
        must(plan.to("{C}", named("AddLevel")));
        plan
    }

    fn names(path: &[&Transition]) -> Vec<String> {
        path.iter()
            .map(|item| item.migration_name().to_string())
            .collect()
    }

    #[test]
    fn chain_validates_to_last_state_and_lists_states_in_order() {
        let plan = chain_plan();
        assert_eq!(must(plan.validate()), "{C}");
        assert_eq!(plan.states(), ["", "{A}", "{B}", "{C}"]);
        assert!(plan.known_state(INITIAL_STATE));
        assert!(!plan.known_state("{Z}"));
    }

    #[test]
    fn build_errors_are_reported_immediately() {
        let mut plan = chain_plan();
        assert!(plan.from("{A}").to("{A}", named("Same")).is_err());
        assert!(plan.from("{A}").to("{X}", named("Second")).is_err());
        assert!(plan.from("{C}").to("  ", named("Blank")).is_err());
        assert_eq!(plan.transitions().len(), 3);
    }

    #[test]
    fn validate_rejects_empty_plans_and_multiple_finals() {
        assert!(MigrationPlan::new("empty").validate().is_err());

        let mut plan = chain_plan();
        must(plan.from("{X}").to("{Y}", named("Orphan")));
        let err = match plan.validate() {
            Ok(value) => panic!("expected two finals, got {value}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("multiple final states"));
    }

    #[test]
    fn validate_detects_loops() {
        let mut plan = MigrationPlan::new("loop");
        must(plan.to("{A}", named("One")));
        must(plan.to("{B}", named("Two")));
        must(plan.to("{A}", named("Back")));
        let err = match plan.validate() {
            Ok(value) => panic!("loop should be rejected, got {value}"),
            Err(err) => err,
        };
        assert!(matches!(err, MigrationError::Plan(_)));
    }

    #[test]
    fn follow_path_honours_bounds() {
        let plan = chain_plan();
        assert_eq!(
            names(&must(plan.follow_path("", None))),
            ["CreateNode", "AddPath", "AddLevel"]
        );
        assert_eq!(names(&must(plan.follow_path("{A}", Some("{B}")))), ["AddPath"]);
        assert!(must(plan.follow_path("{C}", None)).is_empty());
        assert_eq!(
            plan.follow_path("{nope}", None).err(),
            Some(MigrationError::UnknownState("{nope}".to_string()))
        );
        assert!(matches!(
            plan.follow_path("{B}", Some("{A}")),
            Err(MigrationError::Plan(_))
        ));
    }

    #[test]
    fn replace_adds_recovery_path_to_the_same_target() {
        let mut plan = MigrationPlan::new("replace");
        must(plan.to("{A}", named("One")));
        must(plan.to_with_replace("{B}", "{OLD}", named("Recover"), named("Two")));
        must(plan.to("{C}", named("Three")));

        assert_eq!(must(plan.validate()), "{C}");
        assert_eq!(
            names(&must(plan.follow_path("{OLD}", None))),
            ["Recover", "Three"]
        );
        assert_eq!(
            names(&must(plan.follow_path("", None))),
            ["One", "Two", "Three"]
        );
    }

    #[test]
    fn clone_replays_a_segment_with_derived_state_names() {
        let mut plan = chain_plan();
        must(plan.from("{C}").to_with_clone("{A}", "{C}", "{D}"));

        assert_eq!(plan.states(), ["", "{A}", "{B}", "{C}", "{D}~1", "{D}"]);
        assert_eq!(must(plan.validate()), "{D}");
        assert_eq!(
            names(&must(plan.follow_path("{C}", None))),
            ["AddPath", "AddLevel"]
        );
    }

    #[test]
    fn clone_rejects_missing_paths() {
        let mut plan = chain_plan();
        assert!(plan.to_with_clone("{A}", "{A}", "{D}").is_err());
        assert!(plan.to_with_clone("{C}", "{A}", "{D}").is_err());
    }

    #[test]
    fn post_migrations_are_unique_by_name() {
        let mut plan = chain_plan();
        plan.add_post_migration(named("RebuildCache"))
            .add_post_migration(named("RebuildCache"))
            .ignore_current_state();
        assert_eq!(plan.post_migrations().len(), 1);
        assert!(plan.ignores_current_state());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_linear_chain_has_unique_final_and_full_path(length in 1usize..40) {
            let mut plan = MigrationPlan::new("prop");
            for index in 0..length {
                must(plan.to(format!("{{S{index}}}"), NoopMigration));
            }

            let final_state = must(plan.validate());
            prop_assert_eq!(final_state, format!("{{S{}}}", length - 1));
            prop_assert_eq!(must(plan.follow_path(INITIAL_STATE, None)).len(), length);
            prop_assert_eq!(plan.states().len(), length + 1);

            for index in 0..length {
                let from = format!("{{S{index}}}");
                let remaining = must(plan.follow_path(&from, None)).len();
                prop_assert_eq!(remaining, length - index - 1);
            }
        }
    }
}
