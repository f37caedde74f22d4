//! Three-bucket diff between the repository and the database.
//!
//! The comparison itself is [`diff_lookups`], a pure function of two
//! lookups: the authoritative side and the target being reconciled. Pull
//! passes (repository, database); push passes (database, repository). In
//! every `{old, new}` pair `old` is the target's value and `new` the
//! authoritative one.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info_span;

use super::source::SourceReader;
use super::{merge_source, DiffEntry, DiffPlan, Direction, FieldDiff, Lookup, VariableState};
use crate::db::environment_repo::{self, EnvironmentRow};
use crate::db::user_repo::OwnerId;
use crate::db::{variable_repo, Database};
use crate::error::{EsvSyncError, Result};

/// Compares `authoritative` against `target`.
///
/// Names only in `authoritative` are full creates, names only in `target`
/// full deletes. For names on both sides each authoritative environment
/// value is a partial create (missing in target), an update (different) or
/// nothing (equal); target environments the authoritative side lacks are a
/// partial delete. When only description or expression type changed, the
/// update entry carries every authoritative value instead of just the
/// changed ones.
pub fn diff_lookups(authoritative: &Lookup, target: &Lookup) -> DiffPlan {
    let mut plan = DiffPlan::default();

    for (name, auth) in authoritative {
        let Some(tgt) = target.get(name) else {
            plan.create
                .push(DiffEntry::plain(name, auth, auth.values.clone()));
            continue;
        };

        let description = FieldDiff::compare(tgt.description.clone(), auth.description.clone());
        let expression_type =
            FieldDiff::compare(tgt.expression_type.clone(), auth.expression_type.clone());

        let mut changed: BTreeMap<String, FieldDiff<String>> = BTreeMap::new();
        let mut partial_create: BTreeMap<String, String> = BTreeMap::new();

        for (env, new) in &auth.values {
            match tgt.values.get(env) {
                None => {
                    partial_create.insert(env.clone(), new.clone());
                }
                Some(old) if old != new => {
                    changed.insert(
                        env.clone(),
                        FieldDiff::Changed {
                            old: old.clone(),
                            new: new.clone(),
                        },
                    );
                }
                Some(_) => {}
            }
        }

        if description.is_changed() || expression_type.is_changed() || !changed.is_empty() {
            let values = if changed.is_empty() {
                auth.values
                    .iter()
                    .map(|(env, v)| (env.clone(), FieldDiff::Value(v.clone())))
                    .collect()
            } else {
                changed
            };
            plan.update.push(DiffEntry {
                name: name.clone(),
                description,
                expression_type,
                values,
            });
        }

        if !partial_create.is_empty() {
            plan.create.push(DiffEntry::plain(name, auth, partial_create));
        }
    }

    for (name, tgt) in target {
        let missing: BTreeMap<String, String> = match authoritative.get(name) {
            None => tgt.values.clone(),
            Some(auth) => tgt
                .values
                .iter()
                .filter(|(env, _)| !auth.values.contains_key(*env))
                .map(|(env, v)| (env.clone(), v.clone()))
                .collect(),
        };

        let full_delete = !authoritative.contains_key(name);
        if full_delete || !missing.is_empty() {
            plan.delete.push(DiffEntry::plain(name, tgt, missing));
        }
    }

    plan
}

/// Gathers both sides for an owner and diffs them.
#[derive(Clone)]
pub struct DiffEngine {
    db: Database,
    source: Arc<dyn SourceReader>,
}

impl DiffEngine {
    pub fn new(db: Database, source: Arc<dyn SourceReader>) -> Self {
        Self { db, source }
    }

    /// The owner's environments, sorted by name. Fails with `NoEnvironments`
    /// when there are none.
    pub fn environments(&self, owner: OwnerId) -> Result<Vec<EnvironmentRow>> {
        let envs = environment_repo::list(&self.db, owner)?;
        if envs.is_empty() {
            return Err(EsvSyncError::NoEnvironments);
        }
        Ok(envs)
    }

    /// Reads every environment from the repository, in name order, and
    /// merges the results.
    pub fn source_lookup(&self, envs: &[EnvironmentRow]) -> Result<Lookup> {
        let mut reads = Vec::with_capacity(envs.len());
        for env in envs {
            reads.push((env.name.clone(), self.source.read(&env.name)?));
        }
        Ok(merge_source(reads))
    }

    /// Loads the owner's variables on an already locked connection.
    pub fn store_lookup_in(conn: &rusqlite::Connection, owner: OwnerId) -> Result<Lookup> {
        let stored = variable_repo::load_all(conn, owner)?;
        Ok(stored
            .into_iter()
            .map(|(name, var)| (name, VariableState::from(var)))
            .collect())
    }

    pub fn store_lookup(&self, owner: OwnerId) -> Result<Lookup> {
        self.db
            .with_conn(|conn| Self::store_lookup_in(conn, owner))
    }

    /// Orders the two lookups for `direction` and diffs them.
    pub fn plan(direction: Direction, source: &Lookup, store: &Lookup) -> DiffPlan {
        match direction {
            Direction::Pull => diff_lookups(source, store),
            Direction::Push => diff_lookups(store, source),
        }
    }

    /// Full diff for `owner` in `direction`.
    pub fn diff(&self, direction: Direction, owner: OwnerId) -> Result<DiffPlan> {
        let span = info_span!("esv_diff", %direction, owner);
        let _enter = span.enter();

        let envs = self.environments(owner)?;
        let source = self.source_lookup(&envs)?;
        let store = self.store_lookup(owner)?;
        let plan = Self::plan(direction, &source, &store);

        log::info!(
            "Diff ({}) for owner {}: {} create, {} update, {} delete",
            direction,
            owner,
            plan.create.len(),
            plan.update.len(),
            plan.delete.len()
        );
        Ok(plan)
    }
}
