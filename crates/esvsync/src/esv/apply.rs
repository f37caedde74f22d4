//! Applying diffs: pull into the database, push to the platform.

use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info_span;

use super::diff::{diff_lookups, DiffEngine};
use super::source::SourceReader;
use super::{DiffEntry, DiffPlan, Direction};
use crate::db::environment_repo::{self, EnvironmentRow};
use crate::db::user_repo::OwnerId;
use crate::db::{variable_repo, Database};
use crate::error::{EsvSyncError, Result};
use crate::sanitize::redact_url;

/// One variable to import into a platform environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub name: String,
    pub description: Option<String>,
    pub expression_type: String,
    pub value: String,
}

impl ImportRequest {
    fn from_entry(entry: &DiffEntry, env: &str) -> Option<Self> {
        Some(Self {
            name: entry.name.clone(),
            description: entry.description.current().clone(),
            expression_type: entry.expression_type.current().clone(),
            value: entry.value_for(env)?.to_string(),
        })
    }
}

/// Writes variables to a remote platform environment.
pub trait VariableWriter: Send + Sync {
    fn import_variable(&self, env: &EnvironmentRow, request: &ImportRequest) -> Result<()>;
    fn delete_variable(&self, env: &EnvironmentRow, name: &str) -> Result<()>;
    /// Applies all pending variable changes on the platform.
    fn apply(&self, env: &EnvironmentRow) -> Result<()>;
}

/// Counts of what a pull changed in the database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplySummary {
    pub variables_created: usize,
    pub values_created: usize,
    pub fields_updated: usize,
    pub values_updated: usize,
    pub values_deleted: usize,
    pub variables_deleted: usize,
}

impl ApplySummary {
    pub fn is_noop(&self) -> bool {
        *self == ApplySummary::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushAction {
    Import,
    Delete,
    Apply,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushFailure {
    /// Variable name, or the environment name for the apply step.
    pub name: String,
    pub action: PushAction,
    pub error: String,
}

/// Outcome of a push. `success` is false when any step failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSummary {
    pub environment: String,
    pub imported: Vec<String>,
    pub deleted: Vec<String>,
    pub failures: Vec<PushFailure>,
    pub success: bool,
}

/// Result of refreshing one environment from the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentPullSummary {
    pub environment: String,
    pub variables_count: usize,
}

#[derive(Clone)]
pub struct Applier {
    db: Database,
    engine: DiffEngine,
    source: Arc<dyn SourceReader>,
    writer: Arc<dyn VariableWriter>,
}

impl Applier {
    pub fn new(
        db: Database,
        source: Arc<dyn SourceReader>,
        writer: Arc<dyn VariableWriter>,
    ) -> Self {
        Self {
            engine: DiffEngine::new(db.clone(), Arc::clone(&source)),
            db,
            source,
            writer,
        }
    }

    pub fn engine(&self) -> &DiffEngine {
        &self.engine
    }

    /// Makes the database match the repository for every environment.
    ///
    /// The repository is read first; the database diff and every write then
    /// happen inside one transaction, so a failure leaves nothing behind.
    pub fn apply_pull(&self, owner: OwnerId) -> Result<ApplySummary> {
        let span = info_span!("esv_apply_pull", owner);
        let _enter = span.enter();

        let envs = self.engine.environments(owner)?;
        let source = self.engine.source_lookup(&envs)?;

        let summary = self.db.with_transaction(|conn| {
            let store = DiffEngine::store_lookup_in(conn, owner)?;
            let plan = diff_lookups(&source, &store);
            apply_plan(conn, owner, &plan)
        })?;

        log::info!("Pull applied for owner {}: {:?}", owner, summary);
        Ok(summary)
    }

    /// Pushes the database state of one environment to its platform.
    ///
    /// Every import and delete is attempted even when earlier ones fail;
    /// failures are collected and the apply step still runs.
    pub fn apply_push(&self, owner: OwnerId, env_name: &str) -> Result<PushSummary> {
        let span = info_span!("esv_apply_push", owner, environment = env_name);
        let _enter = span.enter();

        let env = environment_repo::find_by_name(&self.db, owner, env_name)?
            .ok_or_else(|| EsvSyncError::not_found("environment", env_name))?;

        let plan = self.engine.diff(Direction::Push, owner)?.for_environment(env_name);

        if let Some(proxy) = env.proxy.as_deref() {
            log::info!("Using proxy {}", redact_url(proxy));
        }

        let mut summary = PushSummary {
            environment: env_name.to_string(),
            imported: Vec::new(),
            deleted: Vec::new(),
            failures: Vec::new(),
            success: true,
        };

        for entry in plan.create.iter().chain(plan.update.iter()) {
            let Some(request) = ImportRequest::from_entry(entry, env_name) else {
                continue;
            };
            match self.writer.import_variable(&env, &request) {
                Ok(()) => summary.imported.push(entry.name.clone()),
                Err(e) => {
                    log::error!("Failed to import variable {}: {}", entry.name, e);
                    summary.failures.push(PushFailure {
                        name: entry.name.clone(),
                        action: PushAction::Import,
                        error: e.to_string(),
                    });
                }
            }
        }

        for entry in &plan.delete {
            match self.writer.delete_variable(&env, &entry.name) {
                Ok(()) => summary.deleted.push(entry.name.clone()),
                Err(e) => {
                    log::error!("Failed to delete variable {}: {}", entry.name, e);
                    summary.failures.push(PushFailure {
                        name: entry.name.clone(),
                        action: PushAction::Delete,
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Err(e) = self.writer.apply(&env) {
            log::error!("Failed to apply variables for {}: {}", env_name, e);
            summary.failures.push(PushFailure {
                name: env_name.to_string(),
                action: PushAction::Apply,
                error: e.to_string(),
            });
        }

        summary.success = summary.failures.is_empty();
        log::info!(
            "Push to {} finished: {} imported, {} deleted, {} failed",
            env_name,
            summary.imported.len(),
            summary.deleted.len(),
            summary.failures.len()
        );
        Ok(summary)
    }

    /// Upserts every variable the repository defines for one environment.
    /// Description and expression type are overwritten, last writer wins.
    pub fn pull_environment(&self, owner: OwnerId, env_name: &str) -> Result<EnvironmentPullSummary> {
        let span = info_span!("esv_pull_environment", owner, environment = env_name);
        let _enter = span.enter();

        let env = environment_repo::find_by_name(&self.db, owner, env_name)?
            .ok_or_else(|| EsvSyncError::not_found("environment", env_name))?;
        let vars = self.source.read(env_name)?;

        self.db.with_transaction(|conn| {
            for (name, var) in &vars {
                let id = match variable_repo::find(conn, owner, name)? {
                    Some(existing) => {
                        variable_repo::set_description(conn, existing.id, var.description.as_deref())?;
                        variable_repo::set_expression_type(conn, existing.id, &var.expression_type)?;
                        existing.id
                    }
                    None => variable_repo::insert_variable(
                        conn,
                        owner,
                        name,
                        var.description.as_deref(),
                        &var.expression_type,
                    )?,
                };
                variable_repo::upsert_value(conn, id, env.id, &var.value)?;
            }
            Ok::<_, EsvSyncError>(())
        })?;

        log::info!("Pulled {} variables for environment {}", vars.len(), env_name);
        Ok(EnvironmentPullSummary {
            environment: env_name.to_string(),
            variables_count: vars.len(),
        })
    }
}

fn environment_id(conn: &Connection, owner: OwnerId, env: &str) -> Result<i64> {
    variable_repo::environment_id(conn, owner, env)?
        .ok_or_else(|| EsvSyncError::not_found("environment", env))
}

/// Writes a pull plan through `conn`. The caller owns the transaction.
fn apply_plan(conn: &Connection, owner: OwnerId, plan: &DiffPlan) -> Result<ApplySummary> {
    let mut summary = ApplySummary::default();

    for entry in &plan.create {
        let id = match variable_repo::find(conn, owner, &entry.name)? {
            Some(existing) => existing.id,
            None => {
                summary.variables_created += 1;
                variable_repo::insert_variable(
                    conn,
                    owner,
                    &entry.name,
                    entry.description.current().as_deref(),
                    entry.expression_type.current(),
                )?
            }
        };
        for (env, value) in &entry.values {
            variable_repo::insert_value(conn, id, environment_id(conn, owner, env)?, value.current())?;
            summary.values_created += 1;
        }
    }

    for entry in &plan.update {
        let var = variable_repo::find(conn, owner, &entry.name)?
            .ok_or_else(|| EsvSyncError::not_found("variable", &entry.name))?;

        if entry.description.is_changed() {
            variable_repo::set_description(conn, var.id, entry.description.current().as_deref())?;
            summary.fields_updated += 1;
        }
        if entry.expression_type.is_changed() {
            variable_repo::set_expression_type(conn, var.id, entry.expression_type.current())?;
            summary.fields_updated += 1;
        }
        // Snapshot values are already equal; only changed ones need writing.
        for (env, value) in entry.values.iter().filter(|(_, v)| v.is_changed()) {
            variable_repo::upsert_value(conn, var.id, environment_id(conn, owner, env)?, value.current())?;
            summary.values_updated += 1;
        }
    }

    for entry in &plan.delete {
        let Some(var) = variable_repo::find(conn, owner, &entry.name)? else {
            continue;
        };
        for env in entry.values.keys() {
            if variable_repo::delete_value(conn, var.id, environment_id(conn, owner, env)?)? {
                summary.values_deleted += 1;
            }
        }
        if variable_repo::delete_if_empty(conn, var.id)? {
            summary.variables_deleted += 1;
        }
    }

    Ok(summary)
}
