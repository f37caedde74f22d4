//! Direct variable CRUD for the API layer.
//!
//! Each batch call is one transaction. Entries naming an unknown variable
//! or environment are skipped with a warning, never failed.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::user_repo::OwnerId;
use crate::db::variable_repo::{self, StoredVariable};
use crate::db::{Database, DatabaseError};
use crate::error::Result;

/// A variable as returned to API clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableView {
    pub name: String,
    pub description: Option<String>,
    pub expression_type: String,
    pub values: BTreeMap<String, String>,
}

impl From<StoredVariable> for VariableView {
    fn from(var: StoredVariable) -> Self {
        Self {
            name: var.name,
            description: var.description,
            expression_type: var.expression_type,
            values: var.values,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableCreate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_expression_type")]
    pub expression_type: String,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

fn default_expression_type() -> String {
    "string".to_string()
}

/// Present fields are applied; absent ones are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableUpdate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expression_type: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// Without `environments` the whole variable goes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDelete {
    pub name: String,
    #[serde(default)]
    pub environments: Vec<String>,
}

#[derive(Clone)]
pub struct VariableStore {
    db: Database,
}

impl VariableStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn list(&self, owner: OwnerId) -> Result<Vec<VariableView>> {
        let vars = self
            .db
            .with_conn(|conn| variable_repo::load_all(conn, owner))?;
        log::debug!("Found {} variables for owner {}", vars.len(), owner);
        Ok(vars.into_values().map(VariableView::from).collect())
    }

    pub fn get(&self, owner: OwnerId, name: &str) -> Result<Option<VariableView>> {
        let var = self
            .db
            .with_conn(|conn| variable_repo::find(conn, owner, name))?;
        Ok(var.map(VariableView::from))
    }

    /// Creates missing variables and adds values for the owner's known
    /// environments. Existing values are never overwritten.
    pub fn create(&self, owner: OwnerId, items: &[VariableCreate]) -> Result<Vec<VariableView>> {
        let views = self.db.with_transaction(|conn| {
            let mut views = Vec::with_capacity(items.len());
            for item in items {
                if item.values.is_empty() {
                    log::warn!("Skipping variable {}: no values provided", item.name);
                    continue;
                }

                let (id, existing) = match variable_repo::find(conn, owner, &item.name)? {
                    Some(var) => (var.id, var.values),
                    None => {
                        log::info!("Creating variable {}", item.name);
                        let id = variable_repo::insert_variable(
                            conn,
                            owner,
                            &item.name,
                            item.description.as_deref(),
                            &item.expression_type,
                        )?;
                        (id, BTreeMap::new())
                    }
                };

                for (env_name, value) in &item.values {
                    let Some(env_id) = variable_repo::environment_id(conn, owner, env_name)? else {
                        log::warn!("Environment {} not found, skipping value", env_name);
                        continue;
                    };
                    if existing.contains_key(env_name) {
                        continue;
                    }
                    variable_repo::insert_value(conn, id, env_id, value)?;
                }

                views.push(reload(conn, owner, &item.name)?);
            }
            Ok::<_, DatabaseError>(views)
        })?;
        log::info!("Created {} variables for owner {}", views.len(), owner);
        Ok(views)
    }

    /// Applies present fields and overwrites values that already exist.
    /// Values for environments without a row are skipped; use create.
    pub fn update(&self, owner: OwnerId, items: &[VariableUpdate]) -> Result<Vec<VariableView>> {
        let views = self.db.with_transaction(|conn| {
            let mut views = Vec::with_capacity(items.len());
            for item in items {
                let Some(var) = variable_repo::find(conn, owner, &item.name)? else {
                    log::warn!("Variable {} not found, skipping", item.name);
                    continue;
                };

                if let Some(description) = &item.description {
                    variable_repo::set_description(conn, var.id, Some(description))?;
                }
                if let Some(expression_type) = &item.expression_type {
                    variable_repo::set_expression_type(conn, var.id, expression_type)?;
                }

                for (env_name, value) in &item.values {
                    let Some(env_id) = variable_repo::environment_id(conn, owner, env_name)? else {
                        log::warn!("Environment {} not found, skipping value", env_name);
                        continue;
                    };
                    if !variable_repo::update_value(conn, var.id, env_id, value)? {
                        log::warn!(
                            "No value for {} in {}, skipping (create it first)",
                            item.name,
                            env_name
                        );
                    }
                }

                views.push(reload(conn, owner, &item.name)?);
            }
            Ok::<_, DatabaseError>(views)
        })?;
        Ok(views)
    }

    /// Removes listed environment values, or every value when none are
    /// listed. A variable left without values is removed. Returns the
    /// variables that still exist afterwards.
    pub fn delete(&self, owner: OwnerId, items: &[VariableDelete]) -> Result<Vec<VariableView>> {
        let views = self.db.with_transaction(|conn| {
            let mut views = Vec::new();
            for item in items {
                let Some(var) = variable_repo::find(conn, owner, &item.name)? else {
                    log::warn!("Variable {} not found, skipping", item.name);
                    continue;
                };

                if item.environments.is_empty() {
                    variable_repo::delete_all_values(conn, var.id)?;
                } else {
                    for env_name in &item.environments {
                        let Some(env_id) = variable_repo::environment_id(conn, owner, env_name)?
                        else {
                            log::warn!("Environment {} not found, skipping", env_name);
                            continue;
                        };
                        if !variable_repo::delete_value(conn, var.id, env_id)? {
                            log::info!("No value to delete for {} in {}", item.name, env_name);
                        }
                    }
                }

                if variable_repo::delete_if_empty(conn, var.id)? {
                    log::info!("Deleted variable {}: no remaining values", item.name);
                } else {
                    views.push(reload(conn, owner, &item.name)?);
                }
            }
            Ok::<_, DatabaseError>(views)
        })?;
        Ok(views)
    }
}

fn reload(
    conn: &Connection,
    owner: OwnerId,
    name: &str,
) -> std::result::Result<VariableView, DatabaseError> {
    variable_repo::find(conn, owner, name)?
        .map(VariableView::from)
        .ok_or(DatabaseError::CorruptRow {
            table: "esv_variables",
            reason: format!("variable '{}' vanished mid-transaction", name),
        })
}
