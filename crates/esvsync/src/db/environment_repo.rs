//! Environment repository — owner-scoped CRUD for the `environments` table.
//!
//! Every query filters by `user_profile_id`; there is no way to address an
//! environment by id alone.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::user_repo::OwnerId;
use super::{now_rfc3339, Database, DatabaseError};

/// A raw environment row. `service_account_jwk` holds whatever the caller
/// stored (the service layer stores ciphertext).
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentRow {
    pub id: i64,
    pub owner_id: OwnerId,
    pub name: String,
    pub frodo_path: Option<String>,
    pub platform_url: String,
    pub service_account_id: String,
    pub service_account_jwk: String,
    pub exp_seconds: i64,
    pub scope: String,
    pub proxy: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl EnvironmentRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            owner_id: row.get("user_profile_id")?,
            name: row.get("name")?,
            frodo_path: row.get("frodo_path")?,
            platform_url: row.get("platform_url")?,
            service_account_id: row.get("service_account_id")?,
            service_account_jwk: row.get("service_account_jwk")?,
            exp_seconds: row.get("exp_seconds")?,
            scope: row.get("scope")?,
            proxy: row.get("proxy")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Values for a new environment row.
#[derive(Debug, Clone)]
pub struct NewEnvironment {
    pub name: String,
    pub frodo_path: Option<String>,
    pub platform_url: String,
    pub service_account_id: String,
    pub service_account_jwk: String,
    pub exp_seconds: i64,
    pub scope: String,
    pub proxy: Option<String>,
}

/// Updatable environment fields. The name is not updatable.
#[derive(Debug, Default, Clone)]
pub struct EnvironmentPatch {
    pub frodo_path: Option<String>,
    pub platform_url: Option<String>,
    pub service_account_id: Option<String>,
    pub service_account_jwk: Option<String>,
    pub exp_seconds: Option<i64>,
    pub scope: Option<String>,
    pub proxy: Option<String>,
}

impl EnvironmentPatch {
    pub fn is_empty(&self) -> bool {
        self.frodo_path.is_none()
            && self.platform_url.is_none()
            && self.service_account_id.is_none()
            && self.service_account_jwk.is_none()
            && self.exp_seconds.is_none()
            && self.scope.is_none()
            && self.proxy.is_none()
    }
}

/// Lists the owner's environments ordered by name, on an already locked connection.
pub fn list_in(conn: &Connection, owner: OwnerId) -> Result<Vec<EnvironmentRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM environments WHERE user_profile_id = ?1 ORDER BY name")?;
    let rows = stmt
        .query_map(params![owner], EnvironmentRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Lists the owner's environments ordered by name.
pub fn list(db: &Database, owner: OwnerId) -> Result<Vec<EnvironmentRow>, DatabaseError> {
    db.with_conn(|conn| list_in(conn, owner))
}

fn find_in(
    conn: &Connection,
    owner: OwnerId,
    name: &str,
) -> Result<Option<EnvironmentRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM environments WHERE user_profile_id = ?1 AND name = ?2",
            params![owner, name],
            EnvironmentRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Finds one of the owner's environments by name.
pub fn find_by_name(
    db: &Database,
    owner: OwnerId,
    name: &str,
) -> Result<Option<EnvironmentRow>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, owner, name))
}

/// Inserts a new environment. A duplicate name for the same owner fails
/// with `DatabaseError::Constraint`.
pub fn insert(
    db: &Database,
    owner: OwnerId,
    env: &NewEnvironment,
) -> Result<EnvironmentRow, DatabaseError> {
    db.with_transaction(|conn| {
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO environments (user_profile_id, name, frodo_path, platform_url,
             service_account_id, service_account_jwk, exp_seconds, scope, proxy,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                owner,
                env.name,
                env.frodo_path,
                env.platform_url,
                env.service_account_id,
                env.service_account_jwk,
                env.exp_seconds,
                env.scope,
                env.proxy,
                now,
            ],
        )?;
        find_in(conn, owner, &env.name)?.ok_or(DatabaseError::CorruptRow {
            table: "environments",
            reason: format!("environment '{}' vanished after insert", env.name),
        })
    })
}

/// Applies the present fields of `patch`. Returns `None` when the owner
/// has no environment with that name.
pub fn update(
    db: &Database,
    owner: OwnerId,
    name: &str,
    patch: &EnvironmentPatch,
) -> Result<Option<EnvironmentRow>, DatabaseError> {
    db.with_transaction(|conn| {
        let Some(mut env) = find_in(conn, owner, name)? else {
            return Ok(None);
        };

        if let Some(v) = &patch.frodo_path {
            env.frodo_path = Some(v.clone());
        }
        if let Some(v) = &patch.platform_url {
            env.platform_url = v.clone();
        }
        if let Some(v) = &patch.service_account_id {
            env.service_account_id = v.clone();
        }
        if let Some(v) = &patch.service_account_jwk {
            env.service_account_jwk = v.clone();
        }
        if let Some(v) = patch.exp_seconds {
            env.exp_seconds = v;
        }
        if let Some(v) = &patch.scope {
            env.scope = v.clone();
        }
        if let Some(v) = &patch.proxy {
            env.proxy = Some(v.clone());
        }
        env.updated_at = now_rfc3339();

        conn.execute(
            "UPDATE environments SET frodo_path = ?3, platform_url = ?4, service_account_id = ?5,
             service_account_jwk = ?6, exp_seconds = ?7, scope = ?8, proxy = ?9, updated_at = ?10
             WHERE user_profile_id = ?1 AND name = ?2",
            params![
                owner,
                name,
                env.frodo_path,
                env.platform_url,
                env.service_account_id,
                env.service_account_jwk,
                env.exp_seconds,
                env.scope,
                env.proxy,
                env.updated_at,
            ],
        )?;
        Ok(Some(env))
    })
}

/// Deletes an environment and, through the foreign key cascade, every
/// variable value recorded for it. Variables left without any value are
/// removed in the same transaction. Returns whether a row was removed.
pub fn delete(db: &Database, owner: OwnerId, name: &str) -> Result<bool, DatabaseError> {
    db.with_transaction(|conn| {
        let removed = conn.execute(
            "DELETE FROM environments WHERE user_profile_id = ?1 AND name = ?2",
            params![owner, name],
        )?;
        if removed == 0 {
            return Ok(false);
        }
        let orphans = conn.execute(
            "DELETE FROM esv_variables WHERE user_profile_id = ?1
             AND NOT EXISTS (SELECT 1 FROM esv_variable_values WHERE variable_id = esv_variables.id)",
            params![owner],
        )?;
        if orphans > 0 {
            log::debug!("Removed {} variables left without values", orphans);
        }
        Ok(true)
    })
}
