//! ESV variable repository — `esv_variables` and `esv_variable_values`.
//!
//! Functions take a `&Connection` so callers decide the lock or
//! transaction scope; a whole pull is applied through one transaction.
//! Values are addressed by environment *name*, resolved against the
//! owner's own environments only.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};

use super::user_repo::OwnerId;
use super::DatabaseError;

/// A variable with its per-environment values keyed by environment name.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVariable {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub expression_type: String,
    pub values: BTreeMap<String, String>,
}

/// Loads every variable of the owner with its values in one query.
pub fn load_all(
    conn: &Connection,
    owner: OwnerId,
) -> Result<BTreeMap<String, StoredVariable>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT v.id, v.name, v.description, v.expression_type, e.name, vv.value
         FROM esv_variables v
         LEFT JOIN esv_variable_values vv ON vv.variable_id = v.id
         LEFT JOIN environments e
           ON e.id = vv.environment_id AND e.user_profile_id = v.user_profile_id
         WHERE v.user_profile_id = ?1
         ORDER BY v.name, e.name",
    )?;

    let rows = stmt.query_map(params![owner], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut variables: BTreeMap<String, StoredVariable> = BTreeMap::new();
    for row in rows {
        let (id, name, description, expression_type, env_name, value) = row?;
        let entry = variables
            .entry(name.clone())
            .or_insert_with(|| StoredVariable {
                id,
                name,
                description,
                expression_type,
                values: BTreeMap::new(),
            });
        if let (Some(env_name), Some(value)) = (env_name, value) {
            entry.values.insert(env_name, value);
        }
    }

    Ok(variables)
}

/// Finds one variable of the owner by name.
pub fn find(
    conn: &Connection,
    owner: OwnerId,
    name: &str,
) -> Result<Option<StoredVariable>, DatabaseError> {
    let head = conn
        .query_row(
            "SELECT id, description, expression_type FROM esv_variables
             WHERE user_profile_id = ?1 AND name = ?2",
            params![owner, name],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((id, description, expression_type)) = head else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT e.name, vv.value FROM esv_variable_values vv
         JOIN environments e ON e.id = vv.environment_id
         WHERE vv.variable_id = ?1 AND e.user_profile_id = ?2
         ORDER BY e.name",
    )?;
    let values = stmt
        .query_map(params![id, owner], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    Ok(Some(StoredVariable {
        id,
        name: name.to_string(),
        description,
        expression_type,
        values,
    }))
}

/// Resolves one of the owner's environments by name.
pub fn environment_id(
    conn: &Connection,
    owner: OwnerId,
    env_name: &str,
) -> Result<Option<i64>, DatabaseError> {
    let id = conn
        .query_row(
            "SELECT id FROM environments WHERE user_profile_id = ?1 AND name = ?2",
            params![owner, env_name],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Inserts a variable row and returns its id.
pub fn insert_variable(
    conn: &Connection,
    owner: OwnerId,
    name: &str,
    description: Option<&str>,
    expression_type: &str,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO esv_variables (user_profile_id, name, description, expression_type)
         VALUES (?1, ?2, ?3, ?4)",
        params![owner, name, description, expression_type],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn set_description(
    conn: &Connection,
    variable_id: i64,
    description: Option<&str>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE esv_variables SET description = ?2 WHERE id = ?1",
        params![variable_id, description],
    )?;
    Ok(())
}

pub fn set_expression_type(
    conn: &Connection,
    variable_id: i64,
    expression_type: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE esv_variables SET expression_type = ?2 WHERE id = ?1",
        params![variable_id, expression_type],
    )?;
    Ok(())
}

/// Inserts a value. An existing value for the same environment is a
/// constraint violation.
pub fn insert_value(
    conn: &Connection,
    variable_id: i64,
    environment_id: i64,
    value: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO esv_variable_values (variable_id, environment_id, value) VALUES (?1, ?2, ?3)",
        params![variable_id, environment_id, value],
    )?;
    Ok(())
}

/// Overwrites an existing value. Returns false when there was none.
pub fn update_value(
    conn: &Connection,
    variable_id: i64,
    environment_id: i64,
    value: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE esv_variable_values SET value = ?3 WHERE variable_id = ?1 AND environment_id = ?2",
        params![variable_id, environment_id, value],
    )?;
    Ok(changed > 0)
}

/// Inserts or overwrites a value.
pub fn upsert_value(
    conn: &Connection,
    variable_id: i64,
    environment_id: i64,
    value: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO esv_variable_values (variable_id, environment_id, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(variable_id, environment_id) DO UPDATE SET value = excluded.value",
        params![variable_id, environment_id, value],
    )?;
    Ok(())
}

/// Removes one value. Returns whether a row was removed.
pub fn delete_value(
    conn: &Connection,
    variable_id: i64,
    environment_id: i64,
) -> Result<bool, DatabaseError> {
    let removed = conn.execute(
        "DELETE FROM esv_variable_values WHERE variable_id = ?1 AND environment_id = ?2",
        params![variable_id, environment_id],
    )?;
    Ok(removed > 0)
}

/// Removes every value of a variable.
pub fn delete_all_values(conn: &Connection, variable_id: i64) -> Result<usize, DatabaseError> {
    let removed = conn.execute(
        "DELETE FROM esv_variable_values WHERE variable_id = ?1",
        params![variable_id],
    )?;
    Ok(removed)
}

pub fn count_values(conn: &Connection, variable_id: i64) -> Result<u64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM esv_variable_values WHERE variable_id = ?1",
        params![variable_id],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Removes the variable if it has no values left. Returns whether it was removed.
pub fn delete_if_empty(conn: &Connection, variable_id: i64) -> Result<bool, DatabaseError> {
    if count_values(conn, variable_id)? > 0 {
        return Ok(false);
    }
    conn.execute(
        "DELETE FROM esv_variables WHERE id = ?1",
        params![variable_id],
    )?;
    Ok(true)
}
