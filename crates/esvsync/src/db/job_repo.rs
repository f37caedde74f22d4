//! Job repository — owner-scoped rows of the `jobs` table.
//!
//! Status moves only forward: `pending → running → success|failed`. The
//! transition functions enforce this in the `WHERE` clause, so a row in a
//! terminal state is never touched again.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::user_repo::OwnerId;
use super::{now_rfc3339, Database, DatabaseError};

/// A raw job row. `result` is the stored JSON text, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub job_id: String,
    pub owner_id: OwnerId,
    pub job_type: String,
    pub status: String,
    pub result: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            owner_id: row.get("user_profile_id")?,
            job_type: row.get("job_type")?,
            status: row.get("status")?,
            result: row.get("result")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new `pending` job.
pub fn insert_pending(
    db: &Database,
    job_id: &str,
    owner: OwnerId,
    job_type: &str,
) -> Result<JobRow, DatabaseError> {
    db.with_conn(|conn| {
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO jobs (job_id, user_profile_id, job_type, status, result, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', NULL, ?4, ?4)",
            params![job_id, owner, job_type, now],
        )?;
        Ok(JobRow {
            job_id: job_id.to_string(),
            owner_id: owner,
            job_type: job_type.to_string(),
            status: "pending".to_string(),
            result: None,
            created_at: now.clone(),
            updated_at: now,
        })
    })
}

/// `pending → running`. Returns false if the job was not pending.
pub fn mark_running(db: &Database, job_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'running', updated_at = ?2
             WHERE job_id = ?1 AND status = 'pending'",
            params![job_id, now_rfc3339()],
        )?;
        Ok(changed > 0)
    })
}

/// `running → success|failed` with the result JSON. Returns false if the
/// job was not running.
pub fn mark_finished(
    db: &Database,
    job_id: &str,
    succeeded: bool,
    result: &str,
) -> Result<bool, DatabaseError> {
    let status = if succeeded { "success" } else { "failed" };
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2, result = ?3, updated_at = ?4
             WHERE job_id = ?1 AND status = 'running'",
            params![job_id, status, result, now_rfc3339()],
        )?;
        Ok(changed > 0)
    })
}

fn find_in(
    conn: &Connection,
    owner: OwnerId,
    job_id: &str,
) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM jobs WHERE job_id = ?1 AND user_profile_id = ?2",
            params![job_id, owner],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Finds a job owned by `owner`. Another owner's job is reported as absent.
pub fn find(db: &Database, owner: OwnerId, job_id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, owner, job_id))
}

/// Lists the owner's jobs, newest first.
pub fn list(db: &Database, owner: OwnerId) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE user_profile_id = ?1 ORDER BY created_at DESC, job_id",
        )?;
        let rows = stmt
            .query_map(params![owner], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
