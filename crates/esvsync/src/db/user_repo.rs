//! User repository — identity users and their profiles.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{now_rfc3339, Database, DatabaseError};

/// Profile id. Every owned row references it.
pub type OwnerId = i64;

pub const DEFAULT_ISSUER: &str = "local-idp";

/// A user profile row.
#[derive(Debug, Clone, PartialEq)]
pub struct UserProfileRow {
    pub id: OwnerId,
    pub user_id: i64,
    pub username: String,
    pub email: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub created_at: String,
}

impl UserProfileRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            username: row.get("username")?,
            email: row.get("email")?,
            role: row.get("role")?,
            is_active: row.get("is_active")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Fields an administrator may change on a profile. Absent fields are untouched.
#[derive(Debug, Default, Clone)]
pub struct ProfilePatch {
    pub email: Option<String>,
    pub role: Option<String>,
    pub is_active: Option<bool>,
}

/// Returns the profile for `(subject, issuer)`, creating the identity user
/// and a default profile on first sight. Safe to call on every request.
pub fn ensure_provisioned(
    db: &Database,
    subject: &str,
    issuer: &str,
) -> Result<UserProfileRow, DatabaseError> {
    db.with_transaction(|conn| {
        let now = now_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO identity_users (subject, issuer, created_at) VALUES (?1, ?2, ?3)",
            params![subject, issuer, now],
        )?;
        let user_id: i64 = conn.query_row(
            "SELECT id FROM identity_users WHERE subject = ?1 AND issuer = ?2",
            params![subject, issuer],
            |r| r.get(0),
        )?;

        if let Some(profile) = find_by_user_id(conn, user_id)? {
            return Ok(profile);
        }

        conn.execute(
            "INSERT INTO user_profiles (user_id, username, role, is_active, created_at)
             VALUES (?1, ?2, 'user', 1, ?3)",
            params![user_id, subject, now],
        )?;
        log::info!("Provisioned profile for subject '{}' ({})", subject, issuer);

        find_by_user_id(conn, user_id)?.ok_or(DatabaseError::CorruptRow {
            table: "user_profiles",
            reason: format!("profile for user {} vanished after insert", user_id),
        })
    })
}

fn find_by_user_id(
    conn: &Connection,
    user_id: i64,
) -> Result<Option<UserProfileRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM user_profiles WHERE user_id = ?1",
            params![user_id],
            UserProfileRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Finds a profile by its id.
pub fn find_profile(db: &Database, id: OwnerId) -> Result<Option<UserProfileRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM user_profiles WHERE id = ?1",
                params![id],
                UserProfileRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Applies a profile patch. Returns `None` if the profile does not exist.
pub fn update_profile(
    db: &Database,
    id: OwnerId,
    patch: &ProfilePatch,
) -> Result<Option<UserProfileRow>, DatabaseError> {
    db.with_transaction(|conn| {
        if let Some(email) = &patch.email {
            conn.execute(
                "UPDATE user_profiles SET email = ?2 WHERE id = ?1",
                params![id, email],
            )?;
        }
        if let Some(role) = &patch.role {
            conn.execute(
                "UPDATE user_profiles SET role = ?2 WHERE id = ?1",
                params![id, role],
            )?;
        }
        if let Some(is_active) = patch.is_active {
            conn.execute(
                "UPDATE user_profiles SET is_active = ?2 WHERE id = ?1",
                params![id, is_active],
            )?;
        }
        let row = conn
            .query_row(
                "SELECT * FROM user_profiles WHERE id = ?1",
                params![id],
                UserProfileRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}
