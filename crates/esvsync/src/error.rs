use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DatabaseError;
use crate::exec::ExecError;
use crate::secrets::SecretError;

#[derive(Error, Debug)]
pub enum EsvSyncError {
    /// Missing or not owned by the caller. Both cases look the same from outside.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    Conflict { kind: &'static str, name: String },

    #[error("No environments found for current user")]
    NoEnvironments,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Variable folder for environment '{environment}' not found: {path}")]
    SourceNotFound { environment: String, path: PathBuf },

    #[error("Command error: {0}")]
    Command(#[from] ExecError),

    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<DatabaseError> for EsvSyncError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Constraint(message) => EsvSyncError::Conflict {
                kind: "record",
                name: message,
            },
            other => EsvSyncError::Database(other),
        }
    }
}

impl EsvSyncError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        EsvSyncError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(kind: &'static str, name: impl Into<String>) -> Self {
        EsvSyncError::Conflict {
            kind,
            name: name.into(),
        }
    }

    /// HTTP status the API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            EsvSyncError::NotFound { .. } => 404,
            EsvSyncError::Conflict { .. } => 409,
            EsvSyncError::Validation(_) | EsvSyncError::NoEnvironments => 400,
            EsvSyncError::Forbidden(_) => 403,
            _ => 500,
        }
    }

    /// Message safe to show to API clients. Server-side failures are reduced
    /// to a generic text so command output and paths never leak.
    pub fn public_message(&self) -> String {
        if self.status_code() >= 500 {
            "Internal Server Error".to_string()
        } else {
            self.to_string()
        }
    }

    /// True when an external process exited non-zero or ran past its timeout.
    pub fn is_command_failure(&self) -> bool {
        matches!(
            self,
            EsvSyncError::Command(ExecError::CommandFailed { .. } | ExecError::TimedOut { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, EsvSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(EsvSyncError::not_found("job", "abc").status_code(), 404);
        assert_eq!(EsvSyncError::conflict("environment", "DEV").status_code(), 409);
        assert_eq!(EsvSyncError::Validation("x".into()).status_code(), 400);
        assert_eq!(EsvSyncError::NoEnvironments.status_code(), 400);
        assert_eq!(EsvSyncError::Forbidden("inactive".into()).status_code(), 403);
        assert_eq!(
            EsvSyncError::SourceNotFound {
                environment: "DEV".into(),
                path: PathBuf::from("/tmp/x"),
            }
            .status_code(),
            500
        );
    }

    #[test]
    fn test_public_message_hides_internal_details() {
        let err = EsvSyncError::Command(ExecError::CommandFailed {
            program: "frodo".into(),
            exit_code: 2,
            stdout: String::new(),
            stderr: "secret token leaked".into(),
        });
        assert!(err.is_command_failure());
        assert_eq!(err.public_message(), "Internal Server Error");

        let err = EsvSyncError::Command(ExecError::TimedOut {
            program: "frodo".into(),
            timeout: std::time::Duration::from_secs(30),
        });
        assert!(err.is_command_failure());
        assert_eq!(err.status_code(), 500);

        let err = EsvSyncError::Command(ExecError::Spawn {
            program: "frodo".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert!(!err.is_command_failure());

        let err = EsvSyncError::not_found("environment", "SBX");
        assert_eq!(err.public_message(), "environment not found: SBX");
    }

    #[test]
    fn test_constraint_violation_becomes_conflict() {
        let err: EsvSyncError = DatabaseError::Constraint("UNIQUE failed".into()).into();
        assert!(matches!(err, EsvSyncError::Conflict { .. }));

        let err: EsvSyncError = DatabaseError::LockPoisoned.into();
        assert!(matches!(err, EsvSyncError::Database(_)));
    }
}
