//! Background jobs: tracked, owner-scoped units of work.

pub mod pool;
pub mod runner;

pub use pool::{PoolError, Task, TaskExecutor, WorkerPool};
pub use runner::JobRunner;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::db::job_repo::JobRow;
use crate::error::{EsvSyncError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = EsvSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => Err(EsvSyncError::Validation(format!(
                "Unknown job status '{}'",
                other
            ))),
        }
    }
}

/// Kinds of work the service runs in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ApplyPull,
    ApplyPush,
    Publish,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ApplyPull => "apply_pull",
            JobType::ApplyPush => "apply_push",
            JobType::Publish => "publish",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as returned to its owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<JobRow> for JobInfo {
    type Error = EsvSyncError;

    fn try_from(row: JobRow) -> Result<Self> {
        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Self {
            status: row.status.parse()?,
            job_id: row.job_id,
            job_type: row.job_type,
            result,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
