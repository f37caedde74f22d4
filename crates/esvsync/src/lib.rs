pub mod config;
pub mod db;
pub mod error;
pub mod esv;
pub mod exec;
pub mod frodo;
pub mod git;
pub mod jobs;
pub mod logging;
pub mod publish;
pub mod sanitize;
pub mod secrets;
pub mod service;

pub use config::{load_settings, ConfigError, LoggingSettings, Settings};
pub use db::{Database, DatabaseError};
pub use error::{EsvSyncError, Result};
pub use esv::{
    diff_lookups, Applier, ApplySummary, DiffEngine, DiffEntry, DiffPlan, Direction, FieldDiff,
    PushSummary, SourceReader, VariableWriter,
};
pub use exec::{CommandExecutor, CommandOutput, CommandSpec, ExecError, ProcessExecutor};
pub use jobs::{JobInfo, JobRunner, JobStatus, JobType, TaskExecutor, WorkerPool};
pub use publish::{PublishReport, StepStatus};
pub use secrets::{resolve_secret, SecretCipher, SecretError};
pub use service::{EnvironmentInput, EnvironmentUpdate, EnvironmentView, EsvService};
