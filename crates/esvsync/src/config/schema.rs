use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::default_database_path;

/// Runtime settings, read once at startup and passed to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Local clone of the configuration repository.
    pub config_repo_path: PathBuf,
    #[serde(default = "default_branch_name")]
    pub branch_name: String,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Used for environments that do not name their own binary.
    #[serde(default = "default_frodo_path")]
    pub frodo_path: String,
    /// Kill external commands after this many seconds. Unset means wait
    /// forever.
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
    /// File holding the hex key for credential encryption. Falls back to
    /// `ESVSYNC_SECRET_KEY`.
    #[serde(default)]
    pub secret_key_file: Option<String>,
    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_branch_name() -> String {
    "main".to_string()
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_frodo_path() -> String {
    "frodo".to_string()
}

impl Settings {
    /// Settings with defaults for everything but the repository path.
    pub fn new(config_repo_path: impl Into<PathBuf>) -> Self {
        Self {
            config_repo_path: config_repo_path.into(),
            branch_name: default_branch_name(),
            database_path: None,
            worker_count: default_worker_count(),
            frodo_path: default_frodo_path(),
            command_timeout_secs: None,
            secret_key_file: None,
            logging: LoggingSettings::default(),
        }
    }

    /// Configured database path, or `~/.esvsync/data/esvsync.db`. `None`
    /// only when neither is available.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path.clone().or_else(default_database_path)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}
