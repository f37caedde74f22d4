//! Export an environment's live configuration into the repository and
//! push it.
//!
//! Steps: git identity and branch sync, clean `configs/<ENV>`, `frodo
//! config export`, then commit and push only when the export changed
//! something. The first failing step ends the run; its error is recorded in
//! the report rather than returned.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info_span;

use crate::db::environment_repo::EnvironmentRow;
use crate::error::{EsvSyncError, Result};
use crate::frodo::FrodoCli;
use crate::git::GitRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Success,
    Failed,
    NoChanges,
}

/// What happened in each step of a publish run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReport {
    pub env_name: String,
    pub branch_name: String,
    pub export_status: StepStatus,
    pub git_push_status: StepStatus,
    pub stdout: String,
    pub stderr: String,
    pub overall_status: StepStatus,
}

impl PublishReport {
    fn new(env_name: &str, branch_name: &str) -> Self {
        Self {
            env_name: env_name.to_string(),
            branch_name: branch_name.to_string(),
            export_status: StepStatus::Pending,
            git_push_status: StepStatus::Pending,
            stdout: String::new(),
            stderr: String::new(),
            overall_status: StepStatus::Pending,
        }
    }

    fn fail(mut self, stage: &str, err: &EsvSyncError) -> Self {
        log::error!("{} failed for {}: {}", stage, self.env_name, err);
        self.stderr = err.to_string();
        self.overall_status = StepStatus::Failed;
        self
    }

    pub fn succeeded(&self) -> bool {
        self.overall_status == StepStatus::Success
    }

    /// One-line human summary, as shown to API clients.
    pub fn detail(&self) -> String {
        match (self.overall_status, self.export_status, self.git_push_status) {
            (StepStatus::Success, _, StepStatus::NoChanges) => format!(
                "Environment '{}' exported successfully but no changes to push.",
                self.env_name
            ),
            (StepStatus::Success, _, _) => format!(
                "Environment '{}' exported and pushed successfully.",
                self.env_name
            ),
            (_, StepStatus::Failed, _) => format!("Config export failed: {}", self.stderr),
            (_, _, StepStatus::Failed) => format!("Git commit/push failed: {}", self.stderr),
            _ => format!("Setup failed: {}", self.stderr),
        }
    }
}

/// Removes every subdirectory of `dir`. A missing `dir` is fine.
pub fn clean_config_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let io_err = |source| EsvSyncError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).map_err(|e| EsvSyncError::Io {
                path: path.clone(),
                source: e,
            })?;
            log::info!("Deleted {}", path.display());
        }
    }
    Ok(())
}

pub struct Publisher<'a> {
    pub frodo: &'a FrodoCli,
    pub git: &'a GitRepository,
    pub branch_name: &'a str,
}

impl Publisher<'_> {
    fn configs_dir(&self, env_name: &str) -> PathBuf {
        self.git.repo_path().join("configs").join(env_name)
    }

    /// Runs the whole workflow for `env`, committing as `author_name <author_email>`.
    pub fn publish(&self, env: &EnvironmentRow, author_name: &str, author_email: &str) -> PublishReport {
        let span = info_span!("publish", environment = %env.name, branch = self.branch_name);
        let _enter = span.enter();

        let mut report = PublishReport::new(&env.name, self.branch_name);
        let configs_dir = self.configs_dir(&env.name);
        let pathspec = format!("configs/{}", env.name);

        let setup = self
            .git
            .configure_identity(author_name, author_email)
            .and_then(|_| self.git.checkout(self.branch_name))
            .and_then(|_| self.git.pull(self.branch_name).map(|_| ()));
        if let Err(e) = setup {
            return report.fail("Git setup", &e);
        }

        if let Err(e) = clean_config_dir(&configs_dir) {
            return report.fail("Cleaning old configs", &e);
        }

        match self.frodo.config_export(env, &configs_dir) {
            Ok(output) => {
                report.export_status = StepStatus::Success;
                report.stdout = output.stdout;
                report.stderr = output.stderr;
            }
            Err(e) => {
                report.export_status = StepStatus::Failed;
                return report.fail("Config export", &e);
            }
        }

        let changed = match self.git.changed_files(&pathspec) {
            Ok(changed) => changed,
            Err(e) => {
                report.git_push_status = StepStatus::Failed;
                return report.fail("Git status", &e);
            }
        };

        if changed.is_empty() {
            log::info!("No changes detected for {}, skipping commit", env.name);
            report.git_push_status = StepStatus::NoChanges;
        } else {
            log::info!("{} changed files for {}, committing", changed.len(), env.name);
            let message = format!(
                "Automated update for {} on {}",
                env.name,
                chrono::Utc::now().to_rfc3339()
            );
            let pushed = self
                .git
                .add(&pathspec)
                .and_then(|_| self.git.commit(&message))
                .and_then(|_| self.git.push(self.branch_name));
            if let Err(e) = pushed {
                report.git_push_status = StepStatus::Failed;
                return report.fail("Git commit/push", &e);
            }
            report.git_push_status = StepStatus::Success;
            report.stdout = changed.join("\n");
        }

        report.overall_status = StepStatus::Success;
        log::info!("Publish finished for {} on {}", env.name, self.branch_name);
        report
    }
}
