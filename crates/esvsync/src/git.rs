//! Git operations on the configuration repository.
//!
//! All commands go through the shared [`CommandExecutor`] with the
//! repository as working directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::exec::{CommandExecutor, CommandOutput, CommandSpec};

pub struct GitRepository {
    repo_path: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl GitRepository {
    pub fn new(repo_path: impl Into<PathBuf>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            repo_path: repo_path.into(),
            executor,
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Runs a git command in the repository directory.
    fn run_git(&self, args: &[&str]) -> Result<CommandOutput> {
        let spec = CommandSpec::new("git")
            .args(args.iter().copied())
            .current_dir(&self.repo_path);
        log::debug!("Running: {}", spec);
        Ok(self.executor.run(&spec)?)
    }

    /// Sets the commit identity for this repository only.
    pub fn configure_identity(&self, name: &str, email: &str) -> Result<()> {
        self.run_git(&["config", "user.name", name])?;
        self.run_git(&["config", "user.email", email])?;
        Ok(())
    }

    pub fn checkout(&self, branch: &str) -> Result<()> {
        self.run_git(&["checkout", branch])?;
        Ok(())
    }

    /// `git pull origin <branch>`
    pub fn pull(&self, branch: &str) -> Result<CommandOutput> {
        self.run_git(&["pull", "origin", branch])
    }

    /// Porcelain status lines restricted to `pathspec`.
    pub fn changed_files(&self, pathspec: &str) -> Result<Vec<String>> {
        let output = self.run_git(&["status", "--porcelain", "--untracked-files=all", pathspec])?;
        Ok(output
            .stdout
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| {
                let path = l[3..].trim();
                // Renames are reported as "old -> new".
                path.rsplit(" -> ").next().unwrap_or(path).to_string()
            })
            .collect())
    }

    pub fn add(&self, pathspec: &str) -> Result<()> {
        self.run_git(&["add", pathspec])?;
        Ok(())
    }

    pub fn commit(&self, message: &str) -> Result<CommandOutput> {
        self.run_git(&["commit", "-m", message])
    }

    /// `git push origin <branch>`
    pub fn push(&self, branch: &str) -> Result<CommandOutput> {
        self.run_git(&["push", "origin", branch])
    }
}
