//! Test harness for isolated service tests.
//!
//! Every harness owns a temp directory with a configuration repository
//! layout, an in-memory database and an `EsvService` whose external
//! commands go to a scripted [`FakeExecutor`].

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use esvsync::db::user_repo::{self, OwnerId, ProfilePatch, DEFAULT_ISSUER};
use esvsync::jobs::{PoolError, Task};
use esvsync::{
    CommandExecutor, CommandOutput, CommandSpec, Database, EnvironmentInput, EsvService,
    ExecError, JobStatus, ProcessExecutor, SecretCipher, Settings, TaskExecutor, WorkerPool,
};

use super::builders::{EnvironmentBuilder, VariableFileBuilder};

pub const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

/// What a scripted command does.
#[derive(Debug, Clone)]
pub enum Outcome {
    Stdout(String),
    /// Exit code 1 with this stderr.
    Fail(String),
    /// Writes `(relative path, content)` pairs into the export directory,
    /// the fourth argument of `config export -sxoAND <dir> <url>`.
    Export(Vec<(String, String)>),
}

/// Records every command and answers from a list of `(needle, outcome)`
/// rules matched against the printed command line. Unmatched commands
/// succeed with empty output.
pub struct FakeExecutor {
    calls: Mutex<Vec<CommandSpec>>,
    rules: Mutex<Vec<(String, Outcome)>>,
    real_git: Option<ProcessExecutor>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            real_git: None,
        }
    }

    /// Like `new`, but `git` commands run for real.
    pub fn with_real_git() -> Self {
        Self {
            real_git: Some(ProcessExecutor::new()),
            ..Self::new()
        }
    }

    pub fn on(&self, needle: &str, outcome: Outcome) {
        self.rules
            .lock()
            .unwrap()
            .push((needle.to_string(), outcome));
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.to_string()).collect()
    }

    /// Command lines of the given program only.
    pub fn lines_of(&self, program: &str) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.program == program)
            .map(|c| c.to_string())
            .collect()
    }
}

impl CommandExecutor for FakeExecutor {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        self.calls.lock().unwrap().push(spec.clone());

        if spec.program == "git" {
            if let Some(git) = &self.real_git {
                return git.run(spec);
            }
        }

        let line = spec.to_string();
        let outcome = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, outcome)| outcome.clone());

        match outcome {
            None => Ok(CommandOutput::default()),
            Some(Outcome::Stdout(stdout)) => Ok(CommandOutput {
                stdout,
                stderr: String::new(),
            }),
            Some(Outcome::Fail(stderr)) => Err(ExecError::CommandFailed {
                program: spec.program.clone(),
                exit_code: 1,
                stdout: String::new(),
                stderr,
            }),
            Some(Outcome::Export(files)) => {
                let dir = PathBuf::from(&spec.args[3]);
                for (rel, content) in files {
                    let path = dir.join(rel);
                    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                    std::fs::write(path, content).unwrap();
                }
                Ok(CommandOutput {
                    stdout: "Exported".to_string(),
                    stderr: String::new(),
                })
            }
        }
    }
}

/// Runs tasks on the submitting thread, so job state is final as soon as
/// `submit` returns.
pub struct InlineTasks;

impl TaskExecutor for InlineTasks {
    fn execute(&self, task: Task) -> Result<(), PoolError> {
        task();
        Ok(())
    }
}

pub struct TestHarness {
    temp_dir: TempDir,
    pub repo_root: PathBuf,
    pub db: Database,
    pub executor: Arc<FakeExecutor>,
    pub service: EsvService,
    /// Profile of the default test user.
    pub owner: OwnerId,
}

impl TestHarness {
    /// Harness with inline job execution and fully scripted commands.
    pub fn new() -> Self {
        Self::build(FakeExecutor::new(), Arc::new(InlineTasks))
    }

    /// Harness whose jobs run on a real worker pool.
    pub fn with_worker_pool(workers: usize) -> Self {
        Self::build(FakeExecutor::new(), Arc::new(WorkerPool::new(workers)))
    }

    /// Harness where `git` runs for real against the temp repository.
    pub fn with_real_git() -> Self {
        Self::build(FakeExecutor::with_real_git(), Arc::new(InlineTasks))
    }

    fn build(executor: FakeExecutor, tasks: Arc<dyn TaskExecutor>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let repo_root = temp_dir.path().join("repo");
        std::fs::create_dir_all(repo_root.join("configs")).expect("Failed to create repo dir");

        let db = Database::open_in_memory().expect("Failed to open database");
        let executor = Arc::new(executor);
        let service = EsvService::new(
            Settings::new(&repo_root),
            db.clone(),
            Arc::clone(&executor) as Arc<dyn CommandExecutor>,
            tasks,
        )
        .with_cipher(SecretCipher::from_hex_key(TEST_KEY).expect("Invalid test key"));
        let owner = service
            .ensure_provisioned("alice", DEFAULT_ISSUER)
            .expect("Failed to provision test user")
            .id;

        Self {
            temp_dir,
            repo_root,
            db,
            executor,
            service,
            owner,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Provisions another user and returns their profile id.
    pub fn user(&self, subject: &str) -> OwnerId {
        self.service
            .ensure_provisioned(subject, DEFAULT_ISSUER)
            .expect("Failed to provision user")
            .id
    }

    pub fn set_email(&self, owner: OwnerId, email: &str) {
        user_repo::update_profile(
            &self.db,
            owner,
            &ProfilePatch {
                email: Some(email.to_string()),
                ..Default::default()
            },
        )
        .expect("Failed to update profile");
    }

    /// Adds an environment for the default user and creates its variable
    /// folder in the repository.
    pub fn add_environment(&self, name: &str) {
        self.add_environment_for(self.owner, EnvironmentBuilder::new(name).build());
    }

    pub fn add_environment_for(&self, owner: OwnerId, input: EnvironmentInput) {
        std::fs::create_dir_all(self.variable_dir(&input.name))
            .expect("Failed to create variable dir");
        self.service
            .create_environment(owner, input)
            .expect("Failed to create environment");
    }

    pub fn variable_dir(&self, env: &str) -> PathBuf {
        self.repo_root
            .join("configs")
            .join(env)
            .join("global")
            .join("variable")
    }

    /// Writes `<name>.variable.json` for `env`.
    pub fn write_variable(&self, env: &str, file: &VariableFileBuilder) -> PathBuf {
        self.write_raw(env, &format!("{}.variable.json", file.name()), &file.to_json())
    }

    pub fn write_raw(&self, env: &str, filename: &str, content: &str) -> PathBuf {
        let dir = self.variable_dir(env);
        std::fs::create_dir_all(&dir).expect("Failed to create variable dir");
        let path = dir.join(filename);
        std::fs::write(&path, content).expect("Failed to write variable file");
        path
    }

    pub fn remove_variable(&self, env: &str, name: &str) {
        std::fs::remove_file(self.variable_dir(env).join(format!("{}.variable.json", name)))
            .expect("Failed to remove variable file");
    }

    /// Polls until the job is terminal or ten seconds pass.
    pub fn wait_for_job(&self, owner: OwnerId, job_id: &str) -> JobStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = self
                .service
                .get_job_status(owner, job_id)
                .expect("Failed to read job status");
            if status.is_terminal() || Instant::now() > deadline {
                return status;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Turns the repository into a clone of a fresh bare remote with one
    /// commit on `main`. Returns the remote's path.
    pub fn init_git_remote(&self) -> PathBuf {
        let remote = self.temp_path().join("remote.git");
        git(self.temp_path(), &["init", "--bare", "-b", "main", "remote.git"]);
        git(&self.repo_root, &["init", "-b", "main"]);
        git(&self.repo_root, &["config", "user.name", "Setup"]);
        git(&self.repo_root, &["config", "user.email", "setup@example.com"]);
        std::fs::write(self.repo_root.join("README.md"), "config repo\n").unwrap();
        git(&self.repo_root, &["add", "README.md"]);
        git(&self.repo_root, &["commit", "-m", "initial"]);
        git(
            &self.repo_root,
            &["remote", "add", "origin", &remote.to_string_lossy()],
        );
        git(&self.repo_root, &["push", "-u", "origin", "main"]);
        remote
    }
}

/// Runs git in `dir` and panics on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}
