//! The service facade the API layer talks to.
//!
//! Every operation takes the caller's profile id and only ever touches rows
//! that profile owns. Long-running operations have a `submit_*` twin that
//! runs them as a background job.

use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ConfigError, Settings};
use crate::db::environment_repo::{self, EnvironmentPatch, EnvironmentRow, NewEnvironment};
use crate::db::user_repo::{self, OwnerId, UserProfileRow};
use crate::db::{Database, DatabaseError};
use crate::error::{EsvSyncError, Result};
use crate::esv::{
    Applier, ApplySummary, DiffPlan, Direction, EnvironmentPullSummary, FsSourceReader,
    PushSummary, SourceReader, VariableCreate, VariableDelete, VariableStore, VariableUpdate,
    VariableView, VariableWriter,
};
use crate::exec::{CommandExecutor, CommandOutput, ProcessExecutor};
use crate::frodo::FrodoCli;
use crate::git::GitRepository;
use crate::jobs::{JobInfo, JobRunner, JobStatus, JobType, TaskExecutor, WorkerPool};
use crate::publish::{PublishReport, Publisher};
use crate::sanitize::redact_url;
use crate::secrets::SecretCipher;

// Environment names become directory names under `configs/`.
static ENVIRONMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").unwrap());

const DEFAULT_EXP_SECONDS: i64 = 899;

fn default_exp_seconds() -> i64 {
    DEFAULT_EXP_SECONDS
}

/// A new environment as submitted by a user. The JWK is plaintext here and
/// encrypted before it is stored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInput {
    pub name: String,
    #[serde(default)]
    pub frodo_path: Option<String>,
    pub platform_url: String,
    pub service_account_id: String,
    #[serde(default)]
    pub service_account_jwk: String,
    #[serde(default = "default_exp_seconds")]
    pub exp_seconds: i64,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub proxy: Option<String>,
}

/// Fields a user may change on an environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentUpdate {
    pub frodo_path: Option<String>,
    pub platform_url: Option<String>,
    pub service_account_id: Option<String>,
    pub service_account_jwk: Option<String>,
    pub exp_seconds: Option<i64>,
    pub scope: Option<String>,
    pub proxy: Option<String>,
}

/// An environment as shown to its owner. Credentials never leave the
/// service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentView {
    pub name: String,
    pub frodo_path: Option<String>,
    pub platform_url: String,
    pub service_account_id: String,
    pub has_service_account_jwk: bool,
    pub exp_seconds: i64,
    pub scope: String,
    pub proxy: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<EnvironmentRow> for EnvironmentView {
    fn from(row: EnvironmentRow) -> Self {
        Self {
            has_service_account_jwk: !row.service_account_jwk.is_empty(),
            proxy: row.proxy.as_deref().map(redact_url),
            name: row.name,
            frodo_path: row.frodo_path,
            platform_url: row.platform_url,
            service_account_id: row.service_account_id,
            exp_seconds: row.exp_seconds,
            scope: row.scope,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub fn validate_environment_name(name: &str) -> Result<()> {
    if ENVIRONMENT_NAME.is_match(name) {
        Ok(())
    } else {
        Err(EsvSyncError::Validation(format!(
            "Invalid environment name '{}': use letters, digits, '-' or '_'",
            name
        )))
    }
}

fn validate_platform_url(url: &str) -> Result<()> {
    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(())
    } else {
        Err(EsvSyncError::Validation(format!(
            "Platform URL must start with http:// or https://: {}",
            redact_url(url)
        )))
    }
}

fn validate_jwk(jwk: &str) -> Result<()> {
    serde_json::from_str::<Value>(jwk)
        .map(|_| ())
        .map_err(|e| EsvSyncError::Validation(format!("Service account JWK is not JSON: {}", e)))
}

pub struct EsvService {
    settings: Settings,
    db: Database,
    frodo: Arc<FrodoCli>,
    git: Arc<GitRepository>,
    store: VariableStore,
    applier: Applier,
    jobs: JobRunner,
    cipher: Option<Arc<SecretCipher>>,
    publish_lock: Arc<Mutex<()>>,
}

impl EsvService {
    /// Wires the service from explicit parts. Credentials cannot be stored
    /// until a cipher is attached with [`EsvService::with_cipher`].
    pub fn new(
        settings: Settings,
        db: Database,
        executor: Arc<dyn CommandExecutor>,
        tasks: Arc<dyn TaskExecutor>,
    ) -> Self {
        let repo_root = settings.config_repo_path.clone();
        let source: Arc<dyn SourceReader> = Arc::new(FsSourceReader::new(&repo_root));
        let frodo = Arc::new(FrodoCli::new(
            Arc::clone(&executor),
            settings.frodo_path.clone(),
            &repo_root,
        ));
        let writer: Arc<dyn VariableWriter> = frodo.clone();

        Self {
            git: Arc::new(GitRepository::new(&repo_root, executor)),
            store: VariableStore::new(db.clone()),
            applier: Applier::new(db.clone(), source, writer),
            jobs: JobRunner::new(db.clone(), tasks),
            frodo,
            db,
            settings,
            cipher: None,
            publish_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_cipher(mut self, cipher: SecretCipher) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    /// Production wiring: file database, real processes, a worker pool and
    /// the configured encryption key.
    pub fn open(settings: Settings) -> Result<Self> {
        let db_path = settings.database_path().ok_or_else(|| ConfigError::Validation {
            message: "No databasePath configured and no home directory found".to_string(),
        })?;
        let db = Database::open(&db_path)?;
        let executor = Arc::new(ProcessExecutor::with_timeout(settings.command_timeout()));
        let pool = Arc::new(WorkerPool::new(settings.worker_count));

        let cipher = SecretCipher::resolve(None, settings.secret_key_file.as_deref());
        let service = Self::new(settings, db, executor, pool);
        Ok(match cipher {
            Ok(cipher) => service.with_cipher(cipher),
            Err(e) => {
                log::warn!("Credential encryption unavailable: {}", e);
                service
            }
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn cipher(&self) -> Result<&SecretCipher> {
        self.cipher.as_deref().ok_or_else(|| {
            EsvSyncError::Validation("No credential encryption key configured".to_string())
        })
    }

    // --- users ---

    /// Returns the caller's profile, provisioning it on first sight.
    /// Deactivated profiles are refused.
    pub fn ensure_provisioned(&self, subject: &str, issuer: &str) -> Result<UserProfileRow> {
        let profile = user_repo::ensure_provisioned(&self.db, subject, issuer)?;
        if !profile.is_active {
            return Err(EsvSyncError::Forbidden(format!(
                "User '{}' is deactivated",
                profile.username
            )));
        }
        Ok(profile)
    }

    pub fn profile(&self, owner: OwnerId) -> Result<UserProfileRow> {
        user_repo::find_profile(&self.db, owner)?
            .ok_or_else(|| EsvSyncError::not_found("user", owner.to_string()))
    }

    pub fn require_admin(profile: &UserProfileRow) -> Result<()> {
        if profile.is_admin() {
            Ok(())
        } else {
            Err(EsvSyncError::Forbidden("Admin role required".to_string()))
        }
    }

    // --- environments ---

    fn environment(&self, owner: OwnerId, name: &str) -> Result<EnvironmentRow> {
        environment_repo::find_by_name(&self.db, owner, name)?
            .ok_or_else(|| EsvSyncError::not_found("environment", name))
    }

    fn encrypt_jwk(&self, jwk: &str) -> Result<String> {
        if jwk.is_empty() {
            return Ok(String::new());
        }
        validate_jwk(jwk)?;
        Ok(self.cipher()?.encrypt(jwk)?)
    }

    fn decrypt_jwk(&self, env: &EnvironmentRow) -> Result<SecretString> {
        if env.service_account_jwk.is_empty() {
            return Err(EsvSyncError::Validation(format!(
                "Environment '{}' has no service account JWK",
                env.name
            )));
        }
        Ok(self.cipher()?.decrypt(&env.service_account_jwk)?)
    }

    pub fn list_environments(&self, owner: OwnerId) -> Result<Vec<EnvironmentView>> {
        Ok(environment_repo::list(&self.db, owner)?
            .into_iter()
            .map(EnvironmentView::from)
            .collect())
    }

    pub fn get_environment(&self, owner: OwnerId, name: &str) -> Result<EnvironmentView> {
        self.environment(owner, name).map(EnvironmentView::from)
    }

    pub fn create_environment(
        &self,
        owner: OwnerId,
        input: EnvironmentInput,
    ) -> Result<EnvironmentView> {
        validate_environment_name(&input.name)?;
        validate_platform_url(&input.platform_url)?;

        let new = NewEnvironment {
            service_account_jwk: self.encrypt_jwk(&input.service_account_jwk)?,
            name: input.name,
            frodo_path: input.frodo_path.filter(|p| !p.is_empty()),
            platform_url: input.platform_url,
            service_account_id: input.service_account_id,
            exp_seconds: input.exp_seconds,
            scope: input.scope,
            proxy: input.proxy.filter(|p| !p.is_empty()),
        };

        match environment_repo::insert(&self.db, owner, &new) {
            Ok(row) => {
                log::info!("Created environment {} for owner {}", row.name, owner);
                Ok(row.into())
            }
            Err(DatabaseError::Constraint(_)) => Err(EsvSyncError::conflict("environment", new.name)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_environment(
        &self,
        owner: OwnerId,
        name: &str,
        update: EnvironmentUpdate,
    ) -> Result<EnvironmentView> {
        if let Some(url) = &update.platform_url {
            validate_platform_url(url)?;
        }
        let patch = EnvironmentPatch {
            service_account_jwk: update
                .service_account_jwk
                .as_deref()
                .map(|jwk| self.encrypt_jwk(jwk))
                .transpose()?,
            frodo_path: update.frodo_path,
            platform_url: update.platform_url,
            service_account_id: update.service_account_id,
            exp_seconds: update.exp_seconds,
            scope: update.scope,
            proxy: update.proxy,
        };
        if patch.is_empty() {
            return Err(EsvSyncError::Validation("No fields to update".to_string()));
        }

        environment_repo::update(&self.db, owner, name, &patch)?
            .map(EnvironmentView::from)
            .ok_or_else(|| EsvSyncError::not_found("environment", name))
    }

    /// Deletes the environment together with every value stored for it.
    /// Variables whose only values lived there go too.
    pub fn delete_environment(&self, owner: OwnerId, name: &str) -> Result<()> {
        if !environment_repo::delete(&self.db, owner, name)? {
            return Err(EsvSyncError::not_found("environment", name));
        }
        log::info!("Deleted environment {} for owner {}", name, owner);
        Ok(())
    }

    /// Registers the environment's service account with the local frodo
    /// connection profile store.
    pub fn save_connection(&self, owner: OwnerId, name: &str) -> Result<CommandOutput> {
        let env = self.environment(owner, name)?;
        let jwk = self.decrypt_jwk(&env)?;
        self.frodo.save_connection(&env, &jwk)
    }

    // --- variables ---

    pub fn list_variables(&self, owner: OwnerId) -> Result<Vec<VariableView>> {
        self.store.list(owner)
    }

    pub fn get_variable(&self, owner: OwnerId, name: &str) -> Result<VariableView> {
        self.store
            .get(owner, name)?
            .ok_or_else(|| EsvSyncError::not_found("variable", name))
    }

    pub fn create_variables(
        &self,
        owner: OwnerId,
        items: &[VariableCreate],
    ) -> Result<Vec<VariableView>> {
        self.store.create(owner, items)
    }

    pub fn update_variables(
        &self,
        owner: OwnerId,
        items: &[VariableUpdate],
    ) -> Result<Vec<VariableView>> {
        self.store.update(owner, items)
    }

    pub fn delete_variables(
        &self,
        owner: OwnerId,
        items: &[VariableDelete],
    ) -> Result<Vec<VariableView>> {
        self.store.delete(owner, items)
    }

    // --- synchronization ---

    pub fn diff(&self, owner: OwnerId, direction: Direction) -> Result<DiffPlan> {
        self.applier.engine().diff(direction, owner)
    }

    pub fn apply_pull(&self, owner: OwnerId) -> Result<ApplySummary> {
        self.applier.apply_pull(owner)
    }

    pub fn apply_push(&self, owner: OwnerId, env_name: &str) -> Result<PushSummary> {
        self.applier.apply_push(owner, env_name)
    }

    pub fn pull_environment(&self, owner: OwnerId, env_name: &str) -> Result<EnvironmentPullSummary> {
        self.applier.pull_environment(owner, env_name)
    }

    /// Exports the environment's live configuration into the repository and
    /// pushes it, committing as the owner.
    pub fn publish(&self, owner: OwnerId, env_name: &str) -> Result<PublishReport> {
        let env = self.environment(owner, env_name)?;
        let (author_name, author_email) = self.commit_author(owner)?;
        Ok(run_publish(
            &self.publish_lock,
            &self.frodo,
            &self.git,
            &self.settings.branch_name,
            &env,
            &author_name,
            &author_email,
        ))
    }

    fn commit_author(&self, owner: OwnerId) -> Result<(String, String)> {
        let profile = self.profile(owner)?;
        let email = profile.email.filter(|e| !e.is_empty()).ok_or_else(|| {
            EsvSyncError::Validation(format!(
                "User '{}' has no email address for commits",
                profile.username
            ))
        })?;
        Ok((profile.username, email))
    }

    // --- background jobs ---

    pub fn submit_pull(&self, owner: OwnerId) -> Result<String> {
        let applier = self.applier.clone();
        self.jobs.submit(JobType::ApplyPull, owner, move || {
            applier
                .apply_pull(owner)
                .and_then(|summary| Ok(serde_json::to_value(summary)?))
        })
    }

    /// Queues a push. An unknown environment is reported right away.
    pub fn submit_push(&self, owner: OwnerId, env_name: &str) -> Result<String> {
        self.environment(owner, env_name)?;
        let applier = self.applier.clone();
        let env_name = env_name.to_string();
        self.jobs.submit(JobType::ApplyPush, owner, move || {
            applier
                .apply_push(owner, &env_name)
                .and_then(|summary| Ok(serde_json::to_value(summary)?))
        })
    }

    /// Queues a publish. The job fails when any publish step fails.
    pub fn submit_publish(&self, owner: OwnerId, env_name: &str) -> Result<String> {
        let env = self.environment(owner, env_name)?;
        let (author_name, author_email) = self.commit_author(owner)?;
        let lock = Arc::clone(&self.publish_lock);
        let frodo = Arc::clone(&self.frodo);
        let git = Arc::clone(&self.git);
        let branch = self.settings.branch_name.clone();

        self.jobs.submit(JobType::Publish, owner, move || {
            let report = run_publish(&lock, &frodo, &git, &branch, &env, &author_name, &author_email);
            if report.succeeded() {
                serde_json::to_value(&report).map_err(|e| e.to_string())
            } else {
                Err(report.detail())
            }
        })
    }

    pub fn get_job(&self, owner: OwnerId, job_id: &str) -> Result<JobInfo> {
        self.jobs.get_job(owner, job_id)
    }

    pub fn get_job_status(&self, owner: OwnerId, job_id: &str) -> Result<JobStatus> {
        self.jobs.get_status(owner, job_id)
    }

    pub fn get_job_result(&self, owner: OwnerId, job_id: &str) -> Result<Option<Value>> {
        self.jobs.get_result(owner, job_id)
    }

    pub fn list_jobs(&self, owner: OwnerId) -> Result<Vec<JobInfo>> {
        self.jobs.list_jobs(owner)
    }
}

/// One publish at a time: they all share the same working tree.
fn run_publish(
    lock: &Mutex<()>,
    frodo: &FrodoCli,
    git: &GitRepository,
    branch_name: &str,
    env: &EnvironmentRow,
    author_name: &str,
    author_email: &str,
) -> PublishReport {
    let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
    Publisher {
        frodo,
        git,
        branch_name,
    }
    .publish(env, author_name, author_email)
}
