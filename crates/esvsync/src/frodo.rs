//! Typed wrapper around the `frodo` CLI.
//!
//! Data is handed to the CLI through temp files that are removed when the
//! `NamedTempFile` guard drops, including on error paths.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tempfile::NamedTempFile;

use crate::db::environment_repo::EnvironmentRow;
use crate::error::{EsvSyncError, Result};
use crate::esv::{ImportRequest, VariableWriter};
use crate::exec::{CommandExecutor, CommandOutput, CommandSpec};
use crate::sanitize::{mask_secret, redact_path, redact_url};

/// Environment variable the CLI reads its proxy from.
pub const PROXY_ENV_VAR: &str = "HTTPS_PROXY";

pub struct FrodoCli {
    executor: Arc<dyn CommandExecutor>,
    default_frodo_path: String,
    repo_root: PathBuf,
}

impl FrodoCli {
    /// `default_frodo_path` is used for environments without their own
    /// binary; commands run with `repo_root` as working directory.
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        default_frodo_path: impl Into<String>,
        repo_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            default_frodo_path: default_frodo_path.into(),
            repo_root: repo_root.into(),
        }
    }

    fn base_command(&self, env: &EnvironmentRow) -> CommandSpec {
        let program = env
            .frodo_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.default_frodo_path);
        let mut spec = CommandSpec::new(program).current_dir(&self.repo_root);
        if let Some(proxy) = env.proxy.as_deref().filter(|p| !p.is_empty()) {
            spec = spec.env(PROXY_ENV_VAR, proxy);
        }
        spec
    }

    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        log::info!("Running frodo: {}", redact_url(&spec.to_string()));
        let output = self.executor.run(spec)?;
        if !output.stderr.trim().is_empty() {
            log::warn!("frodo stderr: {}", output.stderr.trim());
        }
        Ok(output)
    }

    /// Writes `value` as JSON into a fresh temp file with `suffix`.
    fn temp_json(value: &serde_json::Value, suffix: &str) -> Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("esvsync-")
            .suffix(suffix)
            .tempfile()
            .map_err(|e| EsvSyncError::Io {
                path: std::env::temp_dir(),
                source: e,
            })?;
        serde_json::to_writer(&mut file, value)?;
        file.flush().map_err(|e| EsvSyncError::Io {
            path: file.path().to_path_buf(),
            source: e,
        })?;
        Ok(file)
    }

    /// `frodo config export -sxoAND <dir> <url>`
    pub fn config_export(&self, env: &EnvironmentRow, target_dir: &Path) -> Result<CommandOutput> {
        let spec = self.base_command(env).args([
            "config".to_string(),
            "export".to_string(),
            "-sxoAND".to_string(),
            target_dir.to_string_lossy().into_owned(),
            env.platform_url.clone(),
        ]);
        self.run(&spec)
    }

    /// `frodo conn save --sa-id <id> --sa-jwk-file <tmp> <url>/am`
    pub fn save_connection(&self, env: &EnvironmentRow, jwk: &SecretString) -> Result<CommandOutput> {
        let jwk_value: serde_json::Value = serde_json::from_str(jwk.expose_secret())
            .map_err(|e| EsvSyncError::Validation(format!("Service account JWK is not JSON: {}", e)))?;
        let jwk_file = Self::temp_json(&jwk_value, ".jwk")?;
        log::info!(
            "Saving connection for {} with service account {}",
            env.name,
            mask_secret(&env.service_account_id)
        );
        log::debug!("JWK handed over in {}", redact_path(jwk_file.path()));

        let spec = self.base_command(env).args([
            "conn".to_string(),
            "save".to_string(),
            "--sa-id".to_string(),
            env.service_account_id.clone(),
            "--sa-jwk-file".to_string(),
            jwk_file.path().to_string_lossy().into_owned(),
            format!("{}/am", env.platform_url.trim_end_matches('/')),
        ]);
        self.run(&spec)
    }
}

impl VariableWriter for FrodoCli {
    /// `frodo esv variable import -i <name> -f <file> <url>`
    fn import_variable(&self, env: &EnvironmentRow, request: &ImportRequest) -> Result<()> {
        let payload = json!({
            "variable": {
                &request.name: {
                    "_id": request.name,
                    "description": request.description.clone().unwrap_or_default(),
                    "expressionType": request.expression_type,
                    "value": request.value,
                }
            }
        });
        let file = Self::temp_json(&payload, ".variable.json")?;

        let spec = self.base_command(env).args([
            "esv".to_string(),
            "variable".to_string(),
            "import".to_string(),
            "-i".to_string(),
            request.name.clone(),
            "-f".to_string(),
            file.path().to_string_lossy().into_owned(),
            env.platform_url.clone(),
        ]);
        self.run(&spec)?;
        Ok(())
    }

    /// `frodo esv variable delete -i <name> <url>`
    fn delete_variable(&self, env: &EnvironmentRow, name: &str) -> Result<()> {
        let spec = self.base_command(env).args([
            "esv",
            "variable",
            "delete",
            "-i",
            name,
            env.platform_url.as_str(),
        ]);
        self.run(&spec)?;
        Ok(())
    }

    /// `frodo esv apply -y <url>`
    fn apply(&self, env: &EnvironmentRow) -> Result<()> {
        let spec = self
            .base_command(env)
            .args(["esv", "apply", "-y", env.platform_url.as_str()]);
        self.run(&spec)?;
        Ok(())
    }
}
