use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::config::schema::Settings;
use crate::config::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/settings-v1.json");

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "ESVSYNC_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

// Conservative subset of git's ref name rules.
static BRANCH_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._/-]+$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsFormat {
    Json,
    Yaml,
}

impl SettingsFormat {
    /// `.yaml` / `.yml` are YAML, everything else JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => SettingsFormat::Yaml,
            _ => SettingsFormat::Json,
        }
    }
}

/// Loads settings from a file, then applies `ESVSYNC_*` overrides.
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut settings = parse_settings(&content, SettingsFormat::from_path(path))?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok())?;
    validate_settings(&settings)?;

    log::info!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Parses and validates settings without consulting the environment.
pub fn load_settings_from_str(
    content: &str,
    format: SettingsFormat,
) -> Result<Settings, ConfigError> {
    let settings = parse_settings(content, format)?;
    validate_settings(&settings)?;
    Ok(settings)
}

fn parse_settings(content: &str, format: SettingsFormat) -> Result<Settings, ConfigError> {
    let value: serde_json::Value = match format {
        SettingsFormat::Json => {
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
        SettingsFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
    };

    validate_schema(&value)?;

    serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn validate_schema(value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if !errors.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: errors.join("; "),
        });
    }

    Ok(())
}

/// Overrides settings from `ESVSYNC_*` variables. `lookup` returns the
/// variable's value, if set.
pub(crate) fn apply_env_overrides<F>(settings: &mut Settings, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |suffix: &str| {
        let name = format!("{}{}", ENV_PREFIX, suffix);
        lookup(&name)
            .filter(|v| !v.trim().is_empty())
            .map(|v| (name, v.trim().to_string()))
    };
    let invalid = |name: String, value: String| ConfigError::InvalidEnvOverride { name, value };

    if let Some((_, value)) = var("CONFIG_REPO_PATH") {
        settings.config_repo_path = PathBuf::from(value);
    }
    if let Some((_, value)) = var("BRANCH_NAME") {
        settings.branch_name = value;
    }
    if let Some((_, value)) = var("DATABASE_PATH") {
        settings.database_path = Some(PathBuf::from(value));
    }
    if let Some((name, value)) = var("WORKER_COUNT") {
        settings.worker_count = value.parse().map_err(|_| invalid(name, value.clone()))?;
    }
    if let Some((_, value)) = var("FRODO_PATH") {
        settings.frodo_path = value;
    }
    if let Some((name, value)) = var("COMMAND_TIMEOUT_SECS") {
        settings.command_timeout_secs =
            Some(value.parse().map_err(|_| invalid(name, value.clone()))?);
    }
    if let Some((_, value)) = var("SECRET_KEY_FILE") {
        settings.secret_key_file = Some(value);
    }
    if let Some((_, value)) = var("LOG_LEVEL") {
        settings.logging.level = value.to_lowercase();
    }
    if let Some((name, value)) = var("LOG_JSON") {
        settings.logging.json = match value.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => return Err(invalid(name, value)),
        };
    }

    Ok(())
}

fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.config_repo_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "configRepoPath must not be empty".to_string(),
        });
    }

    if settings.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "workerCount must be at least 1".to_string(),
        });
    }

    if settings.command_timeout_secs == Some(0) {
        return Err(ConfigError::Validation {
            message: "commandTimeoutSecs must be at least 1".to_string(),
        });
    }

    if !BRANCH_NAME.is_match(&settings.branch_name)
        || settings.branch_name.contains("..")
        || settings.branch_name.starts_with('-')
    {
        return Err(ConfigError::Validation {
            message: format!("Invalid branch name: {}", settings.branch_name),
        });
    }

    if !LOG_LEVELS.contains(&settings.logging.level.as_str()) {
        return Err(ConfigError::Validation {
            message: format!("Unknown log level: {}", settings.logging.level),
        });
    }

    Ok(())
}
