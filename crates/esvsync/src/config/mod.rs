pub mod loader;
pub mod schema;

pub use loader::{load_settings, load_settings_from_str, SettingsFormat, ENV_PREFIX};
pub use schema::{LoggingSettings, Settings};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Parse(String),

    #[error("Settings do not match schema: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid settings: {message}")]
    Validation { message: String },

    #[error("Invalid value '{value}' for environment variable {name}")]
    InvalidEnvOverride { name: String, value: String },
}
