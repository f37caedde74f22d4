//! Reading ESV variables from the configuration repository.
//!
//! Layout: `<repo>/configs/<ENV>/global/variable/*.variable.json`, each file
//! holding `{"variable": {"<name>": {description, expressionType, value}}}`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use walkdir::WalkDir;

use super::SourceVariable;
use crate::error::{EsvSyncError, Result};

const VARIABLE_SUFFIX: &str = ".variable.json";

/// Read-only access to the variables an environment defines in the repository.
pub trait SourceReader: Send + Sync {
    /// Returns `name → variable` for `environment`. Fails with
    /// `SourceNotFound` when the environment's variable folder is missing.
    fn read(&self, environment: &str) -> Result<BTreeMap<String, SourceVariable>>;
}

#[derive(Debug, Default, Deserialize)]
struct VariableFile {
    #[serde(default)]
    variable: BTreeMap<String, VariableFileEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariableFileEntry {
    #[serde(default)]
    description: String,
    #[serde(default = "default_expression_type")]
    expression_type: String,
    #[serde(default)]
    value: String,
}

fn default_expression_type() -> String {
    "string".to_string()
}

/// Reads variable files from a checked-out configuration repository.
#[derive(Debug, Clone)]
pub struct FsSourceReader {
    repo_root: PathBuf,
}

impl FsSourceReader {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// `<repo>/configs/<ENV>/global/variable`
    pub fn variable_dir(&self, environment: &str) -> PathBuf {
        self.repo_root
            .join("configs")
            .join(environment)
            .join("global")
            .join("variable")
    }

    fn read_file(path: &Path) -> Result<Option<VariableFile>> {
        let content = fs::read_to_string(path).map_err(|e| EsvSyncError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        match serde_json::from_str::<VariableFile>(&content) {
            Ok(file) => Ok(Some(file)),
            Err(e) => {
                log::warn!(
                    "Variable file is empty or invalid JSON, skipping {}: {}",
                    path.display(),
                    e
                );
                Ok(None)
            }
        }
    }
}

impl SourceReader for FsSourceReader {
    fn read(&self, environment: &str) -> Result<BTreeMap<String, SourceVariable>> {
        let dir = self.variable_dir(environment);
        if !dir.is_dir() {
            log::error!("Variable folder does not exist: {}", dir.display());
            return Err(EsvSyncError::SourceNotFound {
                environment: environment.to_string(),
                path: dir,
            });
        }

        let mut variables = BTreeMap::new();

        // Sorted so a name defined in two files resolves the same way every time.
        let walker = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.map_err(|e| EsvSyncError::Io {
                path: dir.clone(),
                source: e.into(),
            })?;
            let is_variable_file = entry.file_type().is_file()
                && entry.file_name().to_string_lossy().ends_with(VARIABLE_SUFFIX);
            if !is_variable_file {
                continue;
            }

            let Some(file) = Self::read_file(entry.path())? else {
                continue;
            };
            if file.variable.is_empty() {
                log::warn!("No variables found in file: {}", entry.path().display());
                continue;
            }

            for (name, var) in file.variable {
                variables.insert(
                    name,
                    SourceVariable {
                        description: Some(var.description),
                        expression_type: var.expression_type,
                        value: var.value,
                    },
                );
            }
        }

        log::debug!(
            "Read {} variables for environment {}",
            variables.len(),
            environment
        );
        Ok(variables)
    }
}
