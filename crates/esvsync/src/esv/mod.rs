//! ESV variable synchronization: source reading, diffing and applying.

pub mod apply;
pub mod diff;
pub mod source;
pub mod store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::db::variable_repo::StoredVariable;

pub use apply::{
    Applier, ApplySummary, EnvironmentPullSummary, ImportRequest, PushAction, PushFailure,
    PushSummary, VariableWriter,
};
pub use diff::{diff_lookups, DiffEngine};
pub use source::{FsSourceReader, SourceReader};
pub use store::{VariableCreate, VariableDelete, VariableStore, VariableUpdate, VariableView};

/// Which side is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Repository is authoritative; the database is reconciled.
    Pull,
    /// Database is authoritative; the repository/platform is reconciled.
    Push,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Pull => write!(f, "pull"),
            Direction::Push => write!(f, "push"),
        }
    }
}

/// One variable as defined in the repository for a single environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceVariable {
    pub description: Option<String>,
    pub expression_type: String,
    pub value: String,
}

/// A variable aggregated across environments: global fields plus
/// `environment → value`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VariableState {
    pub description: Option<String>,
    pub expression_type: String,
    pub values: BTreeMap<String, String>,
}

/// `name → state` for one side of a diff.
pub type Lookup = BTreeMap<String, VariableState>;

impl From<StoredVariable> for VariableState {
    fn from(var: StoredVariable) -> Self {
        Self {
            description: var.description,
            expression_type: var.expression_type,
            values: var.values,
        }
    }
}

/// Merges per-environment repository reads into one lookup. Environments
/// must arrive in sorted order: the first environment defining a name sets
/// its description and expression type.
pub fn merge_source<I>(reads: I) -> Lookup
where
    I: IntoIterator<Item = (String, BTreeMap<String, SourceVariable>)>,
{
    let mut lookup = Lookup::new();
    for (env_name, vars) in reads {
        for (name, var) in vars {
            let state = lookup.entry(name).or_insert_with(|| VariableState {
                description: var.description.clone(),
                expression_type: var.expression_type.clone(),
                values: BTreeMap::new(),
            });
            state.values.insert(env_name.clone(), var.value);
        }
    }
    lookup
}

/// A field as reported in a diff: the plain value, or `{old, new}` when it
/// changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldDiff<T> {
    Changed { old: T, new: T },
    Value(T),
}

impl<T> FieldDiff<T> {
    /// The authoritative value.
    pub fn current(&self) -> &T {
        match self {
            FieldDiff::Changed { new, .. } => new,
            FieldDiff::Value(v) => v,
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, FieldDiff::Changed { .. })
    }
}

impl<T: PartialEq> FieldDiff<T> {
    /// `Value(new)` when equal, `Changed` otherwise.
    pub fn compare(old: T, new: T) -> Self {
        if old == new {
            FieldDiff::Value(new)
        } else {
            FieldDiff::Changed { old, new }
        }
    }
}

/// One variable in one bucket, scoped to the environments in `values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEntry {
    pub name: String,
    pub description: FieldDiff<Option<String>>,
    pub expression_type: FieldDiff<String>,
    pub values: BTreeMap<String, FieldDiff<String>>,
}

impl DiffEntry {
    /// An entry with plain fields and plain values.
    pub fn plain(name: &str, state: &VariableState, values: BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            description: FieldDiff::Value(state.description.clone()),
            expression_type: FieldDiff::Value(state.expression_type.clone()),
            values: values
                .into_iter()
                .map(|(env, v)| (env, FieldDiff::Value(v)))
                .collect(),
        }
    }

    /// The authoritative value for `env`, if the entry covers it.
    pub fn value_for(&self, env: &str) -> Option<&str> {
        self.values.get(env).map(|v| v.current().as_str())
    }
}

/// The three buckets of a diff. Each bucket is ordered by variable name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffPlan {
    pub create: Vec<DiffEntry>,
    pub update: Vec<DiffEntry>,
    pub delete: Vec<DiffEntry>,
}

impl DiffPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    /// Restricts every entry to the single environment `env`, dropping
    /// entries that do not touch it.
    pub fn for_environment(&self, env: &str) -> DiffPlan {
        let scope = |bucket: &[DiffEntry]| -> Vec<DiffEntry> {
            bucket
                .iter()
                .filter_map(|entry| {
                    let value = entry.values.get(env)?;
                    Some(DiffEntry {
                        values: BTreeMap::from([(env.to_string(), value.clone())]),
                        ..entry.clone()
                    })
                })
                .collect()
        };
        DiffPlan {
            create: scope(&self.create),
            update: scope(&self.update),
            delete: scope(&self.delete),
        }
    }
}
