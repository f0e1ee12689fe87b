use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::error::FleetError;
use crate::common::result::FleetResult;

/// Ref recorded when none is given.
pub const DEFAULT_REF: &str = "develop";

fn default_ref() -> String {
    DEFAULT_REF.to_string()
}

/// One manifest entry: what to clone and which ref to hold it at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoEntry {
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "ref", default = "default_ref")]
    pub reference: String,

    /// `owner/name` shorthand or any fetchable URL.
    pub repo: String,
}

impl RepoEntry {
    pub fn new(repo: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            name: None,
            reference: reference.into(),
            repo: repo.into(),
        }
    }
}

/// Mapping from local repository path to [`RepoEntry`].
///
/// Keys are kept sorted so the serialized form is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    repos: BTreeMap<String, RepoEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> FleetResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            FleetError::manifest_parse_with_source(format!("invalid manifest JSON: {e}"), None, e)
        })
    }

    /// Canonical JSON: sorted keys, two-space indent, trailing newline.
    pub fn freeze(&self) -> String {
        let mut json = match serde_json::to_string_pretty(self) {
            Ok(json) => json,
            // Only string keys and plain values; serialization cannot fail.
            Err(_) => String::from("{}"),
        };
        json.push('\n');
        json
    }

    /// Union with `other`; on key collision `other` wins.
    pub fn merge(&mut self, other: &Manifest) {
        for (path, entry) in &other.repos {
            self.repos.insert(path.clone(), entry.clone());
        }
    }

    /// Insert or replace the entry at `path`.
    pub fn add(
        &mut self,
        path: impl Into<String>,
        repo: impl Into<String>,
        reference: Option<&str>,
    ) -> &RepoEntry {
        let path = path.into();
        let entry = RepoEntry::new(repo, reference.unwrap_or(DEFAULT_REF));
        self.repos.insert(path.clone(), entry);
        &self.repos[&path]
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: RepoEntry) {
        self.repos.insert(path.into(), entry);
    }

    pub fn remove(&mut self, path: &str) -> Option<RepoEntry> {
        self.repos.remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&RepoEntry> {
        self.repos.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut RepoEntry> {
        self.repos.get_mut(path)
    }

    pub fn repos(&self) -> impl Iterator<Item = (&str, &RepoEntry)> {
        self.repos.iter().map(|(path, entry)| (path.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }
}
