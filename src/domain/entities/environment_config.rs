//! Persistent settings: the per-environment config and the global registry
//! of known environments.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::manifest::DEFAULT_REF;
use crate::domain::value_objects::remote_spec::DEFAULT_REMOTE_BASE;

/// Version stamped into every registry record.
pub const REGISTRY_VERSION: &str = "v1";

pub const DEFAULT_SNAPSHOT_BRANCH: &str = "master";

fn default_snapshot_branch() -> String {
    DEFAULT_SNAPSHOT_BRANCH.to_string()
}

fn default_ref() -> String {
    DEFAULT_REF.to_string()
}

fn default_remote_base() -> String {
    DEFAULT_REMOTE_BASE.to_string()
}

/// Contents of `<root>/.repofleet/config.yml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct EnvironmentConfig {
    /// Where frozen manifests are pushed. `None` keeps snapshots local.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1))]
    pub snapshot_remote: Option<String>,

    #[serde(default = "default_snapshot_branch")]
    #[validate(length(min = 1, max = 255))]
    pub snapshot_branch: String,

    /// Tag that can never be deleted.
    #[serde(default = "default_ref")]
    #[validate(length(min = 1, max = 255))]
    pub baseline_tag: String,

    /// Ref recorded for repositories added without one.
    #[serde(default = "default_ref")]
    #[validate(length(min = 1, max = 255))]
    pub default_ref: String,

    /// Prefix used to expand `owner/name` shorthands.
    #[serde(default = "default_remote_base")]
    #[validate(length(min = 1))]
    pub remote_base: String,

    #[serde(default)]
    pub shallow: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, max = 256))]
    pub max_parallel: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1))]
    pub operation_timeout_secs: Option<u64>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            snapshot_remote: None,
            snapshot_branch: default_snapshot_branch(),
            baseline_tag: default_ref(),
            default_ref: default_ref(),
            remote_base: default_remote_base(),
            shallow: false,
            max_parallel: None,
            operation_timeout_secs: None,
        }
    }
}

impl EnvironmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot_remote(mut self, remote: impl Into<String>) -> Self {
        self.snapshot_remote = Some(remote.into());
        self
    }

    pub fn with_shallow(mut self, shallow: bool) -> Self {
        self.shallow = shallow;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    pub fn with_remote_base(mut self, remote_base: impl Into<String>) -> Self {
        self.remote_base = remote_base.into();
        self
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }
}

/// One registered environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub path: PathBuf,
    pub version: String,
}

impl EnvironmentRecord {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            version: REGISTRY_VERSION.to_string(),
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.version == REGISTRY_VERSION
    }
}

/// Contents of `$REPOFLEET_HOME/environments.yml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,

    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentRecord>,
}

impl Registry {
    pub fn get(&self, name: &str) -> Option<&EnvironmentRecord> {
        self.environments.get(name)
    }

    pub fn register(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.environments
            .insert(name.into(), EnvironmentRecord::new(path));
    }

    pub fn remove(&mut self, name: &str) -> Option<EnvironmentRecord> {
        let removed = self.environments.remove(name);
        if self.current.as_deref() == Some(name) {
            self.current = None;
        }
        removed
    }

    /// Drop records whose root no longer exists. Returns the dropped names.
    pub fn cleanup(&mut self) -> Vec<String> {
        let stale: Vec<String> = self
            .environments
            .iter()
            .filter(|(_, record)| !record.path.exists())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            self.remove(name);
        }
        stale
    }

    /// Name of the environment rooted at `path`, if any.
    pub fn name_for_path(&self, path: &std::path::Path) -> Option<&str> {
        self.environments
            .iter()
            .find(|(_, record)| record.path == path)
            .map(|(name, _)| name.as_str())
    }
}
