use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::common::error::FleetError;
use crate::common::result::FleetResult;
use crate::domain::entities::repository::Repository;

/// Which repositories to keep based on their presence on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClonedSelector {
    #[default]
    Any,
    Cloned,
    Missing,
}

/// Selection of repositories for a batch.
///
/// Patterns are case-insensitive regexes tried against both the canonical
/// name and the manifest path; no patterns selects everything.
#[derive(Debug, Clone, Default)]
pub struct RepoFilter {
    patterns: Vec<Regex>,
    changed_only: bool,
    cloned: ClonedSelector,
}

impl RepoFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new<S: AsRef<str>>(patterns: &[S]) -> FleetResult<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        FleetError::validation_error("pattern", e.to_string(), Some(pattern.to_string()))
                    })
            })
            .collect::<FleetResult<Vec<_>>>()?;
        Ok(Self {
            patterns,
            ..Self::default()
        })
    }

    /// Keep only repositories with staged, unstaged or untracked changes.
    pub fn changed_only(mut self, changed_only: bool) -> Self {
        self.changed_only = changed_only;
        self
    }

    pub fn with_cloned(mut self, cloned: ClonedSelector) -> Self {
        self.cloned = cloned;
        self
    }

    pub fn matches_identity(&self, name: &str, path: &str) -> bool {
        self.patterns.is_empty()
            || self
                .patterns
                .iter()
                .any(|re| re.is_match(name) || re.is_match(path))
    }

    pub fn matches(&self, repo: &mut Repository) -> bool {
        if !self.matches_identity(repo.name(), repo.path()) {
            return false;
        }
        let wanted = match self.cloned {
            ClonedSelector::Any => true,
            ClonedSelector::Cloned => repo.is_cloned(),
            ClonedSelector::Missing => !repo.exists(),
        };
        if !wanted {
            return false;
        }
        if self.changed_only {
            return match repo.changes() {
                Ok((staged, unstaged, untracked)) => staged || unstaged || untracked,
                Err(e) => {
                    debug!(repo = %repo.display_name(), error = %e, "no status, skipping");
                    false
                }
            };
        }
        true
    }

    pub fn select(&self, repos: Vec<Repository>) -> Vec<Repository> {
        repos
            .into_iter()
            .filter_map(|mut repo| self.matches(&mut repo).then_some(repo))
            .collect()
    }
}
