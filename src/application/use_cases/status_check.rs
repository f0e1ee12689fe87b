use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::domain::entities::repository::Repository;
use crate::domain::value_objects::repo_filter::RepoFilter;

/// Summary state of one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RepositoryState {
    Clean,
    /// Staged, unstaged or untracked changes.
    Dirty,
    Missing,
    /// On a branch other than the manifest ref.
    WrongBranch,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRow {
    pub path: String,
    pub name: String,
    pub expected_ref: String,
    /// `None` when detached or not cloned.
    pub branch: Option<String>,
    pub head: Option<String>,
    pub staged: bool,
    pub unstaged: bool,
    pub untracked: bool,
    pub missing: bool,
    pub error: Option<String>,
}

impl StatusRow {
    fn new(repo: &Repository) -> Self {
        Self {
            path: repo.path().to_string(),
            name: repo.display_name().to_string(),
            expected_ref: repo.reference().to_string(),
            branch: None,
            head: None,
            staged: false,
            unstaged: false,
            untracked: false,
            missing: false,
            error: None,
        }
    }

    pub fn state(&self) -> RepositoryState {
        if self.error.is_some() {
            RepositoryState::Error
        } else if self.missing {
            RepositoryState::Missing
        } else if self.staged || self.unstaged || self.untracked {
            RepositoryState::Dirty
        } else if self
            .branch
            .as_deref()
            .is_some_and(|branch| branch != self.expected_ref)
        {
            RepositoryState::WrongBranch
        } else {
            RepositoryState::Clean
        }
    }

    /// Short `git status`-style change markers: `S`, `M`, `?`.
    pub fn markers(&self) -> String {
        [(self.staged, 'S'), (self.unstaged, 'M'), (self.untracked, '?')]
            .iter()
            .filter_map(|&(set, marker)| set.then_some(marker))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusResult {
    pub rows: Vec<StatusRow>,
    pub clean_count: usize,
    pub dirty_count: usize,
    pub missing_count: usize,
    pub error_count: usize,
}

impl StatusResult {
    pub fn add_row(&mut self, row: StatusRow) {
        match row.state() {
            RepositoryState::Clean => self.clean_count += 1,
            RepositoryState::Missing => self.missing_count += 1,
            RepositoryState::Error => self.error_count += 1,
            RepositoryState::Dirty | RepositoryState::WrongBranch => self.dirty_count += 1,
        }
        self.rows.push(row);
    }

    pub fn has_issues(&self) -> bool {
        self.dirty_count > 0 || self.missing_count > 0 || self.error_count > 0
    }

    pub fn total_count(&self) -> usize {
        self.rows.len()
    }
}

pub struct StatusCheckUseCase {
    filter: RepoFilter,
}

impl StatusCheckUseCase {
    pub fn new(filter: RepoFilter) -> Self {
        Self { filter }
    }

    /// Inspect every selected repository in parallel. Status is local-only,
    /// so no network is touched.
    pub fn execute(&self, repos: Vec<Repository>) -> StatusResult {
        let mut selected = self.filter.select(repos);
        selected.sort_by(|a, b| a.path().cmp(b.path()));

        let rows: Vec<StatusRow> = selected.par_iter_mut().map(inspect).collect();

        let mut result = StatusResult::default();
        for row in rows {
            result.add_row(row);
        }
        result
    }
}

fn inspect(repo: &mut Repository) -> StatusRow {
    let mut row = StatusRow::new(repo);
    if !repo.exists() {
        row.missing = true;
        return row;
    }
    if let Err(e) = repo.ensure_working_tree() {
        row.error = Some(e.to_string());
        return row;
    }
    match repo.status() {
        Ok(status) => {
            row.branch = status.branch;
            row.head = status.head;
            row.staged = status.staged;
            row.unstaged = status.unstaged;
            row.untracked = status.untracked;
        }
        Err(e) => {
            debug!(repo = %repo.display_name(), error = %e, "status failed");
            row.error = Some(e.to_string());
        }
    }
    row
}
