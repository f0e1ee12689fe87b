//! VCS seam between the domain and libgit2.
//!
//! [`VcsBackend`] opens or creates working trees, [`VcsHandle`] operates on
//! one. The domain only ever talks to these traits, which keeps the
//! orchestration testable without a network.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::application::services::progress_channel::ProgressSink;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("{} is not a git working tree", .0.display())]
    NotARepository(PathBuf),

    #[error("Reference not found: {0}")]
    RefNotFound(String),

    #[error("Checkout of '{reference}' blocked: {detail}")]
    CheckoutConflict { reference: String, detail: String },

    #[error("Working tree has uncommitted changes")]
    DirtyWorkingTree,

    #[error("Rebase onto '{upstream}' stopped on conflicts")]
    RebaseConflict { upstream: String },

    #[error("Remote not found: {0}")]
    RemoteNotFound(String),

    #[error("{operation} failed: {message}")]
    Remote {
        operation: &'static str,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Git2 error: {0}")]
    Git2(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a fresh clone should be scoped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneRequest {
    /// Branch to clone at. `None` takes the remote's default branch.
    pub reference: Option<String>,
    /// History depth; `None` means full history.
    pub depth: Option<u32>,
}

impl CloneRequest {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn at(reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
            depth: None,
        }
    }

    pub fn with_depth(mut self, depth: Option<u32>) -> Self {
        self.depth = depth;
        self
    }
}

/// Snapshot of a working tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkingTreeStatus {
    /// `None` when HEAD is detached or unborn.
    pub branch: Option<String>,
    pub head: Option<String>,
    pub staged: bool,
    pub unstaged: bool,
    pub untracked: bool,
}

impl WorkingTreeStatus {
    pub fn is_clean(&self) -> bool {
        !self.staged && !self.unstaged && !self.untracked
    }

    /// Tracked modifications only; untracked files never block a rebase.
    pub fn has_tracked_changes(&self) -> bool {
        self.staged || self.unstaged
    }

    pub fn changes(&self) -> (bool, bool, bool) {
        (self.staged, self.unstaged, self.untracked)
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait VcsBackend: Send + Sync {
    fn is_repository(&self, path: &Path) -> bool;

    fn open(&self, path: &Path) -> Result<Box<dyn VcsHandle>, GitError>;

    fn clone_repository(
        &self,
        url: &str,
        dest: &Path,
        request: &CloneRequest,
        progress: &ProgressSink,
    ) -> Result<Box<dyn VcsHandle>, GitError>;

    /// Create an empty repository, optionally wired to an `origin` remote.
    fn init(&self, path: &Path, origin: Option<String>) -> Result<Box<dyn VcsHandle>, GitError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait VcsHandle: Send {
    /// Fetch every branch and tag from `origin`. Local branches are untouched.
    fn fetch(&mut self, progress: &ProgressSink) -> Result<(), GitError>;

    fn current_branch(&self) -> Result<Option<String>, GitError>;

    fn head_commit(&self) -> Result<Option<String>, GitError>;

    fn resolve_commit(&self, reference: &str) -> Result<Option<String>, GitError>;

    /// Whether `reference` names a local branch or `origin/<reference>`.
    fn is_branch(&self, reference: &str) -> Result<bool, GitError>;

    /// Switch to a local branch, a new tracking branch for `origin/<ref>`, or
    /// a detached tag/commit, in that order.
    fn checkout(&mut self, reference: &str, progress: &ProgressSink) -> Result<(), GitError>;

    /// Upstream of the current branch, e.g. `origin/develop`.
    fn upstream(&self) -> Result<Option<String>, GitError>;

    /// Commits reachable from `upstream` but not from HEAD.
    fn missing_from_head(&self, upstream: &str) -> Result<usize, GitError>;

    fn rebase_onto(&mut self, upstream: &str, progress: &ProgressSink) -> Result<(), GitError>;

    /// Commits reachable from HEAD that no remote-tracking ref contains.
    fn unpublished_commits(&self) -> Result<usize, GitError>;

    fn push(&mut self, progress: &ProgressSink) -> Result<(), GitError>;

    fn status(&self) -> Result<WorkingTreeStatus, GitError>;

    fn has_remote(&self) -> bool;

    /// Write `contents` to `relative`, stage it and commit on `branch`.
    /// Returns the new commit hash.
    fn commit_file(
        &mut self,
        branch: &str,
        relative: &Path,
        contents: &[u8],
        message: &str,
    ) -> Result<String, GitError>;

    fn tag_exists(&self, name: &str) -> Result<bool, GitError>;

    fn create_tag(&mut self, name: &str, target: &str, force: bool) -> Result<(), GitError>;

    fn delete_tag(&mut self, name: &str) -> Result<(), GitError>;

    fn list_tags(&self) -> Result<Vec<String>, GitError>;

    fn push_refspecs(
        &mut self,
        refspecs: &[String],
        progress: &ProgressSink,
    ) -> Result<(), GitError>;

    fn reset_hard(&mut self, target: &str) -> Result<(), GitError>;

    /// Blob contents of `relative` at `reference`, `None` if either is absent.
    fn read_file_at(&self, reference: &str, relative: &Path)
        -> Result<Option<Vec<u8>>, GitError>;
}
