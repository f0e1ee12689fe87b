use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::manifest::RepoEntry;
use crate::application::services::progress_channel::ProgressSink;
use crate::common::error::FleetError;
use crate::common::result::{FleetResult, OptionExt, ResultExt};
use crate::domain::value_objects::remote_spec::RemoteSpec;
use crate::infrastructure::git::backend::{
    CloneRequest, GitError, VcsBackend, VcsHandle, WorkingTreeStatus,
};

/// What `merge_from_remote` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Detached HEAD or no tracking branch.
    NoUpstream,
    UpToDate,
    Rebased { incoming: usize },
}

/// One manifest entry bound to its working tree.
pub struct Repository {
    path: String,
    abs_path: PathBuf,
    display_name: Option<String>,
    remote: RemoteSpec,
    reference: String,
    backend: Arc<dyn VcsBackend>,
    handle: Option<Box<dyn VcsHandle>>,
    progress: ProgressSink,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("path", &self.path)
            .field("abs_path", &self.abs_path)
            .field("name", &self.remote.name())
            .field("url", &self.remote.url())
            .field("reference", &self.reference)
            .field("bound", &self.handle.is_some())
            .finish()
    }
}

impl Repository {
    pub fn new(
        path: impl Into<String>,
        srcroot: &Path,
        remote: RemoteSpec,
        reference: impl Into<String>,
        backend: Arc<dyn VcsBackend>,
    ) -> Self {
        let path = path.into();
        Self {
            abs_path: srcroot.join(&path),
            path,
            display_name: None,
            remote,
            reference: reference.into(),
            backend,
            handle: None,
            progress: ProgressSink::disabled(),
        }
    }

    pub fn from_entry(
        path: &str,
        entry: &RepoEntry,
        srcroot: &Path,
        remote_base: &str,
        backend: Arc<dyn VcsBackend>,
    ) -> FleetResult<Self> {
        let remote = RemoteSpec::parse(&entry.repo, remote_base)
            .map_err(|e| FleetError::validation_error("repo", e.to_string(), Some(entry.repo.clone())))?;
        let mut repo = Self::new(path, srcroot, remote, entry.reference.clone(), backend);
        repo.display_name = entry.name.clone();
        Ok(repo)
    }

    pub fn set_progress(&mut self, progress: ProgressSink) {
        self.progress = progress;
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn abs_path(&self) -> &Path {
        &self.abs_path
    }

    /// Canonical remote identity, e.g. `github.com/acme/core`.
    pub fn name(&self) -> &str {
        self.remote.name()
    }

    /// Manifest display name, falling back to the canonical name.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or_else(|| self.remote.name())
    }

    pub fn url(&self) -> &str {
        self.remote.url()
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Nesting depth of the manifest path, used for display ordering.
    pub fn depth(&self) -> usize {
        self.path.matches('/').count()
    }

    pub fn exists(&self) -> bool {
        fs::symlink_metadata(&self.abs_path).is_ok()
    }

    pub fn is_cloned(&self) -> bool {
        self.handle.is_some() || self.backend.is_repository(&self.abs_path)
    }

    fn vcs_error(&self, error: GitError) -> FleetError {
        FleetError::from_git(self.display_name(), error)
    }

    fn handle(&mut self) -> FleetResult<&mut Box<dyn VcsHandle>> {
        if self.handle.is_none() {
            if !self.exists() {
                return Err(FleetError::git_error(
                    format!("{} has not been cloned yet", self.abs_path.display()),
                    Some(self.display_name().to_string()),
                ));
            }
            let handle = self
                .backend
                .open(&self.abs_path)
                .map_err(|e| self.vcs_error(e))?;
            self.handle = Some(handle);
        }
        self.handle.as_mut().ok_or_internal_error("VCS handle not bound")
    }

    fn remove_partial_clone(&self) {
        if let Err(e) = fs::remove_dir_all(&self.abs_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(repo = %self.display_name(), error = %e, "could not remove partial clone");
            }
        }
    }

    /// Clone into the target path, refusing to touch anything already there.
    pub fn clone(&mut self, shallow: bool) -> FleetResult<()> {
        if self.exists() {
            return Err(FleetError::path_occupied(&self.abs_path));
        }
        if let Some(parent) = self.abs_path.parent() {
            fs::create_dir_all(parent).with_filesystem_error(
                "Failed to create parent directory",
                Some(parent.to_path_buf()),
            )?;
        }

        let depth = shallow.then_some(1);
        let request = CloneRequest::at(self.reference.clone()).with_depth(depth);
        let progress = self.progress.clone();

        match self
            .backend
            .clone_repository(self.remote.url(), &self.abs_path, &request, &progress)
        {
            Ok(handle) => {
                self.handle = Some(handle);
                info!(repo = %self.display_name(), reference = %self.reference, "cloned");
                Ok(())
            }
            Err(GitError::Cancelled) => {
                self.remove_partial_clone();
                Err(FleetError::Cancelled)
            }
            Err(error) => {
                debug!(
                    repo = %self.display_name(),
                    %error,
                    "ref-scoped clone rejected, falling back to full clone"
                );
                self.remove_partial_clone();
                match self.backend.clone_repository(
                    self.remote.url(),
                    &self.abs_path,
                    &CloneRequest::full(),
                    &progress,
                ) {
                    Ok(handle) => self.handle = Some(handle),
                    Err(error) => {
                        self.remove_partial_clone();
                        return Err(self.vcs_error(error));
                    }
                }
                let reference = self.reference.clone();
                self.checkout(&reference)?;
                info!(repo = %self.display_name(), %reference, "cloned (full history)");
                Ok(())
            }
        }
    }

    pub fn fetch(&mut self) -> FleetResult<()> {
        let progress = self.progress.clone();
        let result = self.handle()?.fetch(&progress);
        result.map_err(|e| self.vcs_error(e))
    }

    /// Returns `false` when already at `reference`.
    pub fn checkout(&mut self, reference: &str) -> FleetResult<bool> {
        let progress = self.progress.clone();
        let handle = self.handle()?;
        let result = checkout_if_needed(handle.as_mut(), reference, &progress);
        result.map_err(|e| self.vcs_error(e))
    }

    /// Rebase local work onto the upstream of the current branch.
    pub fn merge_from_remote(&mut self) -> FleetResult<MergeOutcome> {
        let progress = self.progress.clone();
        let handle = self.handle()?;
        let result = rebase_if_behind(handle.as_mut(), &progress);
        result.map_err(|e| self.vcs_error(e))
    }

    /// Push the current branch when it carries unpublished commits.
    /// Returns whether anything was pushed.
    pub fn push(&mut self) -> FleetResult<bool> {
        let progress = self.progress.clone();
        let handle = self.handle()?;
        let result = push_if_ahead(handle.as_mut(), &progress);
        result.map_err(|e| self.vcs_error(e))
    }

    pub fn status(&mut self) -> FleetResult<WorkingTreeStatus> {
        let result = self.handle()?.status();
        result.map_err(|e| self.vcs_error(e))
    }

    /// `(staged, unstaged, untracked)`
    pub fn changes(&mut self) -> FleetResult<(bool, bool, bool)> {
        Ok(self.status()?.changes())
    }

    pub fn head_commit(&mut self) -> FleetResult<Option<String>> {
        let result = self.handle()?.head_commit();
        result.map_err(|e| self.vcs_error(e))
    }

    /// Refuse to operate on a path that exists but is not a working tree.
    pub fn ensure_working_tree(&self) -> FleetResult<()> {
        if self.exists() && !self.is_cloned() {
            return Err(FleetError::not_a_git_repository(&self.abs_path));
        }
        Ok(())
    }
}

fn checkout_if_needed(
    handle: &mut dyn VcsHandle,
    reference: &str,
    progress: &ProgressSink,
) -> Result<bool, GitError> {
    match handle.current_branch()? {
        Some(branch) if branch == reference => return Ok(false),
        Some(_) => {}
        // Detached at the same commit is a no-op only for tags and hashes.
        None if !handle.is_branch(reference)? => {
            let head = handle.head_commit()?;
            if head.is_some() && head == handle.resolve_commit(reference)? {
                return Ok(false);
            }
        }
        None => {}
    }
    handle.checkout(reference, progress)?;
    Ok(true)
}

fn rebase_if_behind(
    handle: &mut dyn VcsHandle,
    progress: &ProgressSink,
) -> Result<MergeOutcome, GitError> {
    let Some(upstream) = handle.upstream()? else {
        return Ok(MergeOutcome::NoUpstream);
    };
    let incoming = handle.missing_from_head(&upstream)?;
    if incoming == 0 {
        return Ok(MergeOutcome::UpToDate);
    }
    if handle.status()?.has_tracked_changes() {
        return Err(GitError::DirtyWorkingTree);
    }
    handle.rebase_onto(&upstream, progress)?;
    Ok(MergeOutcome::Rebased { incoming })
}

fn push_if_ahead(handle: &mut dyn VcsHandle, progress: &ProgressSink) -> Result<bool, GitError> {
    // A detached HEAD has nothing to publish to.
    if handle.current_branch()?.is_none() || handle.unpublished_commits()? == 0 {
        return Ok(false);
    }
    handle.push(progress)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::git::backend::{MockVcsBackend, MockVcsHandle};
    use tempfile::TempDir;

    fn spec() -> RemoteSpec {
        RemoteSpec::parse("acme/core", "git@github.com:").unwrap()
    }

    fn cloned_repo(temp_dir: &TempDir, handle: MockVcsHandle) -> Repository {
        std::fs::create_dir_all(temp_dir.path().join("core")).unwrap();
        let mut backend = MockVcsBackend::new();
        let mut handle = Some(handle);
        backend
            .expect_open()
            .times(1)
            .returning(move |_| Ok(Box::new(handle.take().unwrap()) as Box<dyn VcsHandle>));
        backend.expect_is_repository().return_const(true);
        Repository::new("core", temp_dir.path(), spec(), "develop", Arc::new(backend))
    }

    #[test]
    fn test_clone_refuses_occupied_path() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("core"), "stray file").unwrap();

        let mut backend = MockVcsBackend::new();
        backend.expect_clone_repository().times(0);
        let mut repo = Repository::new("core", temp_dir.path(), spec(), "develop", Arc::new(backend));

        let result = repo.clone(false);
        assert!(matches!(result, Err(FleetError::PathOccupied { .. })));
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("core")).unwrap(),
            "stray file"
        );
    }

    #[test]
    fn test_clone_falls_back_to_full_clone_then_checks_out() {
        let temp_dir = TempDir::new().unwrap();
        let mut backend = MockVcsBackend::new();
        let mut sequence = mockall::Sequence::new();

        backend
            .expect_clone_repository()
            .withf(|_, _, request, _| request.reference.as_deref() == Some("v1.2.0"))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, dest, _, _| {
                std::fs::create_dir_all(dest).unwrap();
                Err(GitError::RefNotFound("v1.2.0".to_string()))
            });
        backend
            .expect_clone_repository()
            .withf(|_, _, request, _| request.reference.is_none())
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _, _| {
                let mut handle = MockVcsHandle::new();
                handle.expect_current_branch().returning(|| Ok(Some("main".to_string())));
                handle.expect_head_commit().returning(|| Ok(Some("f00d".repeat(10))));
                handle
                    .expect_checkout()
                    .withf(|reference, _| reference == "v1.2.0")
                    .times(1)
                    .returning(|_, _| Ok(()));
                Ok(Box::new(handle) as Box<dyn VcsHandle>)
            });

        let mut repo = Repository::new("core", temp_dir.path(), spec(), "v1.2.0", Arc::new(backend));
        repo.clone(true).unwrap();
    }

    #[test]
    fn test_clone_cancelled_removes_partial_directory() {
        let temp_dir = TempDir::new().unwrap();
        let mut backend = MockVcsBackend::new();
        backend
            .expect_clone_repository()
            .times(1)
            .returning(|_, dest, _, _| {
                std::fs::create_dir_all(dest.join(".git")).unwrap();
                Err(GitError::Cancelled)
            });

        let mut repo = Repository::new("core", temp_dir.path(), spec(), "develop", Arc::new(backend));
        assert!(matches!(repo.clone(false), Err(FleetError::Cancelled)));
        assert!(!temp_dir.path().join("core").exists());
    }

    #[test]
    fn test_checkout_is_noop_on_current_branch() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = MockVcsHandle::new();
        handle
            .expect_current_branch()
            .returning(|| Ok(Some("develop".to_string())));
        handle.expect_checkout().times(0);

        let mut repo = cloned_repo(&temp_dir, handle);
        assert!(!repo.checkout("develop").unwrap());
    }

    #[test]
    fn test_checkout_is_noop_when_detached_at_tag() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = MockVcsHandle::new();
        handle.expect_current_branch().returning(|| Ok(None));
        handle.expect_is_branch().returning(|_| Ok(false));
        handle.expect_head_commit().returning(|| Ok(Some("ab".repeat(20))));
        handle
            .expect_resolve_commit()
            .returning(|_| Ok(Some("ab".repeat(20))));
        handle.expect_checkout().times(0);

        let mut repo = cloned_repo(&temp_dir, handle);
        assert!(!repo.checkout("v1.0.0").unwrap());
    }

    #[test]
    fn test_checkout_reattaches_branch_at_detached_commit() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = MockVcsHandle::new();
        handle.expect_current_branch().returning(|| Ok(None));
        handle
            .expect_is_branch()
            .withf(|reference| reference == "develop")
            .returning(|_| Ok(true));
        handle.expect_head_commit().returning(|| Ok(Some("ab".repeat(20))));
        handle
            .expect_resolve_commit()
            .returning(|_| Ok(Some("ab".repeat(20))));
        handle
            .expect_checkout()
            .withf(|reference, _| reference == "develop")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut repo = cloned_repo(&temp_dir, handle);
        assert!(repo.checkout("develop").unwrap());
    }

    #[test]
    fn test_merge_skips_rebase_when_up_to_date() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = MockVcsHandle::new();
        handle
            .expect_upstream()
            .returning(|| Ok(Some("origin/develop".to_string())));
        handle.expect_missing_from_head().returning(|_| Ok(0));
        handle.expect_rebase_onto().times(0);

        let mut repo = cloned_repo(&temp_dir, handle);
        assert_eq!(repo.merge_from_remote().unwrap(), MergeOutcome::UpToDate);
    }

    #[test]
    fn test_merge_without_upstream_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = MockVcsHandle::new();
        handle.expect_upstream().returning(|| Ok(None));
        handle.expect_missing_from_head().times(0);
        handle.expect_rebase_onto().times(0);

        let mut repo = cloned_repo(&temp_dir, handle);
        assert_eq!(repo.merge_from_remote().unwrap(), MergeOutcome::NoUpstream);
    }

    #[test]
    fn test_merge_refuses_dirty_tree() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = MockVcsHandle::new();
        handle
            .expect_upstream()
            .returning(|| Ok(Some("origin/develop".to_string())));
        handle.expect_missing_from_head().returning(|_| Ok(2));
        handle.expect_status().returning(|| {
            Ok(WorkingTreeStatus {
                unstaged: true,
                ..WorkingTreeStatus::default()
            })
        });
        handle.expect_rebase_onto().times(0);

        let mut repo = cloned_repo(&temp_dir, handle);
        assert!(matches!(
            repo.merge_from_remote(),
            Err(FleetError::DirtyWorkingTree { .. })
        ));
    }

    #[test]
    fn test_merge_rebases_incoming_commits() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = MockVcsHandle::new();
        handle
            .expect_upstream()
            .returning(|| Ok(Some("origin/develop".to_string())));
        handle.expect_missing_from_head().returning(|_| Ok(3));
        handle
            .expect_status()
            .returning(|| Ok(WorkingTreeStatus::default()));
        handle
            .expect_rebase_onto()
            .withf(|upstream, _| upstream == "origin/develop")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut repo = cloned_repo(&temp_dir, handle);
        assert_eq!(
            repo.merge_from_remote().unwrap(),
            MergeOutcome::Rebased { incoming: 3 }
        );
    }

    #[test]
    fn test_push_skipped_when_nothing_unpublished() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = MockVcsHandle::new();
        handle
            .expect_current_branch()
            .returning(|| Ok(Some("develop".to_string())));
        handle.expect_unpublished_commits().returning(|| Ok(0));
        handle.expect_push().times(0);

        let mut repo = cloned_repo(&temp_dir, handle);
        assert!(!repo.push().unwrap());
    }

    #[test]
    fn test_push_when_commits_unpublished() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = MockVcsHandle::new();
        handle
            .expect_current_branch()
            .returning(|| Ok(Some("develop".to_string())));
        handle.expect_unpublished_commits().returning(|| Ok(2));
        handle.expect_push().times(1).returning(|_| Ok(()));

        let mut repo = cloned_repo(&temp_dir, handle);
        assert!(repo.push().unwrap());
    }

    #[test]
    fn test_ensure_working_tree_flags_plain_directory() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("core")).unwrap();
        let mut backend = MockVcsBackend::new();
        backend.expect_is_repository().return_const(false);

        let repo = Repository::new("core", temp_dir.path(), spec(), "develop", Arc::new(backend));
        assert!(matches!(
            repo.ensure_working_tree(),
            Err(FleetError::NotAGitRepository { .. })
        ));
    }

    #[test]
    fn test_depth_counts_path_separators() {
        let temp_dir = TempDir::new().unwrap();
        let backend: Arc<dyn VcsBackend> = Arc::new(MockVcsBackend::new());
        let shallow = Repository::new("core", temp_dir.path(), spec(), "develop", backend.clone());
        let nested = Repository::new("libs/net/http", temp_dir.path(), spec(), "develop", backend);
        assert_eq!(shallow.depth(), 0);
        assert_eq!(nested.depth(), 2);
    }
}
