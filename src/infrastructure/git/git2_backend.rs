use std::fs;
use std::path::{Path, PathBuf};

use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    AutotagOption, BranchType, Commit, Cred, CredentialType, ErrorCode, FetchOptions,
    PushOptions, RebaseOptions, RemoteCallbacks, Repository as Git2Repository, ResetType,
    Signature, Status, StatusOptions,
};
use tracing::debug;

use super::backend::{CloneRequest, GitError, VcsBackend, VcsHandle, WorkingTreeStatus};
use crate::application::services::progress_channel::{ProgressOp, ProgressSink};

const ORIGIN: &str = "origin";
const BRANCH_REFSPEC: &str = "+refs/heads/*:refs/remotes/origin/*";
const TAG_REFSPEC: &str = "+refs/tags/*:refs/tags/*";
const MAX_CREDENTIAL_ATTEMPTS: u32 = 3;

/// [`VcsBackend`] backed by libgit2.
#[derive(Debug, Default, Clone, Copy)]
pub struct Git2Backend;

impl Git2Backend {
    pub fn new() -> Self {
        Self
    }
}

impl VcsBackend for Git2Backend {
    fn is_repository(&self, path: &Path) -> bool {
        Git2Repository::open(path)
            .map(|repo| !repo.is_bare())
            .unwrap_or(false)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn VcsHandle>, GitError> {
        let repo =
            Git2Repository::open(path).map_err(|_| GitError::NotARepository(path.to_path_buf()))?;
        Ok(Box::new(Git2Handle::new(repo, path)))
    }

    fn clone_repository(
        &self,
        url: &str,
        dest: &Path,
        request: &CloneRequest,
        progress: &ProgressSink,
    ) -> Result<Box<dyn VcsHandle>, GitError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(remote_callbacks(progress));
        fetch_options.download_tags(AutotagOption::All);
        if let Some(depth) = request.depth {
            fetch_options.depth(i32::try_from(depth).unwrap_or(i32::MAX));
        }

        let mut builder = RepoBuilder::new();
        builder
            .fetch_options(fetch_options)
            .with_checkout(checkout_builder(progress));
        if let Some(reference) = &request.reference {
            builder.branch(reference);
        }

        debug!(url, dest = %dest.display(), ?request, "cloning");
        let repo = builder
            .clone(url, dest)
            .map_err(|e| remote_error("clone", e, progress))?;

        Ok(Box::new(Git2Handle::new(repo, dest)))
    }

    fn init(&self, path: &Path, origin: Option<String>) -> Result<Box<dyn VcsHandle>, GitError> {
        fs::create_dir_all(path)?;
        let repo = Git2Repository::init(path)?;
        if let Some(url) = origin {
            repo.remote(ORIGIN, &url)?;
        }
        Ok(Box::new(Git2Handle::new(repo, path)))
    }
}

/// An opened working tree.
pub struct Git2Handle {
    repo: Git2Repository,
    path: PathBuf,
}

impl std::fmt::Debug for Git2Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Git2Handle")
            .field("path", &self.path)
            .field("repo", &"<git2::Repository>")
            .finish()
    }
}

impl Git2Handle {
    fn new(repo: Git2Repository, path: &Path) -> Self {
        Self {
            repo,
            path: path.to_path_buf(),
        }
    }

    fn head_commit_object(&self) -> Result<Option<Commit<'_>>, GitError> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(e) if is_unborn(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn find_commit(&self, reference: &str) -> Result<Option<Commit<'_>>, GitError> {
        let candidates = [
            format!("refs/heads/{reference}"),
            format!("refs/remotes/{ORIGIN}/{reference}"),
            reference.to_string(),
        ];
        for candidate in &candidates {
            match self.repo.revparse_single(candidate) {
                Ok(object) => return Ok(Some(object.peel_to_commit()?)),
                Err(e) if is_missing(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn checkout_commit(
        &self,
        reference: &str,
        commit: &Commit<'_>,
        progress: &ProgressSink,
    ) -> Result<(), GitError> {
        let mut builder = checkout_builder(progress);
        self.repo
            .checkout_tree(commit.as_object(), Some(&mut builder))
            .map_err(|e| checkout_error(reference, e))
    }

    fn switch_to_branch(&self, branch: &str) -> Result<(), GitError> {
        let refname = format!("refs/heads/{branch}");
        match self.repo.head() {
            Ok(head) if head.name() == Some(refname.as_str()) => Ok(()),
            Ok(head) => {
                if self.repo.find_branch(branch, BranchType::Local).is_err() {
                    let commit = head.peel_to_commit()?;
                    self.repo.branch(branch, &commit, false)?;
                }
                let target = self.repo.revparse_single(&refname)?.peel_to_commit()?;
                self.checkout_commit(branch, &target, &ProgressSink::disabled())?;
                self.repo.set_head(&refname)?;
                Ok(())
            }
            Err(e) if is_unborn(&e) => {
                self.repo.set_head(&refname)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn push_to(
        &self,
        remote_name: &str,
        refspecs: &[String],
        progress: &ProgressSink,
    ) -> Result<(), GitError> {
        let mut remote = self
            .repo
            .find_remote(remote_name)
            .map_err(|_| GitError::RemoteNotFound(remote_name.to_string()))?;

        let mut callbacks = remote_callbacks(progress);
        callbacks.push_update_reference(|refname, status| match status {
            Some(message) => Err(git2::Error::from_str(&format!(
                "{refname} rejected: {message}"
            ))),
            None => Ok(()),
        });

        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);

        debug!(path = %self.path.display(), ?refspecs, "pushing");
        remote
            .push(refspecs, Some(&mut options))
            .map_err(|e| remote_error("push", e, progress))
    }
}

impl VcsHandle for Git2Handle {
    fn fetch(&mut self, progress: &ProgressSink) -> Result<(), GitError> {
        let mut remote = self
            .repo
            .find_remote(ORIGIN)
            .map_err(|_| GitError::RemoteNotFound(ORIGIN.to_string()))?;

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(remote_callbacks(progress));
        fetch_options.download_tags(AutotagOption::All);

        remote
            .fetch(&[BRANCH_REFSPEC, TAG_REFSPEC], Some(&mut fetch_options), None)
            .map_err(|e| remote_error("fetch", e, progress))
    }

    fn current_branch(&self) -> Result<Option<String>, GitError> {
        match self.repo.head() {
            Ok(head) if head.is_branch() => Ok(head.shorthand().map(String::from)),
            Ok(_) => Ok(None),
            Err(e) if is_unborn(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn head_commit(&self) -> Result<Option<String>, GitError> {
        Ok(self.head_commit_object()?.map(|c| c.id().to_string()))
    }

    fn resolve_commit(&self, reference: &str) -> Result<Option<String>, GitError> {
        Ok(self.find_commit(reference)?.map(|c| c.id().to_string()))
    }

    fn is_branch(&self, reference: &str) -> Result<bool, GitError> {
        if self.repo.find_branch(reference, BranchType::Local).is_ok() {
            return Ok(true);
        }
        let tracking = format!("{ORIGIN}/{reference}");
        Ok(self.repo.find_branch(&tracking, BranchType::Remote).is_ok())
    }

    fn checkout(&mut self, reference: &str, progress: &ProgressSink) -> Result<(), GitError> {
        if let Ok(branch) = self.repo.find_branch(reference, BranchType::Local) {
            let commit = branch.get().peel_to_commit()?;
            self.checkout_commit(reference, &commit, progress)?;
            self.repo.set_head(&format!("refs/heads/{reference}"))?;
            return Ok(());
        }

        let tracking = format!("{ORIGIN}/{reference}");
        if let Ok(remote_branch) = self.repo.find_branch(&tracking, BranchType::Remote) {
            let commit = remote_branch.get().peel_to_commit()?;
            self.checkout_commit(reference, &commit, progress)?;
            let mut local = self.repo.branch(reference, &commit, false)?;
            local.set_upstream(Some(&tracking))?;
            self.repo.set_head(&format!("refs/heads/{reference}"))?;
            return Ok(());
        }

        let object = self
            .repo
            .revparse_single(reference)
            .map_err(|_| GitError::RefNotFound(reference.to_string()))?;
        let commit = object.peel_to_commit()?;
        self.checkout_commit(reference, &commit, progress)?;
        self.repo.set_head_detached(commit.id())?;
        Ok(())
    }

    fn upstream(&self) -> Result<Option<String>, GitError> {
        let Some(name) = self.current_branch()? else {
            return Ok(None);
        };
        let branch = self.repo.find_branch(&name, BranchType::Local)?;
        match branch.upstream() {
            Ok(upstream) => Ok(upstream.name()?.map(String::from)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn missing_from_head(&self, upstream: &str) -> Result<usize, GitError> {
        let Some(head) = self.head_commit_object()? else {
            return Ok(0);
        };
        let target = self.repo.revparse_single(upstream)?.peel_to_commit()?;
        let (_ahead, behind) = self.repo.graph_ahead_behind(head.id(), target.id())?;
        Ok(behind)
    }

    fn rebase_onto(&mut self, upstream: &str, progress: &ProgressSink) -> Result<(), GitError> {
        let mut head_ref = self.repo.head()?;
        let head_commit = head_ref.peel_to_commit()?;
        let upstream_commit = self.repo.revparse_single(upstream)?.peel_to_commit()?;

        let merge_base = self
            .repo
            .merge_base(head_commit.id(), upstream_commit.id())?;
        if merge_base == head_commit.id() {
            // Nothing local to replay
            self.checkout_commit(upstream, &upstream_commit, progress)?;
            head_ref.set_target(
                upstream_commit.id(),
                &format!("rebase: fast-forward to {upstream}"),
            )?;
            return Ok(());
        }

        let branch = self.repo.reference_to_annotated_commit(&head_ref)?;
        let onto = self.repo.find_annotated_commit(upstream_commit.id())?;
        let signature = signature(&self.repo)?;
        let mut options = RebaseOptions::new();
        let mut rebase = self
            .repo
            .rebase(Some(&branch), Some(&onto), None, Some(&mut options))?;

        let total = rebase.len() as u64;
        let mut applied = 0u64;
        while let Some(operation) = rebase.next() {
            operation?;
            if self.repo.index()?.has_conflicts() {
                return Err(GitError::RebaseConflict {
                    upstream: upstream.to_string(),
                });
            }
            match rebase.commit(None, &signature, None) {
                Ok(_) => {}
                Err(e) if e.code() == ErrorCode::Applied => {
                    debug!(path = %self.path.display(), "patch already upstream, skipping");
                }
                Err(e) => return Err(e.into()),
            }
            applied += 1;
            progress.update(ProgressOp::Checkout, applied, Some(total), "rebasing");
        }
        rebase.finish(Some(&signature))?;
        Ok(())
    }

    fn unpublished_commits(&self) -> Result<usize, GitError> {
        let Some(head) = self.head_commit_object()? else {
            return Ok(0);
        };
        let mut walk = self.repo.revwalk()?;
        walk.push(head.id())?;
        walk.hide_glob("refs/remotes/*")?;

        let mut count = 0;
        for oid in walk {
            oid?;
            count += 1;
        }
        Ok(count)
    }

    fn push(&mut self, progress: &ProgressSink) -> Result<(), GitError> {
        let branch = self
            .current_branch()?
            .ok_or_else(|| GitError::RefNotFound("HEAD is not on a branch".to_string()))?;
        let local_ref = format!("refs/heads/{branch}");

        let remote_name = self
            .repo
            .branch_upstream_remote(&local_ref)
            .ok()
            .and_then(|buf| buf.as_str().map(String::from))
            .unwrap_or_else(|| ORIGIN.to_string());
        let remote_branch = self
            .repo
            .branch_upstream_name(&local_ref)
            .ok()
            .and_then(|buf| buf.as_str().map(String::from))
            .and_then(|name| {
                name.strip_prefix(&format!("refs/remotes/{remote_name}/"))
                    .map(String::from)
            })
            .unwrap_or_else(|| branch.clone());

        let refspec = format!("{local_ref}:refs/heads/{remote_branch}");
        self.push_to(&remote_name, &[refspec], progress)
    }

    fn status(&self) -> Result<WorkingTreeStatus, GitError> {
        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(false)
            .exclude_submodules(true);

        let staged_mask = Status::INDEX_NEW
            | Status::INDEX_MODIFIED
            | Status::INDEX_DELETED
            | Status::INDEX_RENAMED
            | Status::INDEX_TYPECHANGE;
        let unstaged_mask = Status::WT_MODIFIED
            | Status::WT_DELETED
            | Status::WT_RENAMED
            | Status::WT_TYPECHANGE
            | Status::CONFLICTED;

        let mut status = WorkingTreeStatus {
            branch: self.current_branch()?,
            head: self.head_commit()?,
            ..WorkingTreeStatus::default()
        };
        for entry in self.repo.statuses(Some(&mut options))?.iter() {
            let flags = entry.status();
            status.staged |= flags.intersects(staged_mask);
            status.unstaged |= flags.intersects(unstaged_mask);
            status.untracked |= flags.contains(Status::WT_NEW);
        }
        Ok(status)
    }

    fn has_remote(&self) -> bool {
        self.repo.find_remote(ORIGIN).is_ok()
    }

    fn commit_file(
        &mut self,
        branch: &str,
        relative: &Path,
        contents: &[u8],
        message: &str,
    ) -> Result<String, GitError> {
        let workdir = self
            .repo
            .workdir()
            .ok_or_else(|| GitError::NotARepository(self.path.clone()))?
            .to_path_buf();
        self.switch_to_branch(branch)?;

        let target = workdir.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, contents)?;

        let mut index = self.repo.index()?;
        index.add_path(relative)?;
        index.write()?;
        let tree = self.repo.find_tree(index.write_tree()?)?;

        let signature = signature(&self.repo)?;
        let parent = self.head_commit_object()?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        Ok(oid.to_string())
    }

    fn tag_exists(&self, name: &str) -> Result<bool, GitError> {
        match self.repo.find_reference(&format!("refs/tags/{name}")) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn create_tag(&mut self, name: &str, target: &str, force: bool) -> Result<(), GitError> {
        let object = self.repo.revparse_single(target)?;
        self.repo.tag_lightweight(name, &object, force)?;
        Ok(())
    }

    fn delete_tag(&mut self, name: &str) -> Result<(), GitError> {
        self.repo.tag_delete(name).map_err(|e| {
            if e.code() == ErrorCode::NotFound {
                GitError::RefNotFound(name.to_string())
            } else {
                e.into()
            }
        })
    }

    fn list_tags(&self) -> Result<Vec<String>, GitError> {
        let names = self.repo.tag_names(None)?;
        let mut tags: Vec<String> = names.iter().flatten().map(String::from).collect();
        tags.sort();
        Ok(tags)
    }

    fn push_refspecs(
        &mut self,
        refspecs: &[String],
        progress: &ProgressSink,
    ) -> Result<(), GitError> {
        self.push_to(ORIGIN, refspecs, progress)
    }

    fn reset_hard(&mut self, target: &str) -> Result<(), GitError> {
        let object = self.repo.revparse_single(target)?;
        self.repo.reset(&object, ResetType::Hard, None)?;
        Ok(())
    }

    fn read_file_at(
        &self,
        reference: &str,
        relative: &Path,
    ) -> Result<Option<Vec<u8>>, GitError> {
        let object = match self.repo.revparse_single(reference) {
            Ok(object) => object,
            Err(e) if is_missing(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let tree = object.peel_to_tree()?;
        let entry = match tree.get_path(relative) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = entry.to_object(&self.repo)?.peel_to_blob()?;
        Ok(Some(blob.content().to_vec()))
    }
}

fn is_unborn(error: &git2::Error) -> bool {
    matches!(error.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound)
}

fn is_missing(error: &git2::Error) -> bool {
    matches!(
        error.code(),
        ErrorCode::NotFound | ErrorCode::InvalidSpec | ErrorCode::Ambiguous
    )
}

fn signature(repo: &Git2Repository) -> Result<Signature<'static>, GitError> {
    repo.signature()
        .or_else(|_| Signature::now("repofleet", "repofleet@localhost"))
        .map_err(GitError::from)
}

fn checkout_error(reference: &str, error: git2::Error) -> GitError {
    if matches!(error.code(), ErrorCode::Conflict | ErrorCode::Uncommitted) {
        GitError::CheckoutConflict {
            reference: reference.to_string(),
            detail: error.message().to_string(),
        }
    } else {
        error.into()
    }
}

fn remote_error(operation: &'static str, error: git2::Error, progress: &ProgressSink) -> GitError {
    if progress.is_cancelled() || error.code() == ErrorCode::User {
        GitError::Cancelled
    } else {
        GitError::Remote {
            operation,
            message: error.message().to_string(),
        }
    }
}

/// Percentage bucket used to throttle transfer events.
fn bucket(current: usize, total: usize) -> usize {
    if total == 0 {
        current
    } else {
        current * 100 / total
    }
}

fn checkout_builder(progress: &ProgressSink) -> CheckoutBuilder<'_> {
    let mut builder = CheckoutBuilder::new();
    builder.safe();
    let mut last = None;
    builder.progress(move |_path, current, total| {
        let step = bucket(current, total);
        if last != Some(step) {
            last = Some(step);
            progress.update(
                ProgressOp::Checkout,
                current as u64,
                Some(total as u64),
                "",
            );
        }
    });
    builder
}

fn remote_callbacks(progress: &ProgressSink) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();

    let mut attempts = 0;
    callbacks.credentials(move |url, username_from_url, allowed_types| {
        attempts += 1;
        if attempts > MAX_CREDENTIAL_ATTEMPTS {
            return Err(git2::Error::from_str("authentication failed"));
        }
        if allowed_types.contains(CredentialType::SSH_KEY) {
            Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
        } else if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) {
            let config = git2::Config::open_default()?;
            Cred::credential_helper(&config, url, username_from_url)
        } else if allowed_types.contains(CredentialType::DEFAULT) {
            Cred::default()
        } else {
            Err(git2::Error::from_str("No supported authentication method"))
        }
    });

    let mut last = None;
    callbacks.transfer_progress(move |stats| {
        let (op, current, total) = if stats.received_objects() < stats.total_objects() {
            (
                ProgressOp::Receiving,
                stats.received_objects(),
                stats.total_objects(),
            )
        } else {
            (
                ProgressOp::Resolving,
                stats.indexed_deltas(),
                stats.total_deltas(),
            )
        };
        let step = (op, bucket(current, total));
        if last == Some(step) {
            return !progress.is_cancelled();
        }
        last = Some(step);
        progress.update(op, current as u64, Some(total as u64), "")
    });

    callbacks.sideband_progress(move |data| {
        let text = String::from_utf8_lossy(data);
        let line = text.trim();
        if line.is_empty() {
            return !progress.is_cancelled();
        }
        let op = if line.starts_with("Counting") || line.starts_with("Enumerating") {
            ProgressOp::Counting
        } else {
            ProgressOp::Remote
        };
        progress.update(op, 0, None, line)
    });

    callbacks.push_transfer_progress(move |current, total, _bytes| {
        progress.update(
            ProgressOp::Pushing,
            current as u64,
            Some(total as u64),
            "",
        );
    });

    callbacks
}
