//! Local git remotes for end-to-end tests.
//!
//! Every remote is a bare repository under a [`TempDir`] whose `HEAD` points
//! at `develop`, so the default manifest ref resolves without a network.

use std::fs;
use std::path::{Path, PathBuf};

use git2::{Oid, Repository, Signature};
use tempfile::TempDir;

pub const BRANCH: &str = "develop";

/// A scratch area holding any number of bare remotes.
pub struct RemoteFarm {
    dir: TempDir,
}

impl RemoteFarm {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Create `<farm>/<name>.git` with one commit on `develop`.
    pub fn remote(&self, name: &str) -> PathBuf {
        let bare_path = self.dir.path().join(format!("{name}.git"));
        let bare = Repository::init_bare(&bare_path).unwrap();

        let seed_path = self.dir.path().join(format!("{name}-seed"));
        let seed = Repository::init(&seed_path).unwrap();
        seed.set_head(&format!("refs/heads/{BRANCH}")).unwrap();
        commit_file(&seed, "README.md", &format!("# {name}\n"), "initial commit");

        let mut origin = seed.remote("origin", bare_path.to_str().unwrap()).unwrap();
        let refspec = format!("refs/heads/{BRANCH}:refs/heads/{BRANCH}");
        origin.push(&[refspec.as_str()], None).unwrap();
        bare.set_head(&format!("refs/heads/{BRANCH}")).unwrap();

        fs::remove_dir_all(&seed_path).unwrap();
        bare_path
    }

    /// An empty bare repository, e.g. for pushing snapshots to.
    pub fn empty_remote(&self, name: &str) -> PathBuf {
        let bare_path = self.dir.path().join(format!("{name}.git"));
        Repository::init_bare(&bare_path).unwrap();
        bare_path
    }

    /// Land a new commit on `branch` of `remote` from a scratch clone.
    /// Returns the new tip.
    pub fn advance(&self, remote: &Path, branch: &str, file: &str, contents: &str) -> String {
        let scratch = TempDir::new_in(self.dir.path()).unwrap();
        let repo = git2::build::RepoBuilder::new()
            .branch(branch)
            .clone(remote.to_str().unwrap(), scratch.path())
            .unwrap();
        let oid = commit_file(&repo, file, contents, &format!("update {file}"));

        let mut origin = repo.find_remote("origin").unwrap();
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        origin.push(&[refspec.as_str()], None).unwrap();
        oid.to_string()
    }

    /// Create a lightweight tag on the current tip of `branch`.
    pub fn tag(&self, remote: &Path, branch: &str, tag: &str) -> String {
        let repo = Repository::open_bare(remote).unwrap();
        let target = repo
            .revparse_single(&format!("refs/heads/{branch}"))
            .unwrap();
        repo.tag_lightweight(tag, &target, false).unwrap();
        target.id().to_string()
    }
}

pub fn signature() -> Signature<'static> {
    Signature::now("Fleet Tester", "tester@example.com").unwrap()
}

/// Write, stage and commit one file on the current HEAD.
pub fn commit_file(repo: &Repository, file: &str, contents: &str, message: &str) -> Oid {
    let workdir = repo.workdir().unwrap();
    let target = workdir.join(file);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&target, contents).unwrap();

    let mut index = repo.index().unwrap();
    index.add_path(Path::new(file)).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();

    let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    let sig = signature();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap()
}

pub fn head_of(path: &Path) -> String {
    let repo = Repository::open(path).unwrap();
    let head = repo.head().unwrap().peel_to_commit().unwrap().id().to_string();
    head
}

/// `None` when HEAD is detached.
pub fn branch_of(path: &Path) -> Option<String> {
    let repo = Repository::open(path).unwrap();
    let detached = repo.head_detached().unwrap();
    if detached {
        return None;
    }
    let head = repo.head().unwrap();
    head.shorthand().map(str::to_string)
}

pub fn tip_of(remote: &Path, branch: &str) -> String {
    let repo = Repository::open_bare(remote).unwrap();
    let tip = repo
        .revparse_single(&format!("refs/heads/{branch}"))
        .unwrap()
        .id()
        .to_string();
    tip
}
