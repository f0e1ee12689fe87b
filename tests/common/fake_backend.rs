//! Scriptable in-memory VCS backend.
//!
//! Repositories "exist" once cloned or registered with [`FakeBackend::seed`].
//! Fetches can be told to fail, stall, or trip a cancel token, and the
//! backend records call order and the peak number of concurrent fetches.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use repofleet::application::services::progress_channel::{CancelToken, ProgressSink};
use repofleet::infrastructure::git::{
    CloneRequest, GitError, VcsBackend, VcsHandle, WorkingTreeStatus,
};

const FAKE_HEAD: &str = "0123456789abcdef0123456789abcdef01234567";

#[derive(Default)]
struct FakeState {
    repositories: HashSet<PathBuf>,
    failing: HashSet<String>,
    calls: Vec<String>,
    fetch_delay: Option<Duration>,
    trip_on_fetch: Option<CancelToken>,
    running: usize,
    peak: usize,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `path` already holds a clone.
    pub fn seed(&self, path: &Path) {
        fs::create_dir_all(path).unwrap();
        self.state
            .lock()
            .unwrap()
            .repositories
            .insert(path.to_path_buf());
    }

    /// Fetches and clones of repositories whose directory is named `name`
    /// fail with a remote error.
    pub fn fail_for(&self, name: &str) {
        self.state.lock().unwrap().failing.insert(name.to_string());
    }

    pub fn with_fetch_delay(&self, delay: Duration) {
        self.state.lock().unwrap().fetch_delay = Some(delay);
    }

    /// Cancel `token` as soon as the first fetch runs.
    pub fn cancel_on_fetch(&self, token: CancelToken) {
        self.state.lock().unwrap().trip_on_fetch = Some(token);
    }

    /// `"<op> <dir name>"` entries in call order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.state.lock().unwrap().peak
    }

    fn record(&self, op: &str, path: &Path) -> Result<(), GitError> {
        let name = dir_name(path);
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{op} {name}"));
        if state.failing.contains(&name) {
            return Err(GitError::Remote {
                operation: "fetch",
                message: format!("{name}: connection refused"),
            });
        }
        Ok(())
    }

    fn handle(&self, path: &Path) -> Box<dyn VcsHandle> {
        Box::new(FakeHandle {
            path: path.to_path_buf(),
            backend: self.clone(),
        })
    }
}

impl VcsBackend for FakeBackend {
    fn is_repository(&self, path: &Path) -> bool {
        self.state.lock().unwrap().repositories.contains(path)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn VcsHandle>, GitError> {
        if !self.is_repository(path) {
            return Err(GitError::NotARepository(path.to_path_buf()));
        }
        Ok(self.handle(path))
    }

    fn clone_repository(
        &self,
        _url: &str,
        dest: &Path,
        _request: &CloneRequest,
        _progress: &ProgressSink,
    ) -> Result<Box<dyn VcsHandle>, GitError> {
        self.record("clone", dest)?;
        self.seed(dest);
        Ok(self.handle(dest))
    }

    fn init(&self, path: &Path, _origin: Option<String>) -> Result<Box<dyn VcsHandle>, GitError> {
        self.seed(path);
        Ok(self.handle(path))
    }
}

struct FakeHandle {
    path: PathBuf,
    backend: FakeBackend,
}

impl FakeHandle {
    fn unsupported(operation: &'static str) -> GitError {
        GitError::Remote {
            operation,
            message: "not supported by the fake backend".to_string(),
        }
    }
}

impl VcsHandle for FakeHandle {
    fn fetch(&mut self, progress: &ProgressSink) -> Result<(), GitError> {
        let (delay, trip) = {
            let mut state = self.backend.state.lock().unwrap();
            state.running += 1;
            state.peak = state.peak.max(state.running);
            (state.fetch_delay, state.trip_on_fetch.take())
        };
        if let Some(token) = trip {
            token.cancel();
        }
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        self.backend.state.lock().unwrap().running -= 1;

        if progress.is_cancelled() {
            return Err(GitError::Cancelled);
        }
        self.backend.record("fetch", &self.path)
    }

    fn current_branch(&self) -> Result<Option<String>, GitError> {
        Ok(Some("develop".to_string()))
    }

    fn head_commit(&self) -> Result<Option<String>, GitError> {
        Ok(Some(FAKE_HEAD.to_string()))
    }

    fn resolve_commit(&self, _reference: &str) -> Result<Option<String>, GitError> {
        Ok(Some(FAKE_HEAD.to_string()))
    }

    fn is_branch(&self, reference: &str) -> Result<bool, GitError> {
        Ok(reference == "develop")
    }

    fn checkout(&mut self, reference: &str, _progress: &ProgressSink) -> Result<(), GitError> {
        self.backend.record(&format!("checkout:{reference}"), &self.path)
    }

    fn upstream(&self) -> Result<Option<String>, GitError> {
        Ok(Some("origin/develop".to_string()))
    }

    fn missing_from_head(&self, _upstream: &str) -> Result<usize, GitError> {
        Ok(0)
    }

    fn rebase_onto(&mut self, _upstream: &str, _progress: &ProgressSink) -> Result<(), GitError> {
        Ok(())
    }

    fn unpublished_commits(&self) -> Result<usize, GitError> {
        Ok(0)
    }

    fn push(&mut self, _progress: &ProgressSink) -> Result<(), GitError> {
        self.backend.record("push", &self.path)
    }

    fn status(&self) -> Result<WorkingTreeStatus, GitError> {
        Ok(WorkingTreeStatus {
            branch: Some("develop".to_string()),
            head: Some(FAKE_HEAD.to_string()),
            ..WorkingTreeStatus::default()
        })
    }

    fn has_remote(&self) -> bool {
        true
    }

    fn commit_file(
        &mut self,
        _branch: &str,
        _relative: &Path,
        _contents: &[u8],
        _message: &str,
    ) -> Result<String, GitError> {
        Err(Self::unsupported("commit"))
    }

    fn tag_exists(&self, _name: &str) -> Result<bool, GitError> {
        Ok(false)
    }

    fn create_tag(&mut self, _name: &str, _target: &str, _force: bool) -> Result<(), GitError> {
        Err(Self::unsupported("tag"))
    }

    fn delete_tag(&mut self, name: &str) -> Result<(), GitError> {
        Err(GitError::RefNotFound(name.to_string()))
    }

    fn list_tags(&self) -> Result<Vec<String>, GitError> {
        Ok(Vec::new())
    }

    fn push_refspecs(
        &mut self,
        _refspecs: &[String],
        _progress: &ProgressSink,
    ) -> Result<(), GitError> {
        Err(Self::unsupported("push"))
    }

    fn reset_hard(&mut self, _target: &str) -> Result<(), GitError> {
        Ok(())
    }

    fn read_file_at(
        &self,
        _reference: &str,
        _relative: &Path,
    ) -> Result<Option<Vec<u8>>, GitError> {
        Ok(None)
    }
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
