//! Named snapshots of the manifest, stored as tags in a dedicated git
//! repository.
//!
//! Each snapshot is a commit holding `manifest.json` on top of the mainline,
//! tagged and then dropped from the mainline again, so the branch itself
//! never grows and every tag points at a one-file tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::application::services::progress_channel::ProgressSink;
use crate::common::error::FleetError;
use crate::common::result::{FleetResult, ResultExt};
use crate::domain::entities::environment_config::EnvironmentConfig;
use crate::domain::entities::manifest::Manifest;
use crate::infrastructure::git::backend::{CloneRequest, GitError, VcsBackend, VcsHandle};

pub const SNAPSHOT_DIR: &str = "snapshots";
pub const MANIFEST_FILE: &str = "manifest.json";
const MARKER_FILE: &str = ".repofleet-snapshots";
const CARRIER: &str = "snapshots";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagReceipt {
    pub name: String,
    pub commit: String,
    pub pushed: bool,
}

pub struct SnapshotStore {
    path: PathBuf,
    remote: Option<String>,
    branch: String,
    baseline_tag: String,
    backend: Arc<dyn VcsBackend>,
}

impl SnapshotStore {
    /// `config_dir` is the environment's `.repofleet` directory.
    pub fn new(config_dir: &Path, config: &EnvironmentConfig, backend: Arc<dyn VcsBackend>) -> Self {
        Self {
            path: config_dir.join(SNAPSHOT_DIR),
            remote: config.snapshot_remote.clone(),
            branch: config.snapshot_branch.clone(),
            baseline_tag: config.baseline_tag.clone(),
            backend,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn vcs_error(error: GitError) -> FleetError {
        FleetError::from_git(CARRIER, error)
    }

    fn open(&self) -> FleetResult<Box<dyn VcsHandle>> {
        if self.backend.is_repository(&self.path) {
            return self.backend.open(&self.path).map_err(Self::vcs_error);
        }
        if self.path.exists() {
            return Err(FleetError::not_a_git_repository(&self.path));
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_filesystem_error(
                "Failed to create snapshot directory",
                Some(parent.to_path_buf()),
            )?;
        }
        match &self.remote {
            Some(url) => {
                info!(%url, "cloning snapshot repository");
                self.backend
                    .clone_repository(url, &self.path, &CloneRequest::full(), &ProgressSink::disabled())
                    .map_err(Self::vcs_error)
            }
            None => {
                debug!(path = %self.path.display(), "creating local snapshot repository");
                self.backend.init(&self.path, None).map_err(Self::vcs_error)
            }
        }
    }

    /// Pull remote tags in. A missing or unreachable remote is not fatal.
    fn refresh(&self, handle: &mut dyn VcsHandle) {
        if !handle.has_remote() {
            return;
        }
        if let Err(error) = handle.fetch(&ProgressSink::disabled()) {
            warn!(%error, "could not refresh snapshot tags, using local state");
        }
    }

    fn ensure_mainline(&self, handle: &mut dyn VcsHandle) -> FleetResult<()> {
        if handle.resolve_commit(&self.branch).map_err(Self::vcs_error)?.is_some() {
            return Ok(());
        }
        handle
            .commit_file(
                &self.branch,
                Path::new(MARKER_FILE),
                b"",
                "Initialize snapshot repository",
            )
            .map_err(Self::vcs_error)?;
        Ok(())
    }

    /// Record `manifest` under the tag `name`.
    pub fn tag(&self, name: &str, manifest: &Manifest, force: bool) -> FleetResult<TagReceipt> {
        validate_tag_name(name)?;
        let mut handle = self.open()?;
        self.refresh(handle.as_mut());

        if !force && handle.tag_exists(name).map_err(Self::vcs_error)? {
            return Err(FleetError::TagExists {
                name: name.to_string(),
            });
        }

        self.ensure_mainline(handle.as_mut())?;
        let message = format!(
            "Snapshot {name}\n\nTaken {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let commit = handle
            .commit_file(
                &self.branch,
                Path::new(MANIFEST_FILE),
                manifest.freeze().as_bytes(),
                &message,
            )
            .map_err(Self::vcs_error)?;

        let published = publish_tag(handle.as_mut(), name, &commit, force);
        let reset = handle.reset_hard("HEAD~1").map_err(Self::vcs_error);
        let pushed = published?;
        reset?;

        info!(tag = name, %commit, pushed, "snapshot recorded");
        Ok(TagReceipt {
            name: name.to_string(),
            commit,
            pushed,
        })
    }

    /// The manifest recorded at `reference` (a tag, branch or commit).
    pub fn load(&self, reference: &str) -> FleetResult<Manifest> {
        let mut handle = self.open()?;
        self.refresh(handle.as_mut());

        let bytes = handle
            .read_file_at(reference, Path::new(MANIFEST_FILE))
            .map_err(Self::vcs_error)?
            .ok_or_else(|| FleetError::SnapshotNotFound {
                reference: reference.to_string(),
            })?;
        let json = String::from_utf8(bytes).map_err(|e| {
            FleetError::manifest_parse(format!("snapshot '{reference}' is not UTF-8: {e}"), None)
        })?;
        Manifest::from_json(&json)
    }

    pub fn list(&self) -> FleetResult<Vec<String>> {
        let mut handle = self.open()?;
        self.refresh(handle.as_mut());
        handle.list_tags().map_err(Self::vcs_error)
    }

    /// Remove `name` locally and on the remote.
    pub fn delete(&self, name: &str) -> FleetResult<()> {
        if name == self.baseline_tag {
            return Err(FleetError::ProtectedTag {
                name: name.to_string(),
            });
        }
        let mut handle = self.open()?;
        self.refresh(handle.as_mut());

        match handle.delete_tag(name) {
            Ok(()) => {}
            Err(GitError::RefNotFound(_)) => {
                return Err(FleetError::SnapshotNotFound {
                    reference: name.to_string(),
                })
            }
            Err(error) => return Err(Self::vcs_error(error)),
        }
        if handle.has_remote() {
            handle
                .push_refspecs(&[format!(":refs/tags/{name}")], &ProgressSink::disabled())
                .map_err(Self::vcs_error)?;
        }
        info!(tag = name, "snapshot deleted");
        Ok(())
    }
}

/// Tag `commit` and push it when there is somewhere to push to. A tag whose
/// push failed is removed again unless it replaced an older one.
fn publish_tag(
    handle: &mut dyn VcsHandle,
    name: &str,
    commit: &str,
    force: bool,
) -> FleetResult<bool> {
    handle
        .create_tag(name, commit, force)
        .map_err(SnapshotStore::vcs_error)?;
    if !handle.has_remote() {
        return Ok(false);
    }

    let refspec = if force {
        format!("+refs/tags/{name}:refs/tags/{name}")
    } else {
        format!("refs/tags/{name}:refs/tags/{name}")
    };
    if let Err(error) = handle.push_refspecs(&[refspec], &ProgressSink::disabled()) {
        if !force {
            if let Err(cleanup) = handle.delete_tag(name) {
                warn!(tag = name, error = %cleanup, "could not drop unpublished tag");
            }
        }
        return Err(SnapshotStore::vcs_error(error));
    }
    Ok(true)
}

fn validate_tag_name(name: &str) -> FleetResult<()> {
    let invalid = name.is_empty()
        || name.starts_with('-')
        || name.ends_with('/')
        || name.ends_with(".lock")
        || name.contains("..")
        || name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    if invalid {
        return Err(FleetError::validation_error(
            "tag",
            "not a valid tag name",
            Some(name.to_string()),
        ));
    }
    Ok(())
}
