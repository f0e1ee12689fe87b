//! A named working environment: a root directory holding the live manifest,
//! its config and the source tree, plus everything that operates on them.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::application::services::progress_channel::CancelToken;
use crate::application::services::progress_view::ProgressViewFactory;
use crate::application::use_cases::foreach_command::{
    ForeachCommandConfig, ForeachCommandUseCase, ForeachResult, Operation,
};
use crate::application::use_cases::snapshot::{SnapshotStore, TagReceipt};
use crate::application::use_cases::status_check::{StatusCheckUseCase, StatusResult};
use crate::common::error::FleetError;
use crate::common::result::{FleetResult, ResultExt};
use crate::domain::entities::environment_config::{EnvironmentConfig, EnvironmentRecord};
use crate::domain::entities::manifest::{Manifest, RepoEntry};
use crate::domain::entities::repository::Repository;
use crate::domain::value_objects::remote_spec::RemoteSpec;
use crate::domain::value_objects::repo_filter::RepoFilter;
use crate::infrastructure::filesystem::config_store::{ConfigStore, RegistryStore};
use crate::infrastructure::filesystem::manifest_store::ManifestStore;
use crate::infrastructure::git::backend::VcsBackend;
use crate::infrastructure::git::git2_backend::Git2Backend;

pub const CONFIG_DIR: &str = ".repofleet";
pub const SRC_DIR: &str = "src";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const CONFIG_FILE: &str = "config.yml";

pub const ROOT_VAR: &str = "REPOFLEET_ROOT";
pub const SRCROOT_VAR: &str = "SRCROOT";
pub const ENV_NAME_VAR: &str = "REPOFLEET_ENV";

/// One row of `repofleet env`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentListing {
    pub name: String,
    pub record: EnvironmentRecord,
    pub current: bool,
}

pub struct Environment {
    name: String,
    root: PathBuf,
    config: EnvironmentConfig,
    manifest: Manifest,
    backend: Arc<dyn VcsBackend>,
    view: Option<Arc<dyn ProgressViewFactory>>,
    cancel: CancelToken,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("repos", &self.manifest.len())
            .finish()
    }
}

impl Environment {
    /// Create (or re-initialize) an environment rooted at `root`, register it
    /// and make it current.
    pub async fn init(
        registry: &RegistryStore,
        name: &str,
        root: &Path,
        seed: Option<&str>,
        snapshot_remote: Option<String>,
    ) -> FleetResult<Self> {
        validate_name(name)?;
        let config_dir = root.join(CONFIG_DIR);
        for dir in [config_dir.clone(), root.join(SRC_DIR)] {
            fs::create_dir_all(&dir)
                .with_filesystem_error("Failed to create directory", Some(dir.clone()))?;
        }
        let root = fs::canonicalize(root)
            .with_filesystem_error("Failed to resolve root", Some(root.to_path_buf()))?;

        let config_store = ConfigStore::new();
        let config_path = config_dir.join(CONFIG_FILE);
        let mut config = if config_path.is_file() {
            config_store.read_environment_config(&config_path)?
        } else {
            EnvironmentConfig::default()
        };
        if let Some(remote) = snapshot_remote {
            config.snapshot_remote = Some(remote);
        }
        config_store.write_environment_config(&config_path, &config)?;

        let manifest_store = ManifestStore::new();
        let manifest_path = config_dir.join(MANIFEST_FILE);
        let mut manifest = manifest_store.load(&manifest_path)?;
        if let Some(seed) = seed {
            let seeded = manifest_store.read_seed(seed).await?;
            info!(seed, repos = seeded.len(), "seeding manifest");
            manifest.merge(&seeded);
        }
        manifest_store.save(&manifest_path, &manifest)?;

        let mut records = registry.load_clean()?;
        records.register(name, &root);
        records.current = Some(name.to_string());
        registry.save(&records)?;
        info!(env = name, root = %root.display(), "environment initialized");

        Ok(Self::assemble(name, root, config, manifest))
    }

    fn assemble(name: &str, root: PathBuf, config: EnvironmentConfig, manifest: Manifest) -> Self {
        Self {
            name: name.to_string(),
            root,
            config,
            manifest,
            backend: Arc::new(Git2Backend),
            view: None,
            cancel: CancelToken::new(),
        }
    }

    /// Load the environment rooted at `root` without consulting the registry.
    pub fn load(name: &str, root: &Path) -> FleetResult<Self> {
        let config_dir = root.join(CONFIG_DIR);
        if !config_dir.is_dir() {
            return Err(FleetError::NotInitialized {
                path: root.to_path_buf(),
            });
        }
        let config_path = config_dir.join(CONFIG_FILE);
        let config = if config_path.is_file() {
            ConfigStore::new().read_environment_config(&config_path)?
        } else {
            EnvironmentConfig::default()
        };
        let manifest = ManifestStore::new().load(&config_dir.join(MANIFEST_FILE))?;
        Ok(Self::assemble(name, root.to_path_buf(), config, manifest))
    }

    /// Resolve `name` through the registry.
    pub fn open(registry: &RegistryStore, name: &str) -> FleetResult<Self> {
        let records = registry.load_clean()?;
        let record = records
            .get(name)
            .ok_or_else(|| FleetError::environment_error(format!("unknown environment '{name}'")))?;
        if !record.is_compatible() {
            return Err(incompatible(name, record));
        }
        Self::load(name, &record.path)
    }

    /// Walk up from `cwd` to the nearest environment root.
    pub fn discover(registry: &RegistryStore, cwd: &Path) -> FleetResult<Self> {
        let root = cwd
            .ancestors()
            .find(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE).is_file())
            .ok_or_else(|| FleetError::NotInitialized {
                path: cwd.to_path_buf(),
            })?;
        let records = registry.load()?;
        let canonical = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let name = records
            .name_for_path(&canonical)
            .map(String::from)
            .or_else(|| root.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        debug!(env = %name, root = %root.display(), "discovered environment");
        Self::load(&name, root)
    }

    /// An explicit name wins, then the enclosing directory, then the
    /// registry's current environment.
    pub fn resolve(registry: &RegistryStore, name: Option<&str>, cwd: &Path) -> FleetResult<Self> {
        if let Some(name) = name {
            return Self::open(registry, name);
        }
        match Self::discover(registry, cwd) {
            Ok(env) => Ok(env),
            Err(FleetError::NotInitialized { path }) => {
                let current = registry.load_clean()?.current;
                match current {
                    Some(name) => Self::open(registry, &name),
                    None => Err(FleetError::NotInitialized { path }),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn use_env(registry: &RegistryStore, name: &str) -> FleetResult<()> {
        let mut records = registry.load_clean()?;
        let record = records
            .get(name)
            .ok_or_else(|| FleetError::environment_error(format!("unknown environment '{name}'")))?;
        if !record.is_compatible() {
            return Err(incompatible(name, record));
        }
        records.current = Some(name.to_string());
        registry.save(&records)?;
        info!(env = name, "switched environment");
        Ok(())
    }

    /// Forget `name`; with `purge` also delete its root directory.
    pub fn drop_env(registry: &RegistryStore, name: &str, purge: bool) -> FleetResult<()> {
        let mut records = registry.load()?;
        let record = records
            .remove(name)
            .ok_or_else(|| FleetError::environment_error(format!("unknown environment '{name}'")))?;
        registry.save(&records)?;
        if purge && record.path.exists() {
            fs::remove_dir_all(&record.path)
                .with_filesystem_error("Failed to purge environment", Some(record.path.clone()))?;
            warn!(env = name, root = %record.path.display(), "environment purged");
        }
        Ok(())
    }

    pub fn list(registry: &RegistryStore) -> FleetResult<Vec<EnvironmentListing>> {
        let records = registry.load_clean()?;
        Ok(records
            .environments
            .iter()
            .map(|(name, record)| EnvironmentListing {
                name: name.clone(),
                record: record.clone(),
                current: records.current.as_deref() == Some(name),
            })
            .collect())
    }

    pub fn with_backend(mut self, backend: Arc<dyn VcsBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Where batch progress is drawn; nothing is drawn by default.
    pub fn with_progress_view(mut self, view: Arc<dyn ProgressViewFactory>) -> Self {
        self.view = Some(view);
        self
    }

    /// Per-invocation override of the configured pool size.
    pub fn with_max_parallel(mut self, max_parallel: Option<usize>) -> Self {
        if max_parallel.is_some() {
            self.config.max_parallel = max_parallel;
        }
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: Option<u64>) -> Self {
        if timeout_secs.is_some() {
            self.config.operation_timeout_secs = timeout_secs;
        }
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_DIR)
    }

    pub fn srcroot(&self) -> PathBuf {
        self.root.join(SRC_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.config_dir().join(MANIFEST_FILE)
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn save_manifest(&self) -> FleetResult<()> {
        ManifestStore::new().save(&self.manifest_path(), &self.manifest)
    }

    /// Bind every manifest entry to its working tree.
    pub fn repositories(&self) -> FleetResult<Vec<Repository>> {
        let srcroot = self.srcroot();
        self.manifest
            .repos()
            .map(|(path, entry)| {
                Repository::from_entry(
                    path,
                    entry,
                    &srcroot,
                    &self.config.remote_base,
                    Arc::clone(&self.backend),
                )
            })
            .collect()
    }

    pub fn status(&self, filter: RepoFilter) -> FleetResult<StatusResult> {
        Ok(StatusCheckUseCase::new(filter).execute(self.repositories()?))
    }

    pub async fn foreach(&self, operation: Operation, filter: RepoFilter) -> FleetResult<ForeachResult> {
        let config = ForeachCommandConfig::new(operation)
            .with_filter(filter)
            .with_max_parallel(self.config.max_parallel)
            .with_timeout(self.config.operation_timeout())
            .with_cancel_token(self.cancel.clone())
            .with_view(self.view.clone());
        let repos = self.repositories()?;
        Ok(ForeachCommandUseCase::new(config).execute(repos).await)
    }

    /// `shallow` falls back to the environment config.
    pub async fn sync(&self, filter: RepoFilter, shallow: Option<bool>) -> FleetResult<ForeachResult> {
        let shallow = shallow.unwrap_or(self.config.shallow);
        self.foreach(Operation::Sync { shallow }, filter).await
    }

    /// Record `spec` at `path` (relative to srcroot, or absolute inside it).
    pub fn add_repo(&mut self, path: &str, spec: &str, reference: Option<&str>) -> FleetResult<RepoEntry> {
        let path = self.manifest_key(path)?;
        RemoteSpec::parse(spec, &self.config.remote_base)
            .map_err(|e| FleetError::validation_error("repo", e.to_string(), Some(spec.to_string())))?;
        let reference = reference.unwrap_or(&self.config.default_ref).to_string();
        let entry = self.manifest.add(path.clone(), spec, Some(&reference)).clone();
        self.save_manifest()?;
        info!(%path, repo = spec, %reference, "repository added");
        Ok(entry)
    }

    /// Drop `path` from the manifest; with `delete_tree` also remove its
    /// working tree.
    pub fn remove_repo(&mut self, path: &str, delete_tree: bool) -> FleetResult<RepoEntry> {
        let path = self.manifest_key(path)?;
        let entry = self.manifest.remove(&path).ok_or_else(|| {
            FleetError::validation_error("path", "not in the manifest", Some(path.clone()))
        })?;
        self.save_manifest()?;

        let tree = self.srcroot().join(&path);
        if delete_tree && tree.exists() {
            fs::remove_dir_all(&tree)
                .with_filesystem_error("Failed to delete working tree", Some(tree.clone()))?;
        }
        info!(%path, delete_tree, "repository removed");
        Ok(entry)
    }

    fn manifest_key(&self, path: &str) -> FleetResult<String> {
        let invalid = |message: &str| FleetError::validation_error("path", message, Some(path.to_string()));
        let candidate = Path::new(path);
        let relative = if candidate.is_absolute() {
            let srcroot = self.srcroot();
            let srcroot = fs::canonicalize(&srcroot).unwrap_or(srcroot);
            pathdiff::diff_paths(candidate, &srcroot).ok_or_else(|| invalid("cannot be made relative"))?
        } else {
            candidate.to_path_buf()
        };

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => return Err(invalid("must stay inside the source root")),
            }
        }
        if parts.is_empty() {
            return Err(invalid("is empty"));
        }
        Ok(parts.join("/"))
    }

    /// The live manifest, with each cloned repository pinned to its exact
    /// HEAD commit when `strict`.
    pub fn freeze(&self, strict: bool) -> FleetResult<Manifest> {
        let mut frozen = self.manifest.clone();
        if !strict {
            return Ok(frozen);
        }
        for mut repo in self.repositories()? {
            if !repo.is_cloned() {
                debug!(path = repo.path(), "not cloned, keeping recorded ref");
                continue;
            }
            if let Some(commit) = repo.head_commit()? {
                if let Some(entry) = frozen.get_mut(repo.path()) {
                    entry.reference = commit;
                }
            }
        }
        Ok(frozen)
    }

    pub fn snapshots(&self) -> SnapshotStore {
        SnapshotStore::new(&self.config_dir(), &self.config, Arc::clone(&self.backend))
    }

    /// Merge the snapshot at `reference` into the live manifest, then sync.
    pub async fn restore(&mut self, reference: &str, shallow: Option<bool>) -> FleetResult<ForeachResult> {
        let store = self.snapshots();
        let owned = reference.to_string();
        let snapshot = off_runtime(move || store.load(&owned)).await?;
        info!(reference, repos = snapshot.len(), "restoring snapshot");
        self.manifest.merge(&snapshot);
        self.save_manifest()?;
        self.sync(RepoFilter::all(), shallow).await
    }

    pub async fn tag(
        &mut self,
        name: &str,
        strict: bool,
        force: bool,
        from_ref: Option<&str>,
    ) -> FleetResult<TagReceipt> {
        if let Some(from_ref) = from_ref {
            let result = self.restore(from_ref, None).await?;
            if !result.is_success() {
                return Err(FleetError::environment_error(format!(
                    "restoring '{from_ref}' failed for {} repositories; not tagging",
                    result.failed
                )));
            }
        }
        let frozen = self.freeze(strict)?;
        let store = self.snapshots();
        let name = name.to_string();
        off_runtime(move || store.tag(&name, &frozen, force)).await
    }

    pub fn tags(&self) -> FleetResult<Vec<String>> {
        self.snapshots().list()
    }

    pub fn delete_tag(&self, name: &str) -> FleetResult<()> {
        self.snapshots().delete(name)
    }

    /// Variables exported for shell integration.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (ROOT_VAR, self.root.display().to_string()),
            (SRCROOT_VAR, self.srcroot().display().to_string()),
            (ENV_NAME_VAR, self.name.clone()),
        ]
    }

    /// Directory of the first repository matching `pattern`, shallowest
    /// first, or a plain directory of that name under the source root.
    pub fn repo_path(&self, pattern: &str) -> FleetResult<PathBuf> {
        let filter = RepoFilter::new(&[pattern])?;
        let mut candidates: Vec<Repository> = self
            .repositories()?
            .into_iter()
            .filter(|repo| filter.matches_identity(repo.name(), repo.path()))
            .collect();
        candidates.sort_by(|a, b| a.depth().cmp(&b.depth()).then_with(|| a.path().cmp(b.path())));
        if let Some(repo) = candidates.first() {
            return Ok(repo.abs_path().to_path_buf());
        }

        let fallback = self.srcroot().join(pattern);
        if fallback.is_dir() {
            return Ok(fallback);
        }
        Err(FleetError::validation_error(
            "pattern",
            "matches no repository",
            Some(pattern.to_string()),
        ))
    }
}

/// Snapshot-repository git work blocks, so it runs on the blocking pool.
async fn off_runtime<T, F>(work: F) -> FleetResult<T>
where
    F: FnOnce() -> FleetResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| FleetError::internal_error_with_source("snapshot task failed", e))?
}

fn incompatible(name: &str, record: &EnvironmentRecord) -> FleetError {
    FleetError::environment_error(format!(
        "environment '{name}' was registered by an incompatible version ({}); run `repofleet init` in {} again",
        record.version,
        record.path.display()
    ))
}

fn validate_name(name: &str) -> FleetResult<()> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\') {
        return Err(FleetError::validation_error(
            "name",
            "environment names must be non-empty without slashes or whitespace",
            Some(name.to_string()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::environment_config::REGISTRY_VERSION;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn fixture() -> (TempDir, RegistryStore, Environment) {
        let temp_dir = TempDir::new().unwrap();
        let registry = RegistryStore::new(temp_dir.path().join("home"));
        let env = Environment::init(&registry, "work", &temp_dir.path().join("work"), None, None)
            .await
            .unwrap();
        (temp_dir, registry, env)
    }

    #[tokio::test]
    async fn test_init_lays_out_environment_and_registers_it() {
        let (_temp_dir, registry, env) = fixture().await;

        assert!(env.config_dir().join(CONFIG_FILE).is_file());
        assert!(env.manifest_path().is_file());
        assert!(env.srcroot().is_dir());

        let records = registry.load().unwrap();
        assert_eq!(records.current.as_deref(), Some("work"));
        assert_eq!(records.get("work").unwrap().path, env.root());
        assert_eq!(records.get("work").unwrap().version, REGISTRY_VERSION);
    }

    #[tokio::test]
    async fn test_init_merges_seed_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let seed = temp_dir.path().join("seed.json");
        fs::write(&seed, r#"{"repos":{"core":{"repo":"acme/core","ref":"main"}}}"#).unwrap();
        let registry = RegistryStore::new(temp_dir.path().join("home"));

        let env = Environment::init(
            &registry,
            "seeded",
            &temp_dir.path().join("seeded"),
            seed.to_str(),
            Some("git@example.com:team/snapshots.git".to_string()),
        )
        .await
        .unwrap();

        assert_eq!(env.manifest().get("core").unwrap().reference, "main");
        assert_eq!(
            env.config().snapshot_remote.as_deref(),
            Some("git@example.com:team/snapshots.git")
        );
        let reloaded = Environment::open(&registry, "seeded").unwrap();
        assert_eq!(reloaded.manifest(), env.manifest());
    }

    #[tokio::test]
    async fn test_discover_walks_up_from_nested_directory() {
        let (_temp_dir, registry, env) = fixture().await;
        let nested = env.srcroot().join("deep").join("er");
        fs::create_dir_all(&nested).unwrap();

        let found = Environment::discover(&registry, &nested).unwrap();
        assert_eq!(found.name(), "work");
        assert_eq!(found.root(), env.root());
    }

    #[tokio::test]
    async fn test_discover_outside_any_environment() {
        let temp_dir = TempDir::new().unwrap();
        let registry = RegistryStore::new(temp_dir.path().join("home"));
        assert!(matches!(
            Environment::discover(&registry, temp_dir.path()),
            Err(FleetError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn test_use_and_drop() {
        let (temp_dir, registry, first) = fixture().await;
        Environment::init(&registry, "other", &temp_dir.path().join("other"), None, None)
            .await
            .unwrap();
        assert_eq!(registry.load().unwrap().current.as_deref(), Some("other"));

        Environment::use_env(&registry, "work").unwrap();
        assert_eq!(registry.load().unwrap().current.as_deref(), Some("work"));
        assert!(Environment::use_env(&registry, "missing").is_err());

        Environment::drop_env(&registry, "work", true).unwrap();
        assert!(!first.root().exists());
        let listing = Environment::list(&registry).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "other");
        assert!(!listing[0].current);
    }

    #[tokio::test]
    async fn test_use_rejects_incompatible_record() {
        let (_temp_dir, registry, _env) = fixture().await;
        let mut records = registry.load().unwrap();
        records.environments.get_mut("work").unwrap().version = "v0".to_string();
        registry.save(&records).unwrap();

        assert!(matches!(
            Environment::use_env(&registry, "work"),
            Err(FleetError::Environment { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_and_remove_repo_persist() {
        let (_temp_dir, _registry, mut env) = fixture().await;

        let entry = env.add_repo("./libs/core", "acme/core", None).unwrap();
        assert_eq!(entry.reference, "develop");
        let absolute = env.srcroot().join("tools").join("cli");
        env.add_repo(absolute.to_str().unwrap(), "acme/cli", Some("main"))
            .unwrap();

        let on_disk = ManifestStore::new().load(&env.manifest_path()).unwrap();
        assert!(on_disk.get("libs/core").is_some());
        assert_eq!(on_disk.get("tools/cli").unwrap().reference, "main");

        fs::create_dir_all(env.srcroot().join("libs/core")).unwrap();
        env.remove_repo("libs/core", true).unwrap();
        assert!(!env.srcroot().join("libs/core").exists());
        assert!(env.remove_repo("libs/core", false).is_err());
    }

    #[tokio::test]
    async fn test_add_repo_rejects_escaping_paths() {
        let (_temp_dir, _registry, mut env) = fixture().await;
        assert!(env.add_repo("../outside", "acme/core", None).is_err());
        assert!(env.add_repo("", "acme/core", None).is_err());
        assert!(env.add_repo("core", "acme/co re", None).is_err());
    }

    #[tokio::test]
    async fn test_repo_path_prefers_shallow_match_then_falls_back() {
        let (_temp_dir, _registry, mut env) = fixture().await;
        env.add_repo("libs/core", "acme/core", None).unwrap();
        env.add_repo("core", "acme/core-legacy", None).unwrap();
        fs::create_dir_all(env.srcroot().join("scratch")).unwrap();

        assert_eq!(env.repo_path("core").unwrap(), env.srcroot().join("core"));
        assert_eq!(env.repo_path("scratch").unwrap(), env.srcroot().join("scratch"));
        assert!(env.repo_path("nothing").is_err());
    }

    #[tokio::test]
    async fn test_env_vars() {
        let (_temp_dir, _registry, env) = fixture().await;
        let vars = env.env_vars();
        assert_eq!(vars[0], (ROOT_VAR, env.root().display().to_string()));
        assert_eq!(vars[1], (SRCROOT_VAR, env.srcroot().display().to_string()));
        assert_eq!(vars[2], (ENV_NAME_VAR, "work".to_string()));
    }

    #[test]
    fn test_invalid_names() {
        assert!(validate_name("a b").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("").is_err());
        validate_name("work-2").unwrap();
    }
}
