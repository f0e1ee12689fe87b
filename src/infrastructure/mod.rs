/// Infrastructure layer modules
///
/// Concrete implementations for external system interactions:
/// - Git operations through libgit2
/// - File system persistence (registry, environment config, manifests)
pub mod filesystem;
pub mod git;

pub use filesystem::{config_store::ConfigStore, manifest_store::ManifestStore};
pub use git::git2_backend::Git2Backend;
