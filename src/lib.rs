//! # repofleet - manifest-driven multi-repository sync
//!
//! `repofleet` keeps a fleet of git repositories checked out side by side in
//! one environment, each at the ref a shared manifest records, and can freeze
//! that manifest into named snapshots to reproduce a workspace later.
//!
//! ## Features
//!
//! - **Batch git operations**: clone, fetch, checkout, rebase and push across
//!   every repository with a bounded worker pool and live progress
//! - **Environments**: several named roots, registered globally, each with its
//!   own manifest and config
//! - **Snapshots**: tag the manifest (optionally pinned to exact commits) in a
//!   dedicated git repository and restore it anywhere
//!
//! ## Quick Start
//!
//! ```bash
//! repofleet init work --seed https://example.com/team/manifest.json
//! cd work
//! repofleet add libs/core acme/core --ref develop
//! repofleet sync
//! repofleet tag release-1 --strict
//! ```
//!
//! The manifest lives at `<root>/.repofleet/manifest.json`:
//!
//! ```json
//! {
//!   "repos": {
//!     "libs/core": { "ref": "develop", "repo": "acme/core" }
//!   }
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`domain`]: manifest, repository and value objects
//! - [`application`]: the batch orchestrator, snapshots and environments
//! - [`infrastructure`]: libgit2 backend and YAML/JSON persistence
//! - [`presentation`]: CLI and progress rendering
//! - [`common`]: error type and result helpers
//!
//! ## Using the Library
//!
//! ```rust,no_run
//! use repofleet::application::use_cases::environment::Environment;
//! use repofleet::domain::value_objects::repo_filter::RepoFilter;
//! use repofleet::infrastructure::filesystem::config_store::RegistryStore;
//! use std::path::Path;
//!
//! # async fn example() -> repofleet::Result<()> {
//! let registry = RegistryStore::from_env()?;
//! let env = Environment::resolve(&registry, None, Path::new("."))?;
//!
//! let result = env.sync(RepoFilter::new(&["core"])?, None).await?;
//! println!("{} synced, {} failed", result.succeeded, result.failed);
//! # Ok(())
//! # }
//! ```

#![deny(rustdoc::broken_intra_doc_links)]

pub mod application;
pub mod common;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use crate::common::error::FleetError;
pub use crate::common::result::FleetResult as Result;
