use std::path::PathBuf;
use thiserror::Error;

use crate::infrastructure::git::backend::GitError;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Path {} is already occupied; refusing to clone over it", path.display())]
    PathOccupied { path: PathBuf },

    #[error(
        "{} exists but is not a git working tree; move it aside or remove it, then sync again",
        path.display()
    )]
    NotAGitRepository { path: PathBuf },

    #[error("[{repository}] checkout of '{reference}' blocked by local changes: {detail}")]
    CheckoutConflict {
        repository: String,
        reference: String,
        detail: String,
    },

    #[error("[{repository}] working tree has uncommitted changes; commit or stash them first")]
    DirtyWorkingTree { repository: String },

    #[error(
        "[{repository}] rebase onto '{upstream}' stopped on conflicts; resolve them in place and continue the rebase"
    )]
    RebaseConflict { repository: String, upstream: String },

    #[error("Manifest parse error: {message}")]
    ManifestParse {
        message: String,
        file_path: Option<PathBuf>,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("[{repository}] remote operation failed: {message}")]
    Remote { repository: String, message: String },

    #[error("Git operation failed: {message}")]
    Git {
        message: String,
        repository: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("File system operation failed: {message}")]
    FileSystem {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Environment error: {message}")]
    Environment { message: String },

    #[error("No environment found at or above {}; run `repofleet init` first", path.display())]
    NotInitialized { path: PathBuf },

    #[error("Tag '{name}' already exists; pass --force to move it")]
    TagExists { name: String },

    #[error("Tag '{name}' is the baseline tag and cannot be deleted")]
    ProtectedTag { name: String },

    #[error("No snapshot manifest found at '{reference}'")]
    SnapshotNotFound { reference: String },

    #[error("Validation error: {field} - {message}")]
    Validation {
        field: String,
        message: String,
        value: Option<String>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl FleetError {
    pub fn path_occupied(path: impl Into<PathBuf>) -> Self {
        Self::PathOccupied { path: path.into() }
    }

    pub fn not_a_git_repository(path: impl Into<PathBuf>) -> Self {
        Self::NotAGitRepository { path: path.into() }
    }

    pub fn manifest_parse(message: impl Into<String>, file_path: Option<PathBuf>) -> Self {
        Self::ManifestParse {
            message: message.into(),
            file_path,
            source: None,
        }
    }

    pub fn manifest_parse_with_source(
        message: impl Into<String>,
        file_path: Option<PathBuf>,
        source: serde_json::Error,
    ) -> Self {
        Self::ManifestParse {
            message: message.into(),
            file_path,
            source: Some(source),
        }
    }

    pub fn git_error(message: impl Into<String>, repository: Option<String>) -> Self {
        Self::Git {
            message: message.into(),
            repository,
            source: None,
        }
    }

    pub fn git_error_with_source(
        message: impl Into<String>,
        repository: Option<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Git {
            message: message.into(),
            repository,
            source: Some(Box::new(source)),
        }
    }

    pub fn filesystem_error(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self::FileSystem {
            message: message.into(),
            path,
            source: None,
        }
    }

    pub fn filesystem_error_with_source(
        message: impl Into<String>,
        path: Option<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::FileSystem {
            message: message.into(),
            path,
            source: Some(source),
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_error_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn environment_error(message: impl Into<String>) -> Self {
        Self::Environment {
            message: message.into(),
        }
    }

    pub fn validation_error(
        field: impl Into<String>,
        message: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
            value,
        }
    }

    pub fn timeout(timeout_secs: u64) -> Self {
        Self::Timeout { timeout_secs }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_error_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Lift a backend error into the crate error, attaching the repository
    /// it happened in.
    pub fn from_git(repository: &str, error: GitError) -> Self {
        match error {
            GitError::Cancelled => Self::Cancelled,
            GitError::NotARepository(path) => Self::NotAGitRepository { path },
            GitError::CheckoutConflict { reference, detail } => Self::CheckoutConflict {
                repository: repository.to_string(),
                reference,
                detail,
            },
            GitError::DirtyWorkingTree => Self::DirtyWorkingTree {
                repository: repository.to_string(),
            },
            GitError::RebaseConflict { upstream } => Self::RebaseConflict {
                repository: repository.to_string(),
                upstream,
            },
            GitError::Remote { operation, message } => Self::Remote {
                repository: repository.to_string(),
                message: format!("{operation}: {message}"),
            },
            other => Self::git_error_with_source(
                format!("[{repository}] {other}"),
                Some(repository.to_string()),
                other,
            ),
        }
    }
}

impl From<git2::Error> for FleetError {
    fn from(error: git2::Error) -> Self {
        Self::Git {
            message: error.message().to_string(),
            repository: None,
            source: Some(Box::new(error)),
        }
    }
}

impl From<std::io::Error> for FleetError {
    fn from(error: std::io::Error) -> Self {
        Self::filesystem_error_with_source("File system operation failed", None, error)
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(error: serde_json::Error) -> Self {
        Self::manifest_parse_with_source(error.to_string(), None, error)
    }
}

impl From<serde_yaml::Error> for FleetError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::config_error_with_source("YAML serialization failed", error)
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(error: reqwest::Error) -> Self {
        Self::config_error_with_source("Failed to download seed manifest", error)
    }
}

impl From<validator::ValidationErrors> for FleetError {
    fn from(error: validator::ValidationErrors) -> Self {
        Self::config_error_with_source("Configuration validation failed", error)
    }
}
