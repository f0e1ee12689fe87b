pub mod backend;
pub mod git2_backend;

pub use backend::{CloneRequest, GitError, VcsBackend, VcsHandle, WorkingTreeStatus};
pub use git2_backend::Git2Backend;
