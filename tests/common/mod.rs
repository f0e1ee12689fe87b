//! Common test utilities and helpers
//!
//! Shared by the integration tests: throwaway git remotes built with libgit2
//! and a scriptable in-memory VCS backend.

#![allow(dead_code)]

pub mod fake_backend;
pub mod git_fixtures;
