pub mod remote_spec;
pub mod repo_filter;
