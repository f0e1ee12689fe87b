pub mod config_store;
pub mod manifest_store;
