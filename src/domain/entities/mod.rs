pub mod environment_config;
pub mod manifest;
pub mod repository;
