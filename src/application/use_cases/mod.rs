pub mod environment;
pub mod foreach_command;
pub mod snapshot;
pub mod status_check;
