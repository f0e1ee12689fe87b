pub mod progress_channel;
pub mod progress_view;
