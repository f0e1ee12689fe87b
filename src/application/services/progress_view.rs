//! Rendering seam for batch progress.
//!
//! The orchestrator owns the event loop and asks a [`ProgressView`] to draw;
//! the terminal implementation lives in the presentation layer.

use std::fmt::Debug;

use crate::application::services::progress_channel::ProgressEvent;

/// Aggregated state of one running batch.
pub trait ProgressView: Send {
    fn apply(&mut self, event: ProgressEvent);

    /// Terminal state of one repository; `error` is `None` on success.
    fn finish(&mut self, path: &str, error: Option<String>);

    fn render(&mut self);

    /// Called once after every worker has finished.
    fn finish_all(&mut self);
}

/// Builds a view for one batch from its `(path, label)` rows in display order.
pub trait ProgressViewFactory: Send + Sync + Debug {
    fn create(&self, rows: Vec<(String, String)>) -> Box<dyn ProgressView>;
}

/// Drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentView;

impl ProgressView for SilentView {
    fn apply(&mut self, _event: ProgressEvent) {}

    fn finish(&mut self, _path: &str, _error: Option<String>) {}

    fn render(&mut self) {}

    fn finish_all(&mut self) {}
}
