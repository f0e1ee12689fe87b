//! Per-batch progress aggregation.
//!
//! A [`ProgressChannel`] is built once per batch. Every worker gets its own
//! [`ProgressSink`] tagged with the repository path; the parent drains the
//! receiver and feeds the render board. Nothing here is global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::application::use_cases::foreach_command::Operation;

/// Cooperative cancellation flag shared between the parent and its workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOp {
    Counting,
    Receiving,
    Resolving,
    Checkout,
    Pushing,
    /// Free-form sideband text from the remote.
    Remote,
    Started(Operation),
    Finished { ok: bool },
}

impl ProgressOp {
    pub fn label(&self) -> &'static str {
        match self {
            ProgressOp::Counting => "counting",
            ProgressOp::Receiving => "receiving",
            ProgressOp::Resolving => "resolving",
            ProgressOp::Checkout => "checkout",
            ProgressOp::Pushing => "pushing",
            ProgressOp::Remote => "remote",
            ProgressOp::Started(operation) => operation.label(),
            ProgressOp::Finished { ok: true } => "done",
            ProgressOp::Finished { ok: false } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub repo_path: String,
    pub op: ProgressOp,
    pub current: u64,
    pub max: Option<u64>,
    pub message: String,
}

/// Parent-side end of the batch progress queue.
#[derive(Debug)]
pub struct ProgressChannel {
    sender: UnboundedSender<ProgressEvent>,
    receiver: UnboundedReceiver<ProgressEvent>,
    cancel: CancelToken,
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self::with_cancel(CancelToken::new())
    }

    /// Build a channel whose batch token is owned by the caller.
    pub fn with_cancel(cancel: CancelToken) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver,
            cancel,
        }
    }

    /// Hand out a sink for one repository.
    pub fn sink(&self, repo_path: impl Into<String>) -> ProgressSink {
        ProgressSink {
            repo_path: repo_path.into(),
            sender: Some(self.sender.clone()),
            batch: self.cancel.clone(),
            local: CancelToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait at most `timeout` for the next event.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<ProgressEvent> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker-side handle used by VCS callbacks.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    repo_path: String,
    sender: Option<UnboundedSender<ProgressEvent>>,
    batch: CancelToken,
    local: CancelToken,
}

impl ProgressSink {
    /// A sink that drops every event and is never cancelled by a batch.
    pub fn disabled() -> Self {
        Self {
            repo_path: String::new(),
            sender: None,
            batch: CancelToken::new(),
            local: CancelToken::new(),
        }
    }

    pub fn repo_path(&self) -> &str {
        &self.repo_path
    }

    /// Forward one event. Returns `false` once the batch or this worker was
    /// cancelled; transfer callbacks hand that straight back to libgit2.
    pub fn update(
        &self,
        op: ProgressOp,
        current: u64,
        max: Option<u64>,
        message: impl Into<String>,
    ) -> bool {
        if let Some(sender) = &self.sender {
            // The parent may already be gone after an interrupt.
            let _ = sender.send(ProgressEvent {
                repo_path: self.repo_path.clone(),
                op,
                current,
                max,
                message: message.into(),
            });
        }
        !self.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.batch.is_cancelled() || self.local.is_cancelled()
    }

    /// Cancel only this worker, leaving its siblings running.
    pub fn cancel(&self) {
        self.local.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_events_are_tagged_with_repo_path() {
        let mut channel = ProgressChannel::new();
        let sink = channel.sink("lib/core");

        assert!(sink.update(ProgressOp::Receiving, 3, Some(10), "objects"));

        let event = channel
            .recv_timeout(Duration::from_millis(50))
            .await
            .expect("event should be queued");
        assert_eq!(event.repo_path, "lib/core");
        assert_eq!(event.op, ProgressOp::Receiving);
        assert_eq!(event.current, 3);
        assert_eq!(event.max, Some(10));
    }

    #[tokio::test]
    async fn test_recv_timeout_returns_none_when_idle() {
        let mut channel = ProgressChannel::new();
        assert!(channel
            .recv_timeout(Duration::from_millis(10))
            .await
            .is_none());
    }

    #[test]
    fn test_batch_cancel_reaches_every_sink() {
        let channel = ProgressChannel::new();
        let first = channel.sink("a");
        let second = channel.sink("b");

        channel.cancel_token().cancel();

        assert!(!first.update(ProgressOp::Counting, 0, None, ""));
        assert!(second.is_cancelled());
    }

    #[test]
    fn test_local_cancel_is_isolated() {
        let channel = ProgressChannel::new();
        let first = channel.sink("a");
        let second = channel.sink("b");

        first.cancel();

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_disabled_sink_drops_events() {
        let sink = ProgressSink::disabled();
        assert!(sink.update(ProgressOp::Pushing, 1, Some(1), "done"));
        assert!(!sink.is_cancelled());
    }
}
