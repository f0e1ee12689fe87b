//! Bounded-parallel batch execution of one git operation over many
//! repositories, with live progress aggregation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::application::services::progress_channel::{
    CancelToken, ProgressChannel, ProgressOp, ProgressSink,
};
use crate::application::services::progress_view::{ProgressView, ProgressViewFactory, SilentView};
use crate::common::error::FleetError;
use crate::common::result::FleetResult;
use crate::domain::entities::repository::{MergeOutcome, Repository};
use crate::domain::value_objects::repo_filter::RepoFilter;

const EVENT_POLL: Duration = Duration::from_millis(50);
const RENDER_TICK: Duration = Duration::from_millis(100);
/// Conventional status for a process ended by SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// The git operations a batch can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Clone,
    ShallowClone,
    Fetch,
    Checkout,
    MergeFromRemote,
    Push,
    /// Clone if missing, fetch, checkout, merge from remote, push.
    Sync { shallow: bool },
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Clone => "clone",
            Operation::ShallowClone => "shallow clone",
            Operation::Fetch => "fetch",
            Operation::Checkout => "checkout",
            Operation::MergeFromRemote => "merge",
            Operation::Push => "push",
            Operation::Sync { .. } => "sync",
        }
    }

    /// Run on the calling thread. Blocking.
    pub fn run(&self, repo: &mut Repository) -> FleetResult<()> {
        match *self {
            Operation::Clone => clone_repo(repo, false),
            Operation::ShallowClone => clone_repo(repo, true),
            Operation::Fetch => fetch_repo(repo),
            Operation::Checkout => checkout_repo(repo),
            Operation::MergeFromRemote => merge_repo(repo),
            Operation::Push => push_repo(repo),
            Operation::Sync { shallow } => sync_repo(repo, shallow),
        }
    }
}

fn clone_repo(repo: &mut Repository, shallow: bool) -> FleetResult<()> {
    repo.ensure_working_tree()?;
    repo.clone(shallow)
}

fn fetch_repo(repo: &mut Repository) -> FleetResult<()> {
    repo.ensure_working_tree()?;
    repo.fetch()
}

fn checkout_repo(repo: &mut Repository) -> FleetResult<()> {
    repo.ensure_working_tree()?;
    let reference = repo.reference().to_string();
    if repo.checkout(&reference)? {
        debug!(repo = %repo.display_name(), %reference, "checked out");
    }
    Ok(())
}

fn merge_repo(repo: &mut Repository) -> FleetResult<()> {
    repo.ensure_working_tree()?;
    match repo.merge_from_remote()? {
        MergeOutcome::Rebased { incoming } => {
            info!(repo = %repo.display_name(), incoming, "rebased onto upstream")
        }
        MergeOutcome::NoUpstream => debug!(repo = %repo.display_name(), "no upstream"),
        MergeOutcome::UpToDate => {}
    }
    Ok(())
}

fn push_repo(repo: &mut Repository) -> FleetResult<()> {
    repo.ensure_working_tree()?;
    if repo.push()? {
        info!(repo = %repo.display_name(), "pushed");
    }
    Ok(())
}

fn sync_repo(repo: &mut Repository, shallow: bool) -> FleetResult<()> {
    repo.ensure_working_tree()?;
    if repo.exists() {
        repo.fetch()?;
    } else {
        repo.clone(shallow)?;
    }
    checkout_repo(repo)?;
    merge_repo(repo)?;
    push_repo(repo)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepoState {
    Pending,
    Running,
    Done,
    Errored,
}

/// Terminal outcome of one repository in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoOutcome {
    pub path: String,
    pub name: String,
    pub state: RepoState,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl RepoOutcome {
    pub fn is_success(&self) -> bool {
        self.state == RepoState::Done
    }

    pub fn is_failure(&self) -> bool {
        self.state == RepoState::Errored
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ForeachResult {
    pub results: Vec<RepoOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub total_elapsed_ms: u64,
}

impl ForeachResult {
    pub fn add_result(&mut self, result: RepoOutcome) {
        if result.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn total_count(&self) -> usize {
        self.results.len()
    }

    pub fn failed_results(&self) -> Vec<&RepoOutcome> {
        self.results.iter().filter(|r| r.is_failure()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ForeachCommandConfig {
    pub operation: Operation,
    pub filter: RepoFilter,
    /// `None` runs every selected repository at once.
    pub max_parallel: Option<usize>,
    /// `None` renders nothing.
    pub view: Option<Arc<dyn ProgressViewFactory>>,
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
}

impl ForeachCommandConfig {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            filter: RepoFilter::all(),
            max_parallel: None,
            view: None,
            timeout: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_filter(mut self, filter: RepoFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: Option<usize>) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_view(mut self, view: Option<Arc<dyn ProgressViewFactory>>) -> Self {
        self.view = view;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Share a cancellation token with the caller.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

struct WorkerReport {
    path: String,
    name: String,
    result: Result<(), String>,
    elapsed: Duration,
}

pub struct ForeachCommandUseCase {
    config: ForeachCommandConfig,
}

impl ForeachCommandUseCase {
    pub fn new(config: ForeachCommandConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ForeachCommandConfig {
        &self.config
    }

    /// Run the configured operation over every selected repository.
    ///
    /// Returns once every worker has reached a terminal state. Per-repository
    /// failures are reported in the result and never stop their siblings.
    pub async fn execute(&self, repos: Vec<Repository>) -> ForeachResult {
        let started = Instant::now();
        let operation = self.config.operation;

        let mut selected = self.config.filter.select(repos);
        selected.sort_by(|a, b| {
            a.depth()
                .cmp(&b.depth())
                .then_with(|| a.path().cmp(b.path()))
        });
        let order: Vec<String> = selected.iter().map(|r| r.path().to_string()).collect();

        let rows: Vec<(String, String)> = selected
            .iter()
            .map(|r| (r.path().to_string(), r.display_name().to_string()))
            .collect();
        let mut board: Box<dyn ProgressView> = match &self.config.view {
            Some(factory) => factory.create(rows),
            None => Box::new(SilentView),
        };

        let permits = self
            .config
            .max_parallel
            .unwrap_or(selected.len())
            .max(1);
        info!(
            operation = operation.label(),
            repos = selected.len(),
            parallel = permits,
            "starting batch"
        );

        let mut channel = ProgressChannel::with_cancel(self.config.cancel.clone());
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut workers = FuturesUnordered::new();

        for mut repo in selected {
            let sink = channel.sink(repo.path());
            repo.set_progress(sink.clone());
            let path = repo.path().to_string();
            let name = repo.display_name().to_string();
            let task = tokio::spawn(run_worker(
                repo,
                operation,
                Arc::clone(&semaphore),
                sink,
                self.config.timeout,
            ));
            workers.push(async move {
                let begun = Instant::now();
                let result = match task.await {
                    Ok(result) => result,
                    Err(join_error) => Err(format!("worker failed: {join_error}")),
                };
                WorkerReport {
                    path,
                    name,
                    result,
                    elapsed: begun.elapsed(),
                }
            });
        }

        let mut reports = Vec::with_capacity(order.len());
        let mut tick = tokio::time::interval(RENDER_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut signals_available = true;
        let mut interrupts = 0u32;

        while !workers.is_empty() {
            tokio::select! {
                Some(report) = workers.next() => {
                    board.finish(&report.path, report.result.clone().err());
                    reports.push(report);
                }
                Some(event) = channel.recv_timeout(EVENT_POLL) => board.apply(event),
                _ = tick.tick() => board.render(),
                signal = &mut ctrl_c, if signals_available => {
                    // Re-arm so a second interrupt is still delivered here.
                    ctrl_c.set(tokio::signal::ctrl_c());
                    match signal {
                        Ok(()) => {
                            interrupts += 1;
                            match on_interrupt(interrupts) {
                                Interrupt::Cancel => {
                                    warn!("interrupted, cancelling outstanding work (again to abort)");
                                    self.config.cancel.cancel();
                                }
                                Interrupt::Abort => {
                                    board.finish_all();
                                    warn!("interrupted again, aborting");
                                    std::process::exit(INTERRUPTED_EXIT_CODE);
                                }
                            }
                        }
                        Err(e) => {
                            signals_available = false;
                            debug!(error = %e, "ctrl-c handler unavailable");
                        }
                    }
                }
            }
        }

        while let Some(event) = channel.try_recv() {
            board.apply(event);
        }
        board.render();
        board.finish_all();

        let mut result = ForeachResult::default();
        reports.sort_by_key(|report| order.iter().position(|p| *p == report.path));
        for report in reports {
            let (state, error) = match report.result {
                Ok(()) => (RepoState::Done, None),
                Err(message) => (RepoState::Errored, Some(message)),
            };
            result.add_result(RepoOutcome {
                path: report.path,
                name: report.name,
                state,
                error,
                elapsed_ms: report.elapsed.as_millis() as u64,
            });
        }
        result.total_elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            operation = operation.label(),
            succeeded = result.succeeded,
            failed = result.failed,
            elapsed_ms = result.total_elapsed_ms,
            "batch finished"
        );
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    /// Trip the cancel token and let workers wind down.
    Cancel,
    /// A blocked transfer never polls the token, so give up on the process.
    Abort,
}

fn on_interrupt(seen: u32) -> Interrupt {
    if seen <= 1 {
        Interrupt::Cancel
    } else {
        Interrupt::Abort
    }
}

async fn run_worker(
    mut repo: Repository,
    operation: Operation,
    semaphore: Arc<Semaphore>,
    sink: ProgressSink,
    timeout: Option<Duration>,
) -> Result<(), String> {
    let name = repo.display_name().to_string();
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| e.to_string())?;

    if sink.is_cancelled() {
        return Err(FleetError::Cancelled.to_string());
    }
    sink.update(ProgressOp::Started(operation), 0, None, operation.label());

    let mut task = tokio::task::spawn_blocking(move || operation.run(&mut repo));
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                // The transfer callbacks see the tripped token and bail out;
                // the blocking task is left to wind down on its own.
                sink.cancel();
                let message = FleetError::timeout(limit.as_secs()).to_string();
                error!(repo = %name, error = %message, "{} timed out", operation.label());
                return Err(message);
            }
        },
        None => task.await,
    };

    let outcome = match joined {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(join_error) => Err(format!("worker failed: {join_error}")),
    };
    sink.update(
        ProgressOp::Finished {
            ok: outcome.is_ok(),
        },
        0,
        None,
        "",
    );
    if let Err(message) = &outcome {
        error!(repo = %name, error = %message, "{} failed", operation.label());
    }
    outcome
}
