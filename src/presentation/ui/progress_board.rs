//! Live per-repository progress rendering for a batch.

use std::collections::HashMap;

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::application::services::progress_channel::{ProgressEvent, ProgressOp};
use crate::application::services::progress_view::{ProgressView, ProgressViewFactory};
use crate::application::use_cases::foreach_command::RepoState;

const MAX_LABEL_WIDTH: usize = 40;

/// Display state for one repository in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardRow {
    pub path: String,
    pub label: String,
    pub state: RepoState,
    pub op: Option<ProgressOp>,
    pub current: u64,
    pub max: Option<u64>,
    pub message: String,
    pub error: Option<String>,
}

impl BoardRow {
    fn new(path: String, label: String) -> Self {
        Self {
            path,
            label,
            state: RepoState::Pending,
            op: None,
            current: 0,
            max: None,
            message: String::new(),
            error: None,
        }
    }

    /// Text shown after the bar.
    pub fn summary(&self) -> String {
        match self.state {
            RepoState::Pending => "waiting".to_string(),
            RepoState::Done => "done".to_string(),
            RepoState::Errored => self.error.clone().unwrap_or_else(|| "failed".to_string()),
            RepoState::Running => {
                let op = self.op.map(|op| op.label()).unwrap_or("running");
                let counter = match self.max {
                    Some(max) if max > 0 => format!(" {}/{}", self.current, max),
                    _ => String::new(),
                };
                if self.message.is_empty() {
                    format!("{op}{counter}")
                } else {
                    format!("{op}{counter} {}", self.message)
                }
            }
        }
    }
}

/// One row per repository, redrawn by the orchestrator on its tick.
///
/// When `silent` every bar is hidden, but row state is still tracked so the
/// final summary can be built from it.
pub struct ProgressBoard {
    rows: Vec<BoardRow>,
    index: HashMap<String, usize>,
    bars: Vec<ProgressBar>,
    _multi: MultiProgress,
    silent: bool,
}

impl ProgressBoard {
    /// `rows` yields `(path, label)` pairs in display order.
    pub fn new<I>(rows: I, silent: bool) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let rows: Vec<BoardRow> = rows
            .into_iter()
            .map(|(path, label)| BoardRow::new(path, label))
            .collect();
        let width = rows
            .iter()
            .map(|row| row.label.chars().count())
            .max()
            .unwrap_or(0)
            .min(MAX_LABEL_WIDTH);

        let multi = if silent {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::stderr())
        };
        let style = ProgressStyle::with_template(&format!(
            "{{prefix:<{width}.bold}} {{bar:25.cyan/blue}} {{msg}}"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");

        let bars = rows
            .iter()
            .map(|row| {
                let bar = multi.add(ProgressBar::new(0));
                bar.set_style(style.clone());
                bar.set_prefix(truncate(&row.label, width));
                bar.set_message(row.summary());
                bar
            })
            .collect();
        let index = rows
            .iter()
            .enumerate()
            .map(|(i, row)| (row.path.clone(), i))
            .collect();

        Self {
            rows,
            index,
            bars,
            _multi: multi,
            silent,
        }
    }

    pub fn rows(&self) -> &[BoardRow] {
        &self.rows
    }

    pub fn row(&self, path: &str) -> Option<&BoardRow> {
        self.index.get(path).map(|&i| &self.rows[i])
    }
}

impl ProgressView for ProgressBoard {
    /// Fold one progress event into its row. Events for unknown paths and
    /// events after a row finished are dropped.
    fn apply(&mut self, event: ProgressEvent) {
        let Some(&i) = self.index.get(&event.repo_path) else {
            return;
        };
        let row = &mut self.rows[i];
        if matches!(row.state, RepoState::Done | RepoState::Errored) {
            return;
        }
        match event.op {
            ProgressOp::Started(_) => {
                row.state = RepoState::Running;
                row.op = Some(event.op);
                row.current = 0;
                row.max = None;
                row.message.clear();
            }
            ProgressOp::Finished { .. } => {}
            op => {
                row.state = RepoState::Running;
                row.op = Some(op);
                row.current = event.current;
                row.max = event.max;
                row.message = event.message;
            }
        }
    }

    fn finish(&mut self, path: &str, error: Option<String>) {
        if let Some(&i) = self.index.get(path) {
            let row = &mut self.rows[i];
            row.state = if error.is_some() {
                RepoState::Errored
            } else {
                RepoState::Done
            };
            row.error = error;
        }
    }

    fn render(&mut self) {
        if self.silent {
            return;
        }
        for (row, bar) in self.rows.iter().zip(&self.bars) {
            if bar.is_finished() {
                continue;
            }
            bar.set_length(row.max.unwrap_or(0));
            bar.set_position(row.current);
            bar.set_message(row.summary());
        }
    }

    /// Freeze every bar on its final line.
    fn finish_all(&mut self) {
        for (row, bar) in self.rows.iter().zip(&self.bars) {
            match row.state {
                RepoState::Done => {
                    bar.set_length(1);
                    bar.set_position(1);
                    bar.finish_with_message(format!("{} done", "✓".green()));
                }
                RepoState::Errored => bar.abandon_with_message(format!(
                    "{} {}",
                    "✗".red(),
                    row.error.as_deref().unwrap_or("failed")
                )),
                RepoState::Pending | RepoState::Running => bar.abandon_with_message(row.summary()),
            }
        }
    }
}

/// Builds one [`ProgressBoard`] per batch.
#[derive(Debug, Clone, Copy)]
pub struct ProgressBoardFactory {
    silent: bool,
}

impl ProgressBoardFactory {
    pub fn new(silent: bool) -> Self {
        Self { silent }
    }

    /// Draw only when stderr is a terminal.
    pub fn for_stderr() -> Self {
        Self::new(!console::Term::stderr().is_term())
    }
}

impl ProgressViewFactory for ProgressBoardFactory {
    fn create(&self, rows: Vec<(String, String)>) -> Box<dyn ProgressView> {
        Box::new(ProgressBoard::new(rows, self.silent))
    }
}

fn truncate(label: &str, width: usize) -> String {
    if label.chars().count() <= width {
        return label.to_string();
    }
    let keep = width.saturating_sub(1);
    let tail: String = label
        .chars()
        .rev()
        .take(keep)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{tail}")
}
