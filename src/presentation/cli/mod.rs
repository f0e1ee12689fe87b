use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;

use crate::application::services::progress_view::ProgressViewFactory;
use crate::application::use_cases::environment::Environment;
use crate::application::use_cases::foreach_command::{ForeachResult, Operation};
use crate::application::use_cases::status_check::{RepositoryState, StatusResult};
use crate::domain::value_objects::repo_filter::{ClonedSelector, RepoFilter};
use crate::infrastructure::filesystem::config_store::RegistryStore;
use crate::presentation::ui::display::{helpers, DisplayHelper};
use crate::presentation::ui::progress_board::ProgressBoardFactory;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    " ",
    env!("BUILD_DATE"),
    ")"
);

/// Output format options for status command
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table (default)
    Text,
    Json,
    Yaml,
}

/// repofleet - keep a fleet of git repositories in sync from one manifest
#[derive(Debug, Parser)]
#[command(name = "repofleet")]
#[command(about = "Keep a fleet of git repositories in sync from one manifest")]
#[command(version, long_version = LONG_VERSION)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Environment to operate on (defaults to the enclosing one, then the current one)
    #[arg(short, long, global = true, env = "REPOFLEET_ENV")]
    pub env: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Working directory (defaults to current directory)
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Repository selection shared by batch commands.
#[derive(Debug, Clone, Args)]
pub struct Selection {
    /// Case-insensitive regexes matched against repository name or path
    pub patterns: Vec<String>,

    /// Only repositories with local changes
    #[arg(long)]
    pub changed: bool,
}

impl Selection {
    fn filter(&self) -> Result<RepoFilter> {
        Ok(RepoFilter::new(&self.patterns)?.changed_only(self.changed))
    }
}

/// Pool and timeout overrides for batch commands.
#[derive(Debug, Clone, Args)]
pub struct BatchOptions {
    /// Number of repositories processed at once
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Give up on a repository after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create or re-initialize an environment
    Init {
        name: String,

        /// Root directory (defaults to ./<name>)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Manifest file or http(s) URL whose entries are merged in
        #[arg(long)]
        seed: Option<String>,

        /// Git remote that stores snapshot tags
        #[arg(long)]
        snapshot_remote: Option<String>,

        /// Restore this snapshot right after initializing
        #[arg(long)]
        tag: Option<String>,

        /// Clone with truncated history when restoring
        #[arg(long, requires = "tag")]
        shallow: bool,
    },

    /// Make an environment current
    Use { name: String },

    /// Forget an environment
    Drop {
        name: String,

        /// Also delete the environment directory
        #[arg(long)]
        purge: bool,
    },

    /// List known environments
    Env,

    /// Show repository status
    Status {
        #[command(flatten)]
        selection: Selection,

        /// Output format (text, json, yaml)
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Clone, fetch, check out, rebase and push every repository
    Sync {
        #[command(flatten)]
        selection: Selection,

        #[command(flatten)]
        batch: BatchOptions,

        /// Clone with truncated history
        #[arg(long, conflicts_with = "full")]
        shallow: bool,

        /// Clone with full history even if the environment defaults to shallow
        #[arg(long)]
        full: bool,
    },

    /// Clone repositories that are missing on disk
    Clone {
        #[command(flatten)]
        selection: Selection,

        #[command(flatten)]
        batch: BatchOptions,

        #[arg(long)]
        shallow: bool,
    },

    /// Fetch every repository
    Fetch {
        #[command(flatten)]
        selection: Selection,

        #[command(flatten)]
        batch: BatchOptions,
    },

    /// Check out each repository's manifest ref
    Checkout {
        #[command(flatten)]
        selection: Selection,

        #[command(flatten)]
        batch: BatchOptions,
    },

    /// Rebase local work onto upstream
    Merge {
        #[command(flatten)]
        selection: Selection,

        #[command(flatten)]
        batch: BatchOptions,
    },

    /// Push branches carrying unpublished commits
    Push {
        #[command(flatten)]
        selection: Selection,

        #[command(flatten)]
        batch: BatchOptions,
    },

    /// Apply a snapshot to the manifest and sync
    Restore {
        /// Snapshot tag, branch or commit
        reference: String,

        #[arg(long)]
        shallow: bool,

        #[command(flatten)]
        batch: BatchOptions,
    },

    /// Record the current manifest as a named snapshot
    Tag {
        name: String,

        /// Pin every cloned repository to its exact commit
        #[arg(long)]
        strict: bool,

        /// Move an existing tag
        #[arg(short, long)]
        force: bool,

        /// Restore this snapshot first
        #[arg(long)]
        from: Option<String>,
    },

    /// List snapshot tags
    Tags {
        /// Delete this tag instead of listing
        #[arg(long, value_name = "NAME")]
        delete: Option<String>,
    },

    /// Print the manifest, optionally pinned to exact commits
    Freeze {
        #[arg(long)]
        strict: bool,
    },

    /// Add a repository to the manifest
    Add {
        /// Path under the source root
        path: String,

        /// Remote URL or owner/name shorthand
        repo: String,

        /// Branch, tag or commit to track
        #[arg(short, long = "ref")]
        reference: Option<String>,
    },

    /// Remove a repository from the manifest
    Remove {
        path: String,

        /// Also delete the working tree
        #[arg(long)]
        delete: bool,
    },

    /// Print the directory of the first matching repository, or the source root
    Path { pattern: Option<String> },

    /// Print shell exports for the environment
    ExportEnv,
}

/// CLI application runner
pub struct CliApp {
    cli: Cli,
    display: DisplayHelper,
}

impl CliApp {
    pub fn new(cli: Cli) -> Self {
        let display = helpers::auto_display(cli.no_color);
        Self { cli, display }
    }

    pub async fn run(self) -> Result<()> {
        if let Err(e) = self.handle_command().await {
            self.display.error(&format!("{e:#}"));
            exit(1);
        }
        Ok(())
    }

    fn cwd(&self) -> Result<PathBuf> {
        match &self.cli.directory {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir().context("cannot determine current directory"),
        }
    }

    fn registry(&self) -> Result<RegistryStore> {
        Ok(RegistryStore::from_env()?)
    }

    fn environment(&self) -> Result<Environment> {
        let registry = self.registry()?;
        Ok(Environment::resolve(
            &registry,
            self.cli.env.as_deref(),
            &self.cwd()?,
        )?
        .with_progress_view(progress_view()))
    }

    fn batch_environment(&self, batch: &BatchOptions) -> Result<Environment> {
        Ok(self
            .environment()?
            .with_max_parallel(batch.jobs)
            .with_timeout_secs(batch.timeout))
    }

    async fn handle_command(&self) -> Result<()> {
        match &self.cli.command {
            Commands::Init {
                name,
                path,
                seed,
                snapshot_remote,
                tag,
                shallow,
            } => {
                self.handle_init(
                    name,
                    path.as_deref(),
                    seed.as_deref(),
                    snapshot_remote.clone(),
                    tag.as_deref(),
                    *shallow,
                )
                .await
            }
            Commands::Use { name } => {
                Environment::use_env(&self.registry()?, name)?;
                self.display.success(&format!("Now using {}", name.bold()));
                Ok(())
            }
            Commands::Drop { name, purge } => {
                Environment::drop_env(&self.registry()?, name, *purge)?;
                self.display.success(&format!("Dropped {name}"));
                Ok(())
            }
            Commands::Env => self.handle_env(),
            Commands::Status { selection, output } => self.handle_status(selection, *output),
            Commands::Sync {
                selection,
                batch,
                shallow,
                full,
            } => {
                let shallow = match (*shallow, *full) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                };
                let env = self.batch_environment(batch)?;
                let result = env.sync(selection.filter()?, shallow).await?;
                self.report_batch("sync", &result)
            }
            Commands::Clone {
                selection,
                batch,
                shallow,
            } => {
                let operation = if *shallow {
                    Operation::ShallowClone
                } else {
                    Operation::Clone
                };
                let filter = selection.filter()?.with_cloned(ClonedSelector::Missing);
                self.run_batch(operation, filter, batch).await
            }
            Commands::Fetch { selection, batch } => {
                self.run_batch(Operation::Fetch, selection.filter()?, batch).await
            }
            Commands::Checkout { selection, batch } => {
                self.run_batch(Operation::Checkout, selection.filter()?, batch).await
            }
            Commands::Merge { selection, batch } => {
                self.run_batch(Operation::MergeFromRemote, selection.filter()?, batch)
                    .await
            }
            Commands::Push { selection, batch } => {
                self.run_batch(Operation::Push, selection.filter()?, batch).await
            }
            Commands::Restore {
                reference,
                shallow,
                batch,
            } => {
                let mut env = self.batch_environment(batch)?;
                let result = env.restore(reference, shallow.then_some(true)).await?;
                self.report_batch(&format!("restore {reference}"), &result)
            }
            Commands::Tag {
                name,
                strict,
                force,
                from,
            } => {
                let mut env = self.environment()?;
                let receipt = env.tag(name, *strict, *force, from.as_deref()).await?;
                let short = receipt.commit.get(..10).unwrap_or(&receipt.commit);
                let pushed = if receipt.pushed { ", pushed" } else { "" };
                self.display
                    .success(&format!("Tagged {} at {short}{pushed}", receipt.name.bold()));
                Ok(())
            }
            Commands::Tags { delete: Some(name) } => {
                self.environment()?.delete_tag(name)?;
                self.display.success(&format!("Deleted tag {name}"));
                Ok(())
            }
            Commands::Tags { delete: None } => {
                for tag in self.environment()?.tags()? {
                    println!("{tag}");
                }
                Ok(())
            }
            Commands::Freeze { strict } => {
                print!("{}", self.environment()?.freeze(*strict)?.freeze());
                Ok(())
            }
            Commands::Add {
                path,
                repo,
                reference,
            } => {
                let mut env = self.environment()?;
                let entry = env.add_repo(path, repo, reference.as_deref())?;
                self.display.success(&format!(
                    "Added {} at {} ({})",
                    self.display.format_repo(&entry.repo),
                    self.display.format_path(path),
                    self.display.format_branch(&entry.reference)
                ));
                Ok(())
            }
            Commands::Remove { path, delete } => {
                let mut env = self.environment()?;
                env.remove_repo(path, *delete)?;
                self.display
                    .success(&format!("Removed {}", self.display.format_path(path)));
                let tree = env.srcroot().join(path);
                if !*delete && tree.exists() {
                    self.display.warning(&format!(
                        "working tree kept at {}; pass --delete to remove it",
                        tree.display()
                    ));
                }
                Ok(())
            }
            Commands::Path { pattern } => {
                let env = self.environment()?;
                let dir = match pattern {
                    Some(pattern) => env.repo_path(pattern)?,
                    None => env.srcroot(),
                };
                println!("{}", dir.display());
                Ok(())
            }
            Commands::ExportEnv => {
                for (key, value) in self.environment()?.env_vars() {
                    println!("export {key}={}", shell_quote(&value));
                }
                Ok(())
            }
        }
    }

    async fn handle_init(
        &self,
        name: &str,
        path: Option<&Path>,
        seed: Option<&str>,
        snapshot_remote: Option<String>,
        tag: Option<&str>,
        shallow: bool,
    ) -> Result<()> {
        let root = match path {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.cwd()?.join(path),
            None => self.cwd()?.join(name),
        };
        let mut env = Environment::init(&self.registry()?, name, &root, seed, snapshot_remote)
            .await?
            .with_progress_view(progress_view());
        self.display.success(&format!(
            "Initialized {} at {} with {} repositories",
            name.bold(),
            self.display.format_path(&env.root().display().to_string()),
            env.manifest().len()
        ));
        match tag {
            Some(tag) => {
                let result = env.restore(tag, shallow.then_some(true)).await?;
                self.report_batch(&format!("restore {tag}"), &result)
            }
            None => Ok(()),
        }
    }

    fn handle_env(&self) -> Result<()> {
        let listing = Environment::list(&self.registry()?)?;
        if listing.is_empty() {
            self.display.info("No environments registered; run `repofleet init <name>`");
            return Ok(());
        }
        for env in listing {
            let marker = if env.current { "*" } else { " " };
            println!("{marker} {:<16} {}", env.name, env.record.path.display());
        }
        Ok(())
    }

    fn handle_status(&self, selection: &Selection, output: OutputFormat) -> Result<()> {
        let status = self.environment()?.status(selection.filter()?)?;
        match output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&status)?),
            OutputFormat::Text => self.print_status(&status),
        }
        Ok(())
    }

    fn print_status(&self, status: &StatusResult) {
        let rows: Vec<Vec<String>> = status
            .rows
            .iter()
            .map(|row| {
                let branch = match (&row.branch, &row.head) {
                    (Some(branch), _) => branch.clone(),
                    (None, Some(head)) => format!("({})", head.get(..10).unwrap_or(head)),
                    (None, None) => "-".to_string(),
                };
                let state = match row.state() {
                    RepositoryState::Clean => "clean".to_string(),
                    RepositoryState::Dirty => row.markers(),
                    RepositoryState::Missing => "missing".to_string(),
                    RepositoryState::WrongBranch => format!("expected {}", row.expected_ref),
                    RepositoryState::Error => row.error.clone().unwrap_or_default(),
                };
                vec![row.path.clone(), branch, state]
            })
            .collect();
        self.display.print_table(&["path", "branch", "state"], &rows);
        if self.cli.verbose {
            println!(
                "\n{} clean, {} changed, {} missing, {} errors",
                status.clean_count, status.dirty_count, status.missing_count, status.error_count
            );
        }
    }

    async fn run_batch(
        &self,
        operation: Operation,
        filter: RepoFilter,
        batch: &BatchOptions,
    ) -> Result<()> {
        let env = self.batch_environment(batch)?;
        let result = env.foreach(operation, filter).await?;
        self.report_batch(operation.label(), &result)
    }

    fn report_batch(&self, label: &str, result: &ForeachResult) -> Result<()> {
        let elapsed = self
            .display
            .format_duration(std::time::Duration::from_millis(result.total_elapsed_ms));
        if result.total_count() == 0 {
            self.display.info("No repositories selected");
            return Ok(());
        }
        for failed in result.failed_results() {
            self.display.error(&format!(
                "{}: {}",
                self.display.format_repo(&failed.path),
                failed.error.as_deref().unwrap_or("failed")
            ));
        }
        if result.is_success() {
            self.display.success(&format!(
                "{label}: {} repositories in {elapsed}",
                result.succeeded
            ));
            Ok(())
        } else {
            Err(anyhow!(
                "{label}: {} of {} repositories failed",
                result.failed,
                result.total_count()
            ))
        }
    }
}

fn progress_view() -> Arc<dyn ProgressViewFactory> {
    Arc::new(ProgressBoardFactory::for_stderr())
}

/// Single-quote `value` for POSIX shells.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sync_with_patterns_and_jobs() {
        let cli = Cli::try_parse_from(["repofleet", "sync", "core", "^tools/", "-j", "4", "--shallow"])
            .unwrap();
        match cli.command {
            Commands::Sync {
                selection,
                batch,
                shallow,
                full,
            } => {
                assert_eq!(selection.patterns, vec!["core", "^tools/"]);
                assert_eq!(batch.jobs, Some(4));
                assert!(shallow);
                assert!(!full);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_shallow_conflicts_with_full() {
        assert!(Cli::try_parse_from(["repofleet", "sync", "--shallow", "--full"]).is_err());
    }

    #[test]
    fn test_parse_tag_options() {
        let cli = Cli::try_parse_from([
            "repofleet", "-e", "work", "tag", "release", "--strict", "--force", "--from", "develop",
        ])
        .unwrap();
        assert_eq!(cli.env.as_deref(), Some("work"));
        match cli.command {
            Commands::Tag {
                name,
                strict,
                force,
                from,
            } => {
                assert_eq!(name, "release");
                assert!(strict && force);
                assert_eq!(from.as_deref(), Some("develop"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_init_and_tags() {
        let cli = Cli::try_parse_from(["repofleet", "init", "work", "--tag", "release", "--shallow"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Init { tag: Some(ref tag), shallow: true, .. } if tag == "release"
        ));
        assert!(Cli::try_parse_from(["repofleet", "init", "work", "--shallow"]).is_err());

        let cli = Cli::try_parse_from(["repofleet", "tags", "--delete", "old"]).unwrap();
        assert!(matches!(cli.command, Commands::Tags { delete: Some(ref name) } if name == "old"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/srv/work"), "'/srv/work'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
