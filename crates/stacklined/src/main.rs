//! stacklined: the Stackline daemon.
//!
//! Runs single workflow steps for an external engine and administers the
//! ledgers:
//! - `task <step>` reads a step input document and prints its output
//! - `build` submits, runs and inspects builds
//! - `lock` recovers stuck deployment locks
//! - `targets` imports and inspects target configuration
//!
//! # Usage
//!
//! ```text
//! echo '{"env":"dev","repo":"infra"}' | stacklined task fetch-targets
//! stacklined targets import targets.toml
//! stacklined build submit infra dev --artifact ./dist --run
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use stackline_core::StacklineConfig;
use stackline_rollout::{DirParameterSource, LocalProvider};
use stackline_state::StateStore;
use stackline_tasks::{LocalEngine, Step, TaskContext};
use tracing::{debug, info};

mod commands;

const DEFAULT_LOG_FILTER: &str = "info,stacklined=debug,stackline=debug";

#[derive(Parser)]
#[command(
    name = "stacklined",
    about = "Stackline: safe multi-account deployment coordination",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = "stackline.toml")]
    config: PathBuf,

    /// Override the ledger database path from the configuration.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Log output format (logs go to stderr).
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run one workflow step. Input JSON comes from stdin unless --input is given.
    Task {
        /// Step name, e.g. acquire-lock, poll-status.
        step: Step,
        /// Read the input document from this file.
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Submit and inspect builds.
    Build {
        #[command(subcommand)]
        action: BuildAction,
    },
    /// Inspect and recover deployment locks.
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Manage target configuration.
    Targets {
        #[command(subcommand)]
        action: TargetsAction,
    },
}

#[derive(Subcommand)]
enum BuildAction {
    /// Record a new PENDING build.
    Submit {
        repo: String,
        env: String,
        /// Build artifact directory.
        #[arg(long)]
        artifact: String,
        #[arg(long, default_value = "")]
        branch: String,
        #[arg(long, default_value = "")]
        version: String,
        #[arg(long, default_value = "")]
        commit: String,
        /// Run the whole deployment workflow in-process against the local provider.
        #[arg(long)]
        run: bool,
    },
    /// Latest build of every repository in an environment.
    Latest { env: String },
    /// Show one build, or every build of a repository when no id is given.
    Show {
        repo: String,
        env: String,
        build_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// List every lock.
    List,
    /// Remove a lock regardless of its holder.
    Delete { env: String, repo: String },
    /// Remove every expired lock.
    Purge,
}

#[derive(Subcommand)]
enum TargetsAction {
    /// Import `[[targets]]` tables from a TOML file.
    Import { file: PathBuf },
    /// Expand the targets of a repository in one environment.
    Resolve { repo: String, env: String },
    /// Walk the promotion chain of a repository.
    Chain { repo: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = StacklineConfig::load_or_default(&cli.config)?;
    if let Some(path) = cli.store {
        config.store.path = path;
    }
    debug!(config = ?cli.config, store = ?config.store.path, "configuration loaded");

    let store = open_store(&config.store.path)?;

    match cli.command {
        Command::Task { step, input } => {
            let ctx = local_context(store, &config);
            commands::task::run(&ctx, step, input.as_deref()).await
        }
        Command::Build { action } => match action {
            BuildAction::Submit {
                repo,
                env,
                artifact,
                branch,
                version,
                commit,
                run,
            } => {
                let ctx = local_context(store, &config);
                let submission = commands::build::Submission {
                    repo,
                    env,
                    artifact,
                    branch,
                    version,
                    commit,
                };
                commands::build::submit(&ctx, submission, run).await
            }
            BuildAction::Latest { env } => commands::build::latest(&store, &env),
            BuildAction::Show {
                repo,
                env,
                build_id,
            } => commands::build::show(&store, &repo, &env, build_id.as_deref()),
        },
        Command::Lock { action } => match action {
            LockAction::List => commands::lock::list(&store),
            LockAction::Delete { env, repo } => commands::lock::delete(&store, &env, &repo),
            LockAction::Purge => commands::lock::purge(&store),
        },
        Command::Targets { action } => {
            let ctx = local_context(store, &config);
            match action {
                TargetsAction::Import { file } => commands::targets::import(&ctx, &file),
                TargetsAction::Resolve { repo, env } => {
                    commands::targets::resolve(&ctx, &repo, &env)
                }
                TargetsAction::Chain { repo } => commands::targets::chain(&ctx, &repo),
            }
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn open_store(path: &Path) -> anyhow::Result<StateStore> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let store = StateStore::open(path)?;
    info!(path = ?path, "state store opened");
    Ok(store)
}

/// Step context backed by the in-process provider and engine.
fn local_context(store: StateStore, config: &StacklineConfig) -> TaskContext {
    TaskContext::new(
        store,
        Arc::new(LocalProvider::default()),
        Arc::new(DirParameterSource),
        Arc::new(LocalEngine::new()),
        config.clone(),
    )
}
