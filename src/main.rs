use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use bughunt::config::DEFAULT_CONFIG_FILE;
use bughunt::models::ModerationStatus;

mod cmd;

#[derive(Parser)]
#[command(name = "bughunt")]
#[command(version, about = "Run containerized linters against tracked git repositories")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to bughunt.toml
    #[arg(long, global = true, env = "BUGHUNT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Database file. Overrides [storage].path
    #[arg(long, global = true, env = "BUGHUNT_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database and write a default bughunt.toml if none exists
    Init,
    /// Keep repositories refreshed and schedule lint tasks until interrupted
    Scheduler,
    /// Lease and run lint tasks until interrupted
    Worker,
    /// Manage tracked repositories
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
    /// Manage linters
    Linter {
        #[command(subcommand)]
        command: LinterCommands,
    },
    /// Inspect and moderate findings
    Highlights {
        #[command(subcommand)]
        command: HighlightsCommands,
    },
    /// List lint tasks, newest first
    Tasks {
        /// Only tasks with this status (pending, succeeded, failed, skipped)
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Per-linter moderation summary
    Stats,
}

#[derive(Subcommand)]
pub enum RepoCommands {
    /// Track a repository (or change its URL/branch)
    Add {
        id: String,
        url: String,
        #[arg(long, default_value = "master")]
        branch: String,
    },
    List,
    Remove { id: String },
}

#[derive(Subcommand)]
pub enum LinterCommands {
    /// Register a linter; --image and --digest make it runnable
    Add {
        id: String,
        url: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long, requires = "digest")]
        image: Option<String>,
        #[arg(long, requires = "image")]
        digest: Option<String>,
    },
    List,
    Remove { id: String },
}

#[derive(Subcommand)]
pub enum HighlightsCommands {
    /// Print deduplicated highlights as JSON
    List {
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        linter: Option<String>,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        status: Option<ModerationStatus>,
    },
    /// Record a moderation verdict for one highlight location of a task
    Moderate {
        task_id: String,
        path: String,
        start_line: usize,
        end_line: usize,
        #[arg(long)]
        status: ModerationStatus,
        #[arg(long)]
        moderator: Option<String>,
        #[arg(long)]
        comment: Option<String>,
    },
}

fn init_logging(verbose: bool, json: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match &cli.command {
        Commands::Init => cmd::cmd_init(&cli)?,
        Commands::Scheduler => cmd::run_scheduler(&cli).await?,
        Commands::Worker => cmd::run_worker(&cli).await?,
        Commands::Repo { command } => cmd::cmd_repo(&cli, command)?,
        Commands::Linter { command } => cmd::cmd_linter(&cli, command)?,
        Commands::Highlights { command } => cmd::cmd_highlights(&cli, command)?,
        Commands::Tasks { status, limit } => cmd::cmd_tasks(&cli, status.as_deref(), *limit)?,
        Commands::Stats => cmd::cmd_stats(&cli)?,
    }

    Ok(())
}
