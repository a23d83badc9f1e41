mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{lock::LockSubcommand, record::RecordSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "crmsafe",
    about = "Apply reviewed CRM change plans under a rate limit and a portal lock, with resume and rollback",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .crmsafe/ or .git/)
    #[arg(long, global = true, env = "CRMSAFE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Portal (tenant) id; overrides portal_id in config
    #[arg(long, global = true, env = "CRMSAFE_PORTAL")]
    portal: Option<String>,

    /// API access token
    #[arg(long, global = true, env = "CRMSAFE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply an action plan
    Execute {
        /// Path to the action plan JSON
        #[arg(long)]
        plan: PathBuf,

        /// Stop at the first failed action instead of continuing
        #[arg(long)]
        abort_on_failure: bool,

        /// Skip actions that require confirmation
        #[arg(long)]
        skip_unconfirmed: bool,
    },

    /// Continue an interrupted execution after its checkpoint
    Resume {
        /// Path to the action plan JSON
        #[arg(long)]
        plan: PathBuf,

        /// Execution record to resume (default: latest resumable run of the plan)
        #[arg(long)]
        record: Option<PathBuf>,
    },

    /// Restore the original values captured by an execution
    Rollback {
        /// Execution record to roll back
        #[arg(long)]
        record: PathBuf,
    },

    /// Inspect or clear the execution lock
    Lock {
        #[command(subcommand)]
        subcommand: LockSubcommand,
    },

    /// List and show execution records
    Record {
        #[command(subcommand)]
        subcommand: RecordSubcommand,
    },

    /// Show effective config, lock state and record count
    Status,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Execute { .. } | Commands::Resume { .. } | Commands::Rollback { .. } => {
            tracing::Level::INFO
        }
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let ctx = cmd::Context {
        root,
        portal: cli.portal,
        token: cli.token,
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Execute {
            plan,
            abort_on_failure,
            skip_unconfirmed,
        } => cmd::execute::run(&ctx, &plan, abort_on_failure, skip_unconfirmed),
        Commands::Resume { plan, record } => cmd::resume::run(&ctx, &plan, record.as_deref()),
        Commands::Rollback { record } => cmd::rollback::run(&ctx, &record),
        Commands::Lock { subcommand } => cmd::lock::run(&ctx, subcommand),
        Commands::Record { subcommand } => cmd::record::run(&ctx, subcommand),
        Commands::Status => cmd::status::run(&ctx),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
