use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use daokit::cmd;
use daokit::cmd::check::CheckArgs;
use daokit::cmd::handoff::{HandoffArgs, HandoffMode};
use daokit::cmd::replay::{ReplayArgs, ReplaySource};
use daokit::cmd::run::RunArgs;
use daokit::cmd::status::StatusArgs;
use daokit::cmd::takeover::TakeoverArgs;
use daokit::cmd::CliError;

#[derive(Parser)]
#[command(name = "daokit")]
#[command(version, about = "Deterministic, evidence-gated orchestration engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the runtime directory tree and empty state files
    Init {
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Validate layout, persisted state, and heartbeat health
    Check {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long, default_value = "artifacts")]
        artifact_root: String,
        #[arg(long, default_value_t = 300)]
        check_interval: u64,
        #[arg(long, default_value_t = 900)]
        warning_after: u64,
        #[arg(long, default_value_t = 1200)]
        stale_after: u64,
        #[arg(long)]
        json: bool,
    },
    /// Start a run
    Run {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        task_id: String,
        /// Run identifier (derived from the task id when omitted)
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        goal: String,
        #[arg(long, default_value = "S1")]
        step_id: String,
        #[arg(long, default_value = "default")]
        lane: String,
        /// Lease owner thread id
        #[arg(long)]
        thread_id: Option<String>,
        #[arg(long, default_value_t = 1200)]
        lease_ttl: u64,
        /// Leave the lease ACTIVE and exit with the interruption code
        #[arg(long)]
        simulate_interruption: bool,
        /// Run without registering a process lease
        #[arg(long)]
        no_lease: bool,
    },
    /// Show ledger, heartbeat, and lease status
    Status {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        task_id: Option<String>,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Replay events or snapshots from the state ledger
    Replay {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long, value_enum, default_value = "events")]
        source: ReplaySourceArg,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Accept succession for a run after interruption
    Takeover {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        task_id: Option<String>,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        successor_thread_id: Option<String>,
        #[arg(long)]
        successor_pid: Option<u32>,
        /// Optional TTL override applied to adopted leases
        #[arg(long)]
        lease_ttl: Option<u64>,
    },
    /// Create or apply a handoff package
    Handoff {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long, conflicts_with = "apply")]
        create: bool,
        #[arg(long)]
        apply: bool,
        /// Package path, relative to the root unless absolute
        #[arg(long, default_value = "handoff/handoff_package.json")]
        path: String,
        /// Include accepted steps in the resumable set
        #[arg(long)]
        include_accepted_steps: bool,
        /// Override evidence output paths (repeatable)
        #[arg(long = "evidence-path")]
        evidence_paths: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ReplaySourceArg {
    Events,
    Snapshots,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Every subcommand shares one interruption contract: Ctrl+C prints the
    // stable reason code and exits 130.
    if let Err(handler_error) = ctrlc::set_handler(|| {
        eprintln!("E_INTERRUPTED: interrupted by user");
        std::process::exit(130);
    }) {
        tracing::warn!("failed to register interrupt handler: {handler_error}");
    }

    let cli = Cli::parse();
    let outcome = dispatch(cli);
    match outcome {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(cli_error) => {
            eprintln!("{}", console::style(&cli_error).red());
            std::process::exit(cli_error.exit_code);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli.command {
        Commands::Init { root } => cmd::cmd_init(&root),
        Commands::Check {
            root,
            artifact_root,
            check_interval,
            warning_after,
            stale_after,
            json,
        } => cmd::cmd_check(&CheckArgs {
            root: &root,
            artifact_root: &artifact_root,
            check_interval,
            warning_after,
            stale_after,
            json,
        }),
        Commands::Run {
            root,
            task_id,
            run_id,
            goal,
            step_id,
            lane,
            thread_id,
            lease_ttl,
            simulate_interruption,
            no_lease,
        } => cmd::cmd_run(&RunArgs {
            root: &root,
            task_id: &task_id,
            run_id: run_id.as_deref(),
            goal: &goal,
            step_id: &step_id,
            lane: &lane,
            thread_id: thread_id.as_deref(),
            lease_ttl,
            simulate_interruption,
            no_lease,
        }),
        Commands::Status {
            root,
            task_id,
            run_id,
            json,
        } => cmd::cmd_status(&StatusArgs {
            root: &root,
            task_id: task_id.as_deref(),
            run_id: run_id.as_deref(),
            json,
        }),
        Commands::Replay {
            root,
            source,
            limit,
            json,
        } => cmd::cmd_replay(&ReplayArgs {
            root: &root,
            source: match source {
                ReplaySourceArg::Events => ReplaySource::Events,
                ReplaySourceArg::Snapshots => ReplaySource::Snapshots,
            },
            limit,
            json,
        }),
        Commands::Takeover {
            root,
            task_id,
            run_id,
            successor_thread_id,
            successor_pid,
            lease_ttl,
        } => cmd::cmd_takeover(&TakeoverArgs {
            root: &root,
            task_id: task_id.as_deref(),
            run_id: run_id.as_deref(),
            successor_thread_id: successor_thread_id.as_deref(),
            successor_pid: successor_pid.unwrap_or_else(std::process::id),
            lease_ttl,
        }),
        Commands::Handoff {
            root,
            create,
            apply,
            path,
            include_accepted_steps,
            evidence_paths,
        } => {
            let mode = if apply {
                HandoffMode::Apply
            } else {
                // --create is the default when neither flag is given.
                let _ = create;
                HandoffMode::Create
            };
            cmd::cmd_handoff(&HandoffArgs {
                root: &root,
                mode,
                package_path: &path,
                include_accepted_steps,
                evidence_paths,
            })
        }
    }
}
