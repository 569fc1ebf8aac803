//! # Upload Harness CLI (`uph`)
//!
//! ## Usage
//!
//! ```bash
//! uph --config ./config/uph.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `uph init` | Create the SQLite database and run schema migrations |
//! | `uph scan` | Seed lifecycle records from the configured directory |
//! | `uph run` | Recover interrupted work, then upload eligible files |
//! | `uph recover` | Only resolve records left in flight by a crash |
//! | `uph status` | Counts per lifecycle state and failed files |
//! | `uph history <file>` | Audit log of one file |
//! | `uph reset <file>` / `--failed` | Force records back to `UNTRACKED` |
//! | `uph reconcile` | Compare indexed records with the remote listing |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `upload_harness=info`).

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use upload_harness::pipeline::{self, UploadOptions};
use upload_harness::progress::ProgressMode;
use upload_harness::{config, migrate, reconcile, status};

/// Upload Harness CLI — crash-safe bulk upload into a remote file search
/// store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/uph.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "uph",
    about = "Upload Harness — crash-safe bulk upload into a remote file search store",
    version,
    long_about = "Upload Harness tracks every local file through a durable lifecycle \
    (UNTRACKED → UPLOADING → PROCESSING → INDEXED), paces remote calls under a circuit \
    breaker, and resolves interrupted uploads on the next start."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/uph.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProgressArg {
    Auto,
    Off,
    Human,
    Json,
}

impl ProgressArg {
    fn mode(self) -> ProgressMode {
        match self {
            ProgressArg::Auto => ProgressMode::default_for_tty(),
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Scan `[scan].root` and seed lifecycle records.
    ///
    /// New files become UNTRACKED, changed or missing indexed files become
    /// STALE, reappearing orphans become UNTRACKED again.
    Scan,

    /// Upload every eligible file.
    ///
    /// Takes the writer lock, resolves records left in flight by a
    /// previous crash, then drives UNTRACKED and STALE files to INDEXED.
    /// Ctrl-C once to drain, twice to exit immediately.
    Run {
        /// Skip startup recovery.
        #[arg(long)]
        no_recover: bool,

        /// Maximum number of files to process.
        #[arg(long)]
        limit: Option<usize>,

        /// Progress output on stderr.
        #[arg(long, value_enum, default_value = "auto")]
        progress: ProgressArg,

        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Resolve records left UPLOADING or PROCESSING by a crash.
    Recover {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show counts per lifecycle state and failed files.
    Status {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the transition history of one file.
    History {
        /// File id (path relative to the scan root).
        file: String,
    },

    /// Force records back to UNTRACKED.
    Reset {
        /// File id to reset.
        file: Option<String>,

        /// Reset every FAILED record.
        #[arg(long)]
        failed: bool,
    },

    /// Compare INDEXED records with the remote document listing.
    Reconcile {
        /// Force-reset records whose document is missing remotely.
        #[arg(long)]
        reset_missing: bool,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("upload_harness=info,warn"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Scan => {
            pipeline::run_scan(&cfg).await?;
        }
        Commands::Run {
            no_recover,
            limit,
            progress,
            json,
        } => {
            let options = UploadOptions {
                recover: !no_recover,
                limit,
                progress: progress.mode(),
                json,
            };
            pipeline::run_upload(&cfg, options).await?;
        }
        Commands::Recover { json } => {
            pipeline::run_recover(&cfg, json).await?;
        }
        Commands::Status { json } => {
            status::run_status(&cfg, json).await?;
        }
        Commands::History { file } => {
            status::run_history(&cfg, &file).await?;
        }
        Commands::Reset { file, failed } => {
            pipeline::run_reset(&cfg, file.as_deref(), failed).await?;
        }
        Commands::Reconcile {
            reset_missing,
            json,
        } => {
            reconcile::run_reconcile(&cfg, reset_missing, json).await?;
        }
    }

    Ok(())
}
