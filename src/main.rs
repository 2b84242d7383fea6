use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vote_tally::commands::{self, load_config, CommandResult};

#[derive(Parser)]
#[clap(about = "Live vote tally and ballot statistics")]
struct Opts {
    /// Engine config file (JSON). Defaults apply when omitted.
    #[clap(long, global = true)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the SQLite database and schema
    Init {
        /// SQLite database path
        database_path: PathBuf,
    },
    /// Load candidate lists from a roster JSON file
    IngestRoster {
        database_path: PathBuf,
        roster_path: PathBuf,
    },
    /// Append ballot groups from a ballot JSON file
    IngestBallots {
        database_path: PathBuf,
        ballots_path: PathBuf,
    },
    /// Print current standings and ballot statistics
    Report {
        database_path: PathBuf,
        #[clap(long)]
        json: bool,
        /// Print stage timings after the report
        #[clap(long)]
        metrics: bool,
    },
    /// Record check-marks for candidates and post them
    Mark {
        database_path: PathBuf,
        /// Candidate ids
        #[clap(required = true)]
        candidates: Vec<i64>,
        /// Marks per candidate
        #[clap(long, default_value = "1")]
        count: u32,
    },
    /// Follow the database live until interrupted
    Watch {
        database_path: PathBuf,
        #[clap(long)]
        json: bool,
    },
    /// Run several operator sessions against one in-memory store
    Simulate {
        #[clap(long, default_value = "3")]
        sessions: usize,
        #[clap(long, default_value = "45")]
        marks: u32,
        #[clap(long, default_value = "25")]
        ballots: u32,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .with_target(false)
        .init();

    let opts = Opts::parse();
    if let Err(e) = run(opts).await {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> CommandResult {
    match opts.command {
        Command::Init { database_path } => commands::init(&database_path).await,
        Command::IngestRoster {
            database_path,
            roster_path,
        } => commands::ingest_roster(&database_path, &roster_path).await,
        Command::IngestBallots {
            database_path,
            ballots_path,
        } => commands::ingest_ballots(&database_path, &ballots_path).await,
        Command::Report {
            database_path,
            json,
            metrics,
        } => {
            let config = load_config(opts.config.as_deref())?;
            commands::report(&database_path, config, json, metrics).await
        }
        Command::Mark {
            database_path,
            candidates,
            count,
        } => {
            let config = load_config(opts.config.as_deref())?;
            commands::mark(&database_path, config, &candidates, count).await
        }
        Command::Watch {
            database_path,
            json,
        } => {
            let config = load_config(opts.config.as_deref())?;
            commands::watch(&database_path, config, json).await
        }
        Command::Simulate {
            sessions,
            marks,
            ballots,
        } => {
            let config = load_config(opts.config.as_deref())?;
            commands::simulate(config, sessions, marks, ballots).await
        }
    }
}
