//! # Topic discovery CLI (`topics`)
//!
//! Manages document collections and runs topic discovery jobs over them.
//!
//! ## Usage
//!
//! ```bash
//! topics --config ./config/topics.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `topics init` | Create the SQLite database and schema |
//! | `topics collection create <name>` | Create a collection, printing its id |
//! | `topics collection list` | List collections |
//! | `topics ingest <collection_id> <path>` | Add a file or directory of documents |
//! | `topics discover <collection_id>` | Enqueue and run a discovery job |
//! | `topics run-job <job_id>` | Run an already enqueued job |
//! | `topics job <job_id>` | Show a job's status and progress |
//! | `topics list <collection_id>` | Show the current topics |
//! | `topics cite <marker>` | Resolve a `D{doc}-C{index}` citation |
//!
//! Logs go to stderr and honor `RUST_LOG`, falling back to `[logging].level`.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use topic_discovery::config;

#[derive(Parser)]
#[command(
    name = "topics",
    about = "Discover, label and relate topics in document collections",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/topics.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Create or list collections.
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Load a text/markdown file or directory into a collection.
    ///
    /// Directories are walked recursively using the `[ingest]` globs.
    /// The collection is marked stale until its next successful discovery.
    Ingest { collection_id: i64, path: PathBuf },

    /// Enqueue a discovery job for a collection and run it now.
    ///
    /// Exits non-zero when the job ends FAILED; the previous topics stay
    /// in place.
    Discover { collection_id: i64 },

    /// Run an existing job. Jobs that are no longer PENDING are reported
    /// as they are.
    RunJob { job_id: i64 },

    /// Show a job's status, progress, error and timestamps.
    Job { job_id: i64 },

    /// List the collection's topics with insights, documents and
    /// related topics.
    List {
        collection_id: i64,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Resolve citation markers such as `D3-C1` or `[ID: D3-C1]`.
    Cite { marker: String },
}

#[derive(Subcommand)]
enum CollectionAction {
    Create {
        name: String,

        #[arg(long)]
        description: Option<String>,
    },
    List,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => commands::init(&cfg).await?,
        Commands::Collection { action } => match action {
            CollectionAction::Create { name, description } => {
                commands::create_collection(&cfg, &name, description.as_deref()).await?
            }
            CollectionAction::List => commands::list_collections(&cfg).await?,
        },
        Commands::Ingest {
            collection_id,
            path,
        } => commands::ingest(&cfg, collection_id, &path).await?,
        Commands::Discover { collection_id } => commands::discover(&cfg, collection_id).await?,
        Commands::RunJob { job_id } => commands::run_job(&cfg, job_id).await?,
        Commands::Job { job_id } => commands::show_job(&cfg, job_id).await?,
        Commands::List {
            collection_id,
            json,
        } => commands::list_topics(&cfg, collection_id, json).await?,
        Commands::Cite { marker } => commands::cite(&cfg, &marker).await?,
    }

    Ok(())
}
