use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use domtally::cli::{analyze, batches, inspect, run, top};
use domtally::config::Config;
use domtally::store::AggregateStore;

#[derive(Parser)]
#[command(name = "domtally")]
#[command(about = "Attribute DOM API usage in browser traces to scripts and origins")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "domtally.yaml")]
    config: String,

    /// Database path (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the configured jobs, then analyse and store their traces
    Run,

    /// Analyse traces already present in a directory
    Analyze {
        /// Trace directory (defaults to reports.dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Delete traces once they are stored
        #[arg(long)]
        clear: bool,
    },

    /// Print the attribution of a single trace as JSON
    Inspect {
        /// Trace file (.json or .json.zst)
        path: PathBuf,

        /// Include processes without any http(s) page
        #[arg(long)]
        all_pages: bool,
    },

    /// Most called APIs per first party and script origin
    Top {
        /// Only this first party origin
        #[arg(short, long)]
        first_party: Option<String>,

        #[arg(short, long, default_value_t = 25)]
        limit: usize,
    },

    /// List stored batches
    Batches {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Show each batch's trace files
        #[arg(long)]
        files: bool,
    },
}

/// Initialize tracing subscriber; RUST_LOG wins over --verbose
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Load config
    let config = Config::load(&cli.config)?;

    let db_path = cli.db.clone().unwrap_or_else(|| config.database_path());

    match cli.command {
        Commands::Run => {
            run::run(&config, AggregateStore::open(&db_path)?).await?;
        }
        Commands::Analyze { dir, clear } => {
            analyze::run(&config, AggregateStore::open(&db_path)?, dir, clear).await?;
        }
        Commands::Inspect { path, all_pages } => {
            inspect::run(&path, all_pages)?;
        }
        Commands::Top { first_party, limit } => {
            top::run(&AggregateStore::open(&db_path)?, first_party, limit)?;
        }
        Commands::Batches { limit, files } => {
            batches::run(&AggregateStore::open(&db_path)?, limit, files)?;
        }
    }

    Ok(())
}
