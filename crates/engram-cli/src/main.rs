use std::path::PathBuf;

use clap::{Parser, Subcommand};
use engram::MemoryService;
use engram::config::Config;
use engram::storage::{LanceIndex, SqliteStore};
use engram_cli::commands::{
    CompactCommand, IngestCommand, MemoryCommand, RepairCommand, RetrieveCommand, StatsCommand,
};
use engram_cli::error::CliResult;
use engram_cli::output::OutputFormat;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "engram-cli")]
#[command(about = "Engram CLI - Inspection and maintenance tool for the engram memory store")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, short = 'd', global = true, help = "Path to data directory")]
    pub data_dir: Option<PathBuf>,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Memory record commands")]
    Memory(MemoryCommand),

    #[clap(about = "Show storage statistics")]
    Stats(StatsCommand),

    #[clap(about = "Run a compaction cycle now")]
    Compact(CompactCommand),

    #[clap(about = "Re-index failed and stale records")]
    Repair(RepairCommand),

    #[clap(about = "Retrieve memories for a query")]
    Retrieve(RetrieveCommand),

    #[clap(about = "Store a conversation turn")]
    Ingest(IngestCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(ref data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir.clone();
    }

    match &cli.command {
        Command::Memory(cmd) => {
            let store = open_store(&config)?;
            cmd.execute(&store, format).await
        }
        Command::Stats(cmd) => {
            let store = open_store(&config)?;
            let index = LanceIndex::open(
                &config.storage.index_path(),
                &config.storage.vector_table,
                config.inference.embedding_dimension,
            )
            .await?;
            cmd.execute(&store, &index, format).await
        }
        Command::Compact(cmd) => cmd.execute(&MemoryService::open(config).await?, format).await,
        Command::Repair(cmd) => cmd.execute(&MemoryService::open(config).await?, format).await,
        Command::Retrieve(cmd) => cmd.execute(&MemoryService::open(config).await?, format).await,
        Command::Ingest(cmd) => cmd.execute(&MemoryService::open(config).await?, format).await,
    }
}

fn open_store(config: &Config) -> CliResult<SqliteStore> {
    let path = config.storage.database_path();
    if !path.exists() {
        return Err(format!("No memory database at {}", path.display()).into());
    }
    Ok(SqliteStore::open(&path)?)
}
