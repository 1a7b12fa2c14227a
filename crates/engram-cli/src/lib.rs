pub mod commands;
pub mod error;
pub mod output;

pub use commands::{
    CompactCommand, IngestCommand, MemoryCommand, RepairCommand, RetrieveCommand, StatsCommand,
};
pub use error::{CliError, CliResult};
pub use output::{OutputFormat, format_timestamp, truncate_string};
