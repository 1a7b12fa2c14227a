pub mod compact;
pub mod ingest;
pub mod memory;
pub mod repair;
pub mod retrieve;
pub mod stats;

pub use compact::CompactCommand;
pub use ingest::IngestCommand;
pub use memory::MemoryCommand;
pub use repair::RepairCommand;
pub use retrieve::RetrieveCommand;
pub use stats::StatsCommand;
