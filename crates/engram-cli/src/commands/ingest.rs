use chrono::{DateTime, Utc};
use clap::Parser;
use engram::MemoryService;
use engram::memory::Speaker;

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct IngestCommand {
    #[clap(help = "Conversation ID")]
    pub conversation: String,

    #[clap(help = "Turn text")]
    pub text: String,

    #[clap(long, default_value = "user", help = "Speaker (user, assistant, system)")]
    pub speaker: String,

    #[clap(long, help = "Event time as RFC 3339 (defaults to now)")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl IngestCommand {
    pub async fn execute(&self, service: &MemoryService, format: OutputFormat) -> CliResult<()> {
        let speaker: Speaker = self.speaker.parse()?;
        let record = service
            .ingest(&self.conversation, speaker, &self.text, self.timestamp)
            .await?;

        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
            OutputFormat::Table => {
                println!("Stored {} ({})", record.id, record.embedding_status)
            }
        }
        Ok(())
    }
}
