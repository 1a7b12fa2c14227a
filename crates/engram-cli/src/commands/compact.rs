use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use engram::MemoryService;
use engram::memory::CompactionReport;

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct CompactCommand {
    #[clap(long, help = "Compact only this conversation")]
    pub conversation: Option<String>,
}

impl CompactCommand {
    pub async fn execute(&self, service: &MemoryService, format: OutputFormat) -> CliResult<()> {
        let report = match self.conversation {
            Some(ref conversation) => service.compact_conversation(conversation).await?,
            None => service.compact_all().await?,
        };

        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Table => print_report(&report),
        }
        Ok(())
    }
}

fn print_report(report: &CompactionReport) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(["Metric", "Count"]);

    for (label, value) in [
        ("Conversations scanned", report.conversations_scanned),
        ("Conversations locked elsewhere", report.conversations_locked),
        ("Conversations failed", report.conversations_failed),
        ("Summaries created", report.summaries_created),
        ("Summaries resumed", report.summaries_resumed),
        ("Summaries awaiting index", report.summaries_pending),
        ("Turns evicted", report.turns_evicted),
        ("Eviction conflicts", report.eviction_conflicts),
        ("Turns flagged for review", report.turns_flagged),
        ("Batches failed", report.batches_failed),
        ("Batches deferred", report.batches_deferred),
    ] {
        table.add_row([label.to_string(), value.to_string()]);
    }

    println!("{table}");
}
