use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use engram::storage::{DurableStore, VectorIndex};

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct StatsCommand {}

impl StatsCommand {
    pub async fn execute(
        &self,
        store: &dyn DurableStore,
        index: &dyn VectorIndex,
        format: OutputFormat,
    ) -> CliResult<()> {
        let stats = store.stats().await?;
        let vectors = index.count().await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "records": stats,
                    "vectors": vectors,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Metric", "Count"]);

                for (label, value) in [
                    ("Records", stats.total),
                    ("Turns", stats.turns),
                    ("Summaries", stats.summaries),
                    ("Evicted", stats.evicted),
                    ("Conversations", stats.conversations),
                    ("Indexed", stats.indexed),
                    ("Pending", stats.pending),
                    ("Failed", stats.failed),
                    ("Flagged for review", stats.flagged),
                    ("Vectors", vectors),
                ] {
                    table.add_row([label.to_string(), value.to_string()]);
                }

                println!("{table}");
            }
        }

        Ok(())
    }
}
