use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use engram::MemoryService;
use engram::memory::format_context;

use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, truncate_string};

#[derive(Parser)]
pub struct RetrieveCommand {
    #[clap(help = "Conversation ID")]
    pub conversation: String,

    #[clap(help = "Query text")]
    pub query: String,

    #[clap(short, help = "Maximum number of memories (defaults to config)")]
    pub k: Option<usize>,

    #[clap(long, help = "Token budget (defaults to config)")]
    pub budget: Option<usize>,

    #[clap(long, help = "Print the rendered context block instead of a table")]
    pub context: bool,
}

impl RetrieveCommand {
    pub async fn execute(&self, service: &MemoryService, format: OutputFormat) -> CliResult<()> {
        let memories = service
            .retrieve(&self.conversation, &self.query, self.k, self.budget)
            .await?;

        if self.context {
            print!("{}", format_context(&memories));
            return Ok(());
        }

        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&memories)?),
            OutputFormat::Table => {
                if memories.is_empty() {
                    println!("No memories found.");
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["ID", "Kind", "Content", "Similarity", "Recency", "Score", "Tokens", "Created"]);

                for m in &memories {
                    table.add_row([
                        truncate_string(&m.record.id.to_string(), 8),
                        m.record.kind.to_string(),
                        truncate_string(&m.record.content, 50),
                        format!("{:.3}", m.similarity),
                        format!("{:.3}", m.recency),
                        format!("{:.3}", m.score),
                        m.tokens.to_string(),
                        format_timestamp(&m.record.created_at),
                    ]);
                }

                let tokens: usize = memories.iter().map(|m| m.tokens).sum();
                println!("{table}");
                println!("\nTotal: {} memories, ~{} tokens", memories.len(), tokens);
            }
        }
        Ok(())
    }
}
