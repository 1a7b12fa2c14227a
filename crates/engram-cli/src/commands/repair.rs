use clap::Parser;
use engram::MemoryService;

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct RepairCommand {
    #[clap(
        long,
        value_name = "SAMPLE",
        num_args = 0..=1,
        default_missing_value = "100",
        help = "Check a sample of indexed records against the vector index first"
    )]
    pub verify: Option<usize>,
}

impl RepairCommand {
    pub async fn execute(&self, service: &MemoryService, format: OutputFormat) -> CliResult<()> {
        let consistency = match self.verify {
            Some(sample) => Some(service.verify_consistency(sample).await?),
            None => None,
        };
        let report = service.repair().await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "consistency": consistency,
                    "repair": report,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                if let Some(consistency) = consistency {
                    println!(
                        "Verified {} indexed records, {} missing from the vector index",
                        consistency.checked,
                        consistency.missing.len()
                    );
                    for id in &consistency.missing {
                        println!("  requeued {id}");
                    }
                }
                println!(
                    "Scanned {} records: {} re-indexed, {} still failing",
                    report.scanned, report.repaired, report.still_failed
                );
            }
        }
        Ok(())
    }
}
