use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use engram::memory::{EmbeddingStatus, MemoryKind, MemoryRecord};
use engram::storage::{DurableStore, EvictionState, RecordQuery, SortOrder};

use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, parse_uuid, truncate_string};

#[derive(Parser)]
pub struct MemoryCommand {
    #[clap(subcommand)]
    pub command: MemorySubcommand,
}

#[derive(Subcommand)]
pub enum MemorySubcommand {
    #[clap(about = "List memory records")]
    List(ListArgs),

    #[clap(about = "Show record details, evicted records included")]
    Show(ShowArgs),

    #[clap(about = "Show the newest live turns of a conversation")]
    Recent(RecentArgs),

    #[clap(about = "Clear the review flag so the record is compacted again")]
    Unflag(ShowArgs),
}

#[derive(Parser)]
pub struct ListArgs {
    #[clap(
        long,
        short,
        default_value = "20",
        help = "Maximum number of records to display"
    )]
    pub limit: usize,

    #[clap(long, default_value = "0", help = "Number of records to skip")]
    pub offset: usize,

    #[clap(long, help = "Filter to one conversation")]
    pub conversation: Option<String>,

    #[clap(long, short, help = "Filter by kind (turn, summary)")]
    pub kind: Option<String>,

    #[clap(long, short, help = "Filter by embedding status (pending, indexed, failed)")]
    pub status: Option<String>,

    #[clap(long, help = "Show only evicted records", conflicts_with = "all")]
    pub evicted: bool,

    #[clap(long, help = "Include evicted records")]
    pub all: bool,

    #[clap(long, help = "Show only records flagged for review")]
    pub flagged: bool,
}

#[derive(Parser)]
pub struct ShowArgs {
    #[clap(help = "Record ID (UUID format)")]
    pub id: String,
}

#[derive(Parser)]
pub struct RecentArgs {
    #[clap(help = "Conversation ID")]
    pub conversation: String,

    #[clap(long, short, default_value = "10", help = "Number of turns")]
    pub limit: usize,
}

impl ListArgs {
    pub fn to_query(&self) -> CliResult<RecordQuery> {
        let mut query = RecordQuery::new()
            .order(SortOrder::NewestFirst)
            .paginate(self.limit, self.offset)
            .with_eviction(if self.evicted {
                EvictionState::Evicted
            } else if self.all {
                EvictionState::Any
            } else {
                EvictionState::Live
            });

        if let Some(ref conversation) = self.conversation {
            query = query.in_conversation(conversation.as_str());
        }
        if let Some(ref kind) = self.kind {
            query = query.with_kinds(vec![kind.parse::<MemoryKind>()?]);
        }
        if let Some(ref status) = self.status {
            query = query.with_statuses(vec![status.parse::<EmbeddingStatus>()?]);
        }
        if self.flagged {
            query = query.flagged(true);
        }
        Ok(query)
    }
}

impl MemoryCommand {
    pub async fn execute(&self, store: &dyn DurableStore, format: OutputFormat) -> CliResult<()> {
        match &self.command {
            MemorySubcommand::List(args) => Self::list(store, args, format).await,
            MemorySubcommand::Show(args) => Self::show(store, args, format).await,
            MemorySubcommand::Recent(args) => Self::recent(store, args, format).await,
            MemorySubcommand::Unflag(args) => Self::unflag(store, args, format).await,
        }
    }

    async fn list(store: &dyn DurableStore, args: &ListArgs, format: OutputFormat) -> CliResult<()> {
        let query = args.to_query()?;
        let records = store.query(&query).await?;
        let total = store.count(&query).await?;
        print_records(&records, format)?;
        if format == OutputFormat::Table && !records.is_empty() {
            println!("\nShowing {} of {} records", records.len(), total);
        }
        Ok(())
    }

    async fn show(store: &dyn DurableStore, args: &ShowArgs, format: OutputFormat) -> CliResult<()> {
        let id = parse_uuid(&args.id)?;
        let record = store
            .get(id)
            .await?
            .ok_or_else(|| format!("Memory not found: {}", args.id))?;

        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
            OutputFormat::Table => {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Field", "Value"]);

                table.add_row(["ID".to_string(), record.id.to_string()]);
                table.add_row(["Conversation".to_string(), record.conversation_id.clone()]);
                table.add_row(["Kind".to_string(), record.kind.to_string()]);
                table.add_row(["Speaker".to_string(), record.speaker.to_string()]);
                table.add_row(["Created".to_string(), format_timestamp(&record.created_at)]);
                table.add_row(["Recorded".to_string(), format_timestamp(&record.recorded_at)]);
                table.add_row(["Embedding".to_string(), record.embedding_status.to_string()]);
                table.add_row([
                    "Evicted".to_string(),
                    match record.eviction {
                        Some(mark) => format!(
                            "{} (by {})",
                            format_timestamp(&mark.evicted_at),
                            mark.superseded_by
                        ),
                        None => "no".to_string(),
                    },
                ]);
                table.add_row([
                    "Compaction attempts".to_string(),
                    record.compaction_attempts.to_string(),
                ]);
                table.add_row(["Flagged".to_string(), record.flagged_for_review.to_string()]);
                if !record.source_ids.is_empty() {
                    let sources: Vec<String> =
                        record.source_ids.iter().map(|id| id.to_string()).collect();
                    table.add_row(["Sources".to_string(), sources.join("\n")]);
                }

                println!("{table}");
                println!("\nContent:\n{}", record.content);
            }
        }

        Ok(())
    }

    async fn recent(
        store: &dyn DurableStore,
        args: &RecentArgs,
        format: OutputFormat,
    ) -> CliResult<()> {
        let mut turns = store
            .query(
                &RecordQuery::live_turns(args.conversation.as_str())
                    .order(SortOrder::NewestFirst)
                    .paginate(args.limit, 0),
            )
            .await?;
        turns.reverse();
        print_records(&turns, format)
    }

    async fn unflag(
        store: &dyn DurableStore,
        args: &ShowArgs,
        format: OutputFormat,
    ) -> CliResult<()> {
        let id = parse_uuid(&args.id)?;
        if !store.set_review_flag(id, false).await? {
            return Err(format!("Memory not found: {}", args.id).into());
        }

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "id": id.to_string(), "flagged": false }))
            }
            OutputFormat::Table => println!("Cleared review flag on {id}"),
        }
        Ok(())
    }
}

pub(crate) fn print_records(records: &[MemoryRecord], format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(records)?),
        OutputFormat::Table => {
            if records.is_empty() {
                println!("No memories found.");
                return Ok(());
            }

            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(["ID", "Conversation", "Kind", "Speaker", "Content", "Status", "Created"]);

            for record in records {
                let status = if record.is_evicted() {
                    "evicted".to_string()
                } else if record.flagged_for_review {
                    format!("{} (flagged)", record.embedding_status)
                } else {
                    record.embedding_status.to_string()
                };
                table.add_row([
                    truncate_string(&record.id.to_string(), 8),
                    truncate_string(&record.conversation_id, 16),
                    record.kind.to_string(),
                    record.speaker.to_string(),
                    truncate_string(&record.content, 50),
                    status,
                    format_timestamp(&record.created_at),
                ]);
            }

            println!("{table}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ListArgs {
        let mut argv = vec!["list"];
        argv.extend_from_slice(args);
        ListArgs::parse_from(argv)
    }

    #[test]
    fn test_list_defaults_to_live_records() {
        let query = parse(&[]).to_query().unwrap();
        assert_eq!(query.eviction, EvictionState::Live);
        assert_eq!(query.limit, Some(20));
        assert_eq!(query.order, SortOrder::NewestFirst);
    }

    #[test]
    fn test_list_filters() {
        let query = parse(&["--kind", "summary", "--status", "failed", "--evicted", "--flagged"])
            .to_query()
            .unwrap();
        assert_eq!(query.kinds, Some(vec![MemoryKind::Summary]));
        assert_eq!(query.statuses, Some(vec![EmbeddingStatus::Failed]));
        assert_eq!(query.eviction, EvictionState::Evicted);
        assert_eq!(query.flagged, Some(true));
    }

    #[test]
    fn test_unknown_kind_is_an_error() {
        assert!(parse(&["--kind", "episodic"]).to_query().is_err());
    }
}
