//! Prompt used for conversation summaries

/// System message for chat-style generation endpoints
pub const SUMMARY_SYSTEM_PROMPT: &str =
    "You condense conversation transcripts into durable memory notes.";

/// Summarization prompt
///
/// Placeholder: {transcript} - ordered `speaker: text` lines
pub const SUMMARY_PROMPT: &str = r#"Write a concise, impersonal summary of the conversation below. Keep the facts, events, preferences and feelings that would matter in a later conversation. Drop greetings and small talk. Do not invent anything that is not in the transcript.

Transcript:
{transcript}

Summary:"#;

/// Render the prompt for an ordered transcript
pub fn summary_prompt(lines: &[String]) -> String {
    SUMMARY_PROMPT.replace("{transcript}", &lines.join("\n"))
}
