//! Token estimation and prompt rendering for retrieved memories

use crate::memory::retrieval::RetrievedMemory;

/// Estimate token count as characters / 4, rounded up.
///
/// Counts chars rather than bytes so non-ASCII text is not over-charged.
#[inline]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Render retrieved memories as an XML block for a system prompt.
///
/// # Example Output
/// ```xml
/// <memories>
/// <memory date="2024-01-15" kind="summary">
///   The user likes tea.
/// </memory>
/// </memories>
/// ```
pub fn format_context(memories: &[RetrievedMemory]) -> String {
    if memories.is_empty() {
        return String::new();
    }

    let mut block = String::from("<memories>\n");
    for rm in memories {
        block.push_str(&format!(
            "<memory date=\"{}\" kind=\"{}\">\n  {}\n</memory>\n",
            rm.record.created_at.format("%Y-%m-%d"),
            rm.record.kind,
            rm.record.content
        ));
    }
    block.push_str("</memories>");
    block
}
