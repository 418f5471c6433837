//! Token-budget-triggered history compaction.
//!
//! When the estimated token count of the history exceeds the configured
//! threshold, old prose is summarized through one non-streaming backend
//! call while every tool-use/result pair is preserved verbatim. The rebuilt
//! history is `[summary] ++ preserved tool-bearing ++ recent`.

use crate::backend::{BackendRequest, ModelBackend};
use crate::error::TychoError;
use crate::types::{ContentBlock, Message, Role};

/// Marker wrapping the generated summary in its system message.
pub const SUMMARY_OPEN_TAG: &str = "<conversation_summary>";
pub const SUMMARY_CLOSE_TAG: &str = "</conversation_summary>";

const SUMMARY_INSTRUCTION: &str = "Summarize the conversation transcript below. \
Preserve decisions made, important context, user preferences, and technical details. \
Omit pleasantries and already-resolved issues. Respond with the summary only.";

/// Compaction thresholds, in estimated tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionConfig {
    /// Estimated-token threshold above which compaction runs.
    pub trigger_tokens: usize,
    /// Budget for the recent suffix kept verbatim.
    pub keep_recent_tokens: usize,
}

/// Partition of a history into the pieces compaction works with.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompactionPlan {
    /// Old messages eligible for summarization, oldest first.
    pub prose: Vec<Message>,
    /// Old tool-bearing messages preserved verbatim, original order.
    pub tool_bearing: Vec<Message>,
    /// Recent suffix kept verbatim, original order.
    pub recent: Vec<Message>,
}

/// Fixed heuristic: total characters divided by four.
pub fn estimate_text_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.chars().count().div_ceil(4)
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut tokens = 4usize;
    for block in &message.content {
        tokens += match block {
            ContentBlock::Text { text } => estimate_text_tokens(text),
            ContentBlock::Thinking { thinking } => estimate_text_tokens(thinking),
            ContentBlock::ToolUse(tu) => {
                let input = serde_json::to_string(&tu.input).unwrap_or_default();
                estimate_text_tokens(&tu.name) + estimate_text_tokens(&input) + 8
            }
            ContentBlock::ToolResult(result) => {
                let structured = result
                    .structured
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default())
                    .unwrap_or_default();
                estimate_text_tokens(&result.content) + estimate_text_tokens(&structured) + 8
            }
        };
    }
    tokens
}

pub fn estimate_history_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Whether compaction must preserve this message verbatim: assistant
/// messages containing tool-use blocks, and all result messages.
fn is_tool_bearing(message: &Message) -> bool {
    message.role == Role::Tool || (message.role == Role::Assistant && message.has_tool_use())
}

/// Whether this message is a summary produced by an earlier compaction.
/// Summaries are system messages but carry no caller instructions; the
/// engine must not mistake one for a configured system prompt.
pub fn is_summary_message(message: &Message) -> bool {
    message.role == Role::System && message.text().trim_start().starts_with(SUMMARY_OPEN_TAG)
}

/// Select the recent suffix newest-to-oldest within the token budget and
/// partition everything older into tool-bearing versus prose.
pub fn prepare_compaction(messages: &[Message], keep_recent_tokens: usize) -> CompactionPlan {
    let mut cut = messages.len();
    let mut kept_tokens = 0usize;
    for idx in (0..messages.len()).rev() {
        let tokens = estimate_message_tokens(&messages[idx]);
        if kept_tokens + tokens > keep_recent_tokens {
            break;
        }
        kept_tokens += tokens;
        cut = idx;
    }

    let mut plan = CompactionPlan {
        recent: messages[cut..].to_vec(),
        ..CompactionPlan::default()
    };
    for message in &messages[..cut] {
        if is_tool_bearing(message) {
            plan.tool_bearing.push(message.clone());
        } else {
            plan.prose.push(message.clone());
        }
    }
    plan
}

/// Render prose messages into a role-labeled transcript for summarization.
pub fn render_transcript(messages: &[Message]) -> String {
    let mut lines = Vec::new();
    for message in messages {
        let label = match message.role {
            Role::System => "[system]",
            Role::User => "[user]",
            Role::Assistant => "[assistant]",
            Role::Tool => continue,
        };
        let text = message.text();
        if !text.is_empty() {
            lines.push(format!("{label} {text}"));
        }
    }
    lines.join("\n")
}

/// Wrap a summary in its labeled system message.
pub fn summary_message(summary: &str) -> Message {
    Message::system(format!(
        "{SUMMARY_OPEN_TAG}\n{}\n{SUMMARY_CLOSE_TAG}",
        summary.trim()
    ))
}

/// Run compaction if the history is over the trigger threshold.
///
/// Returns `Ok(None)` when nothing needs to change: under threshold, or no
/// prose to summarize. Never drops or reorders a tool-use/result pair.
pub async fn compact(
    backend: &dyn ModelBackend,
    model: &str,
    messages: &[Message],
    config: &CompactionConfig,
) -> Result<Option<Vec<Message>>, TychoError> {
    let estimated = estimate_history_tokens(messages);
    if estimated <= config.trigger_tokens {
        return Ok(None);
    }

    let plan = prepare_compaction(messages, config.keep_recent_tokens);
    // A prior summary is folded into the next one rather than preserved as a
    // second summary, but a summary alone is not worth re-summarizing.
    if plan.prose.is_empty() || plan.prose.iter().all(is_summary_message) {
        tracing::debug!(estimated, "compaction skipped: nothing summarizable");
        return Ok(None);
    }

    let transcript = render_transcript(&plan.prose);
    let request = BackendRequest {
        messages: vec![Message::user(transcript)],
        model: model.to_string(),
        system_prompt: Some(SUMMARY_INSTRUCTION.to_string()),
        max_tokens: None,
        temperature: None,
        tools: None,
    };
    let response = backend.complete(&request).await?;
    let summary = response.text();

    let mut rebuilt = Vec::with_capacity(1 + plan.tool_bearing.len() + plan.recent.len());
    rebuilt.push(summary_message(&summary));
    rebuilt.extend(plan.tool_bearing);
    rebuilt.extend(plan.recent);

    tracing::debug!(
        before = messages.len(),
        after = rebuilt.len(),
        estimated,
        "history compacted"
    );
    Ok(Some(rebuilt))
}
