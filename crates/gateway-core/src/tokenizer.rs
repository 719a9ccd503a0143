//! Fallback token-count estimator (ambient companion to C8's usage
//! computation). No real tokenizer dependency is in the stack, so counts are
//! a heuristic approximation, not an exact BPE count.

use crate::openai::{ChatMessage, Content, ContentBlock, Tool};

const CLAUDE_CORRECTION_FACTOR: f64 = 1.15;

fn count_text(text: &str) -> u64 {
    (text.len() / 4 + 1) as u64
}

pub fn count_tokens(text: &str, apply_correction: bool) -> u64 {
    let base = count_text(text);
    if apply_correction {
        (base as f64 * CLAUDE_CORRECTION_FACTOR).round() as u64
    } else {
        base
    }
}

pub fn count_message_tokens(messages: &[ChatMessage], apply_correction: bool) -> u64 {
    let mut total: u64 = 3;
    for message in messages {
        total += 4;
        total += count_text(&format!("{:?}", message.role));
        total += match &message.content {
            Content::Empty => 0,
            Content::Text(s) => count_text(s),
            Content::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => count_text(text),
                    ContentBlock::ImageUrl { .. } | ContentBlock::Image { .. } => 100,
                    _ => 0,
                })
                .sum(),
        };
        if let Some(tool_calls) = &message.tool_calls {
            for call in tool_calls {
                total += 4 + count_text(&call.function.name) + count_text(&call.function.arguments);
            }
        }
        if message.tool_call_id.is_some() {
            total += 4;
        }
    }
    if apply_correction {
        (total as f64 * CLAUDE_CORRECTION_FACTOR).round() as u64
    } else {
        total
    }
}

pub fn count_tools_tokens(tools: &[Tool], apply_correction: bool) -> u64 {
    let mut total: u64 = 0;
    for tool in tools {
        total += 4;
        total += count_text(&tool.function.name);
        total += count_text(&tool.function.description);
        if let Some(params) = &tool.function.parameters {
            total += count_text(&serde_json::to_string(params).unwrap_or_default());
        }
    }
    if apply_correction {
        (total as f64 * CLAUDE_CORRECTION_FACTOR).round() as u64
    } else {
        total
    }
}

pub fn estimate_request_tokens(messages: &[ChatMessage], tools: Option<&[Tool]>) -> u64 {
    let mut total = count_message_tokens(messages, false);
    if let Some(tools) = tools {
        total += count_tools_tokens(tools, false);
    }
    ((total as f64) * CLAUDE_CORRECTION_FACTOR).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_tokens_applies_correction_factor() {
        let uncorrected = count_tokens("hello world", false);
        let corrected = count_tokens("hello world", true);
        assert!(corrected >= uncorrected);
    }
}
