//! Response emitter (C8): turns parsed upstream events into OpenAI-shaped
//! chunks or a single aggregated response, and computes `usage`.

use serde::Serialize;
use serde_json::Value;

use crate::event_stream::FinishedToolCall;
use crate::openai::{ChatMessage, Tool, Usage};
use crate::tokenizer::{count_tokens, estimate_request_tokens};

/// Which computation produced the reported token counts. Not surfaced to
/// the client; logged at trace level for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageSource {
    ContextUsagePercentage,
    FallbackTokenization,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageWithCredits {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits_used: Option<Value>,
}

/// Computes `usage` per §4.5: prefer the upstream's own
/// `contextUsagePercentage` signal (back-computed against the model's
/// `maxInputTokens`), falling back to local heuristic tokenization of the
/// request and response otherwise.
pub fn compute_usage(
    context_usage_percentage: Option<f64>,
    full_content: &str,
    request_messages: &[ChatMessage],
    request_tools: Option<&[Tool]>,
    max_input_tokens: u64,
    credits_used: Option<Value>,
) -> (UsageWithCredits, UsageSource) {
    let (prompt_tokens, completion_tokens, total_tokens, source) = match context_usage_percentage {
        Some(pct) if pct > 0.0 => {
            let total = ((pct / 100.0) * max_input_tokens as f64).round() as u64;
            let completion = count_tokens(full_content, true);
            let prompt = total.saturating_sub(completion);
            (prompt, completion, total, UsageSource::ContextUsagePercentage)
        }
        _ => {
            let prompt = estimate_request_tokens(request_messages, request_tools);
            let completion = count_tokens(full_content, true);
            (prompt, completion, prompt + completion, UsageSource::FallbackTokenization)
        }
    };
    (
        UsageWithCredits {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            credits_used,
        },
        source,
    )
}

impl From<UsageWithCredits> for Usage {
    fn from(u: UsageWithCredits) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

/// `finish_reason` is `"tool_calls"` whenever any tool calls survived
/// finalization and deduplication, else `"stop"`.
pub fn finish_reason(tool_calls: &[FinishedToolCall]) -> &'static str {
    if tool_calls.is_empty() {
        "stop"
    } else {
        "tool_calls"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutToolCallFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: &'static str,
    pub function: OutToolCallFunction,
}

/// Builds the indexed `tool_calls` array for either emission mode. Entries
/// with a missing/empty `name` are skipped (§4.5); `indexed` selects whether
/// each entry carries its position (streaming delta) or not (aggregated
/// message).
pub fn build_tool_calls(tool_calls: &[FinishedToolCall], indexed: bool) -> Vec<OutToolCall> {
    tool_calls
        .iter()
        .filter(|tc| !tc.name.is_empty())
        .enumerate()
        .map(|(i, tc)| OutToolCall {
            index: indexed.then_some(i),
            id: tc.id.clone(),
            call_type: "function",
            function: OutToolCallFunction {
                name: tc.name.clone(),
                arguments: tc.arguments.clone(),
            },
        })
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OutToolCall>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageWithCredits>,
}

impl ChatCompletionChunk {
    pub fn content_delta(id: &str, created: u64, model: &str, content: String, first: bool) -> Self {
        ChatCompletionChunk {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: first.then_some("assistant"),
                    content: Some(content),
                    reasoning_content: None,
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    pub fn reasoning_delta(id: &str, created: u64, model: &str, reasoning: String, first: bool) -> Self {
        ChatCompletionChunk {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: first.then_some("assistant"),
                    content: None,
                    reasoning_content: Some(reasoning),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    pub fn tool_calls_delta(id: &str, created: u64, model: &str, tool_calls: Vec<OutToolCall>) -> Self {
        ChatCompletionChunk {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: None,
                    reasoning_content: None,
                    tool_calls: Some(tool_calls),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    pub fn terminal(
        id: &str,
        created: u64,
        model: &str,
        finish_reason: &'static str,
        usage: UsageWithCredits,
    ) -> Self {
        ChatCompletionChunk {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta::default(),
                finish_reason: Some(finish_reason),
            }],
            usage: Some(usage),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatedMessage {
    pub role: &'static str,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OutToolCall>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatedChoice {
    pub index: u32,
    pub message: AggregatedMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<AggregatedChoice>,
    pub usage: UsageWithCredits,
}

impl ChatCompletionResponse {
    pub fn new(
        id: String,
        created: u64,
        model: String,
        full_content: String,
        reasoning_content: Option<String>,
        tool_calls: &[FinishedToolCall],
        usage: UsageWithCredits,
    ) -> Self {
        let has_tool_calls = !tool_calls.is_empty();
        let finish = finish_reason(tool_calls);
        ChatCompletionResponse {
            id,
            object: "chat.completion",
            created,
            model,
            choices: vec![AggregatedChoice {
                index: 0,
                message: AggregatedMessage {
                    role: "assistant",
                    content: if has_tool_calls { None } else { Some(full_content) },
                    reasoning_content,
                    tool_calls: has_tool_calls.then(|| build_tool_calls(tool_calls, false)),
                },
                finish_reason: finish,
            }],
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{ChatMessage, Content, Role};

    #[test]
    fn context_percentage_drives_usage_when_present() {
        let (usage, source) = compute_usage(Some(5.0), "pong", &[], None, 200_000, None);
        assert_eq!(usage.total_tokens, 10_000);
        assert_eq!(source, UsageSource::ContextUsagePercentage);
        assert_eq!(usage.prompt_tokens, usage.total_tokens - usage.completion_tokens);
    }

    #[test]
    fn falls_back_to_local_tokenization_without_context_percentage() {
        let messages = vec![ChatMessage {
            role: Role::User,
            content: Content::Text("hi".to_string()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }];
        let (usage, source) = compute_usage(None, "pong", &messages, None, 200_000, None);
        assert_eq!(source, UsageSource::FallbackTokenization);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    }

    #[test]
    fn finish_reason_reflects_tool_call_presence() {
        assert_eq!(finish_reason(&[]), "stop");
        let calls = vec![FinishedToolCall {
            id: "a".into(),
            name: "f".into(),
            arguments: "{}".into(),
        }];
        assert_eq!(finish_reason(&calls), "tool_calls");
    }

    #[test]
    fn build_tool_calls_skips_missing_names() {
        let calls = vec![
            FinishedToolCall { id: "a".into(), name: "".into(), arguments: "{}".into() },
            FinishedToolCall { id: "b".into(), name: "f".into(), arguments: "{}".into() },
        ];
        let out = build_tool_calls(&calls, true);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].index, Some(0));
    }
}
