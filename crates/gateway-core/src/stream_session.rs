//! Ties the event-stream parser (C7), the reasoning-prefix parser (C9), and
//! the response emitter (C8) together into one per-request session.
//!
//! This module owns no I/O: callers feed it raw byte chunks as they arrive
//! from the upstream connection (however that read loop chooses to pace and
//! time itself) and it returns the OpenAI-shaped chunks to emit. That keeps
//! the whole assembly pipeline unit-testable without a live HTTP stack.

use serde_json::Value;

use crate::config::Settings;
use crate::emitter::{self, ChatCompletionChunk, UsageWithCredits};
use crate::event_stream::{deduplicate_tool_calls, parse_bracket_tool_calls, AwsEventStreamParser, FinishedToolCall};
use crate::openai::{ChatMessage, Tool};
use crate::thinking::ThinkingParser;

pub struct StreamSession {
    id: String,
    created: u64,
    model: String,
    event_parser: AwsEventStreamParser,
    thinking_parser: Option<ThinkingParser>,
    /// Everything the upstream emitted under the `content` tag, independent
    /// of whether a reasoning prefix was lifted out of it. Used for bracket
    /// tool-call extraction, which can appear either inside or outside a
    /// thinking block.
    raw_content: String,
    /// What the client actually sees as assistant text (post reasoning
    /// extraction, per `fakeReasoningHandling`). Used for completion-token
    /// counting, since that is what the client is billed against.
    visible_content: String,
    reasoning_content: String,
    usage_event: Option<Value>,
    context_usage_percentage: Option<f64>,
    emitted_role: bool,
}

pub struct FinalizedStream {
    /// Chunks to emit after the body ends: trailing content/reasoning
    /// flushed from residual buffers, the tool_calls delta (if any), and
    /// the terminal chunk. Already in emission order.
    pub trailing_chunks: Vec<ChatCompletionChunk>,
    pub tool_calls: Vec<FinishedToolCall>,
    pub usage: UsageWithCredits,
    pub visible_content: String,
    pub reasoning_content: Option<String>,
}

impl StreamSession {
    pub fn new(id: String, created: u64, model: String, settings: &Settings) -> Self {
        let thinking_parser = settings.fake_reasoning_enabled.then(|| {
            ThinkingParser::with_max_tokens(
                settings.fake_reasoning_open_tags.clone(),
                settings.fake_reasoning_initial_buffer_size,
                settings.fake_reasoning_handling,
                settings.fake_reasoning_max_tokens,
            )
        });
        Self {
            id,
            created,
            model,
            event_parser: AwsEventStreamParser::new(),
            thinking_parser,
            raw_content: String::new(),
            visible_content: String::new(),
            reasoning_content: String::new(),
            usage_event: None,
            context_usage_percentage: None,
            emitted_role: false,
        }
    }

    /// Feeds one arbitrarily-sized byte chunk and returns the OpenAI chunks
    /// it produces. Tool-call events are tracked internally but never
    /// surfaced as incremental deltas: per §4.5, tool calls are only ever
    /// emitted once, fully assembled, at end-of-stream.
    pub fn process_chunk(&mut self, bytes: &[u8]) -> Vec<ChatCompletionChunk> {
        let events = self.event_parser.feed(bytes);
        let mut chunks = Vec::new();
        for event in events {
            match event {
                crate::event_stream::StreamEvent::Content(text) => {
                    self.raw_content.push_str(&text);
                    self.ingest_content(&text, &mut chunks);
                }
                crate::event_stream::StreamEvent::Usage(v) => self.usage_event = Some(v),
                crate::event_stream::StreamEvent::ContextUsagePercentage(pct) => {
                    self.context_usage_percentage = Some(pct);
                }
                crate::event_stream::StreamEvent::ToolCallStart { .. }
                | crate::event_stream::StreamEvent::ToolCallDelta { .. }
                | crate::event_stream::StreamEvent::ToolCallDone { .. } => {}
            }
        }
        chunks
    }

    fn ingest_content(&mut self, text: &str, chunks: &mut Vec<ChatCompletionChunk>) {
        let Some(parser) = &mut self.thinking_parser else {
            if text.is_empty() {
                return;
            }
            self.visible_content.push_str(text);
            chunks.push(ChatCompletionChunk::content_delta(
                &self.id,
                self.created,
                &self.model,
                text.to_string(),
                !self.emitted_role,
            ));
            self.emitted_role = true;
            return;
        };
        for event in parser.feed(text) {
            let (reasoning, content) = parser.render(&event);
            self.push_rendered(reasoning, content, chunks);
        }
    }

    fn push_rendered(
        &mut self,
        reasoning: Option<String>,
        content: Option<String>,
        chunks: &mut Vec<ChatCompletionChunk>,
    ) {
        if let Some(r) = reasoning.filter(|s| !s.is_empty()) {
            self.reasoning_content.push_str(&r);
            chunks.push(ChatCompletionChunk::reasoning_delta(
                &self.id,
                self.created,
                &self.model,
                r,
                !self.emitted_role,
            ));
            self.emitted_role = true;
        }
        if let Some(c) = content.filter(|s| !s.is_empty()) {
            self.visible_content.push_str(&c);
            chunks.push(ChatCompletionChunk::content_delta(
                &self.id,
                self.created,
                &self.model,
                c,
                !self.emitted_role,
            ));
            self.emitted_role = true;
        }
    }

    /// Flushes residual buffers, assembles and deduplicates the final
    /// tool-call list, computes usage, and builds the trailing chunk
    /// sequence (content/reasoning residue, tool_calls, terminal).
    pub fn finalize(
        mut self,
        request_messages: &[ChatMessage],
        request_tools: Option<&[Tool]>,
        max_input_tokens: u64,
    ) -> FinalizedStream {
        self.event_parser.finish();

        let mut trailing_chunks = Vec::new();
        if let Some(parser) = &mut self.thinking_parser {
            for event in parser.finalize() {
                let (reasoning, content) = parser.render(&event);
                self.push_rendered(reasoning, content, &mut trailing_chunks);
            }
        }

        let mut tool_calls: Vec<FinishedToolCall> = self.event_parser.tool_calls().to_vec();
        tool_calls.extend(parse_bracket_tool_calls(&self.raw_content));
        let tool_calls = deduplicate_tool_calls(tool_calls);

        let (usage, _source) = emitter::compute_usage(
            self.context_usage_percentage,
            &self.visible_content,
            request_messages,
            request_tools,
            max_input_tokens,
            self.usage_event.clone(),
        );

        let finish = emitter::finish_reason(&tool_calls);
        if !tool_calls.is_empty() {
            trailing_chunks.push(ChatCompletionChunk::tool_calls_delta(
                &self.id,
                self.created,
                &self.model,
                emitter::build_tool_calls(&tool_calls, true),
            ));
        }
        trailing_chunks.push(ChatCompletionChunk::terminal(
            &self.id,
            self.created,
            &self.model,
            finish,
            usage.clone(),
        ));

        FinalizedStream {
            trailing_chunks,
            tool_calls,
            usage,
            visible_content: self.visible_content,
            reasoning_content: (!self.reasoning_content.is_empty()).then_some(self.reasoning_content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn plain_content_stream_emits_content_chunks_with_role_once() {
        let mut settings = Settings::default();
        settings.fake_reasoning_enabled = false;
        let mut session = StreamSession::new("id1".into(), 0, "claude-sonnet-4.5".into(), &settings);
        let chunks = session.process_chunk(br#"{"content":"hello"}{"content":"hello world"}"#);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].choices[0].delta.role, Some("assistant"));
        assert_eq!(chunks[1].choices[0].delta.role, None);
    }

    #[test]
    fn finalize_emits_tool_calls_then_terminal() {
        let mut settings = Settings::default();
        settings.fake_reasoning_enabled = false;
        let mut session = StreamSession::new("id1".into(), 0, "claude-sonnet-4.5".into(), &settings);
        session.process_chunk(br#"{"name":"search","toolUseId":"t1","input":"{\"q\":\"cats\"}"}{"stop":true}"#);
        let finalized = session.finalize(&[], None, 200_000);
        assert_eq!(finalized.tool_calls.len(), 1);
        let last_two = &finalized.trailing_chunks[finalized.trailing_chunks.len() - 2..];
        assert!(last_two[0].choices[0].delta.tool_calls.is_some());
        assert_eq!(last_two[1].choices[0].finish_reason, Some("tool_calls"));
    }

    #[test]
    fn thinking_extraction_splits_reasoning_from_content_mid_stream() {
        let settings = Settings::default();
        let mut session = StreamSession::new("id1".into(), 0, "claude-sonnet-4.5".into(), &settings);
        let chunks = session.process_chunk(br#"{"content":"<thinking>consider this</thinking>answer"}"#);
        let reasoning: String = chunks
            .iter()
            .filter_map(|c| c.choices[0].delta.reasoning_content.clone())
            .collect();
        let content: String = chunks
            .iter()
            .filter_map(|c| c.choices[0].delta.content.clone())
            .collect();
        assert_eq!(reasoning, "consider this");
        assert_eq!(content, "answer");
    }
}
