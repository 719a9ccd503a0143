//! Fake-reasoning prefix parser (C9): lifts `<thinking>...</thinking>`-style
//! prefixes out of streamed content into a separate reasoning channel.

use tracing::warn;

use crate::config::FakeReasoningHandling;

#[derive(Debug, Clone, PartialEq)]
pub enum ThinkingEvent {
    Reasoning { text: String, is_first: bool, is_last: bool, open_tag: String, close_tag: String },
    Content(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    PreContent,
    InThinking,
    Streaming,
}

pub struct ThinkingParser {
    state: State,
    buffer: String,
    open_tags: Vec<String>,
    close_tags: Vec<String>,
    matched_open_tag: Option<String>,
    matched_close_tag: Option<String>,
    initial_buffer_size: usize,
    max_tag_length: usize,
    handling: FakeReasoningHandling,
    /// Character budget for one thinking block (`fakeReasoningMaxTokens * 4`,
    /// matching the tokenizer's own `len/4` heuristic). `0` disables the cap.
    max_reasoning_chars: usize,
    reasoning_chars_emitted: usize,
    block_chunk_emitted: bool,
}

impl ThinkingParser {
    pub fn new(open_tags: Vec<String>, initial_buffer_size: usize, handling: FakeReasoningHandling) -> Self {
        Self::with_max_tokens(open_tags, initial_buffer_size, handling, 0)
    }

    pub fn with_max_tokens(
        open_tags: Vec<String>,
        initial_buffer_size: usize,
        handling: FakeReasoningHandling,
        max_reasoning_tokens: usize,
    ) -> Self {
        let close_tags: Vec<String> = open_tags
            .iter()
            .map(|t| t.replacen('<', "</", 1))
            .collect();
        let max_tag_length = open_tags.iter().map(|t| t.len()).max().unwrap_or(0) * 2;
        Self {
            state: State::PreContent,
            buffer: String::new(),
            open_tags,
            close_tags,
            matched_open_tag: None,
            matched_close_tag: None,
            initial_buffer_size,
            max_tag_length: max_tag_length.max(1),
            handling,
            max_reasoning_chars: max_reasoning_tokens.saturating_mul(4),
            reasoning_chars_emitted: 0,
            block_chunk_emitted: false,
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<ThinkingEvent> {
        let mut events = Vec::new();
        self.buffer.push_str(chunk);
        loop {
            match self.state {
                State::Streaming => {
                    if !self.buffer.is_empty() {
                        events.push(ThinkingEvent::Content(std::mem::take(&mut self.buffer)));
                    }
                    break;
                }
                State::PreContent => {
                    let trimmed = self.buffer.trim_start();
                    if let Some((tag_idx, tag)) = self
                        .open_tags
                        .iter()
                        .enumerate()
                        .find_map(|(i, t)| trimmed.starts_with(t.as_str()).then_some((i, t.clone())))
                    {
                        let after = trimmed[tag.len()..].to_string();
                        self.matched_open_tag = Some(tag.clone());
                        self.matched_close_tag = Some(self.close_tags[tag_idx].clone());
                        self.state = State::InThinking;
                        self.reasoning_chars_emitted = 0;
                        self.block_chunk_emitted = false;
                        self.buffer = after;
                        continue;
                    }
                    let is_prefix_of_any = self
                        .open_tags
                        .iter()
                        .any(|t| t.starts_with(trimmed) || trimmed.starts_with(t.as_str()));
                    if !is_prefix_of_any && trimmed.len() > self.initial_buffer_size {
                        self.state = State::Streaming;
                        self.buffer = trimmed.to_string();
                        continue;
                    }
                    break;
                }
                State::InThinking => {
                    let open_tag = self.matched_open_tag.clone().unwrap_or_default();
                    let close_tag = self.matched_close_tag.clone().unwrap_or_default();
                    if let Some(pos) = self.buffer.find(&close_tag) {
                        let before = self.buffer[..pos].to_string();
                        let after = self.buffer[pos + close_tag.len()..].trim_start().to_string();
                        events.push(ThinkingEvent::Reasoning {
                            text: before,
                            is_first: !self.block_chunk_emitted,
                            is_last: true,
                            open_tag: open_tag.clone(),
                            close_tag: close_tag.clone(),
                        });
                        self.block_chunk_emitted = true;
                        self.state = State::Streaming;
                        self.buffer = after;
                        continue;
                    }
                    if self.max_reasoning_chars > 0
                        && self.reasoning_chars_emitted + self.buffer.len() > self.max_reasoning_chars
                    {
                        warn!(
                            budget = self.max_reasoning_chars,
                            "reasoning block exceeded fakeReasoningMaxTokens cap; truncating without a close tag"
                        );
                        let remaining = self.max_reasoning_chars.saturating_sub(self.reasoning_chars_emitted);
                        let split_at = floor_char_boundary(&self.buffer, remaining);
                        let flushed = self.buffer[..split_at].to_string();
                        // The rest of this block's reasoning text is discarded, not
                        // leaked onto the visible-content channel.
                        self.buffer.clear();
                        self.reasoning_chars_emitted += flushed.len();
                        events.push(ThinkingEvent::Reasoning {
                            text: flushed,
                            is_first: !self.block_chunk_emitted,
                            is_last: true,
                            open_tag: open_tag.clone(),
                            close_tag: close_tag.clone(),
                        });
                        self.block_chunk_emitted = true;
                        self.state = State::Streaming;
                        continue;
                    }
                    if self.buffer.len() > self.max_tag_length {
                        let split_at = self.buffer.len() - self.max_tag_length;
                        let split_at = floor_char_boundary(&self.buffer, split_at);
                        if split_at > 0 {
                            let flushed = self.buffer[..split_at].to_string();
                            self.buffer = self.buffer[split_at..].to_string();
                            self.reasoning_chars_emitted += flushed.len();
                            events.push(ThinkingEvent::Reasoning {
                                text: flushed,
                                is_first: !self.block_chunk_emitted,
                                is_last: false,
                                open_tag,
                                close_tag,
                            });
                            self.block_chunk_emitted = true;
                            continue;
                        }
                    }
                    break;
                }
            }
        }
        events
    }

    /// Flush any residual buffered content once the upstream body ends.
    pub fn finalize(&mut self) -> Vec<ThinkingEvent> {
        let mut events = Vec::new();
        match self.state {
            State::InThinking => {
                if !self.buffer.is_empty() {
                    events.push(ThinkingEvent::Reasoning {
                        text: std::mem::take(&mut self.buffer),
                        is_first: !self.block_chunk_emitted,
                        is_last: true,
                        open_tag: self.matched_open_tag.clone().unwrap_or_default(),
                        close_tag: self.matched_close_tag.clone().unwrap_or_default(),
                    });
                    self.block_chunk_emitted = true;
                }
            }
            State::PreContent | State::Streaming => {
                if !self.buffer.is_empty() {
                    events.push(ThinkingEvent::Content(std::mem::take(&mut self.buffer)));
                }
            }
        }
        events
    }

    /// Renders a parsed event according to `handling`, producing `(reasoning_text, content_text)`.
    pub fn render(&self, event: &ThinkingEvent) -> (Option<String>, Option<String>) {
        match event {
            ThinkingEvent::Content(text) => (None, Some(text.clone())),
            ThinkingEvent::Reasoning { text, is_first, is_last, open_tag, close_tag } => match self.handling {
                FakeReasoningHandling::Remove => (None, None),
                FakeReasoningHandling::Pass => {
                    let mut rendered = String::new();
                    if *is_first {
                        rendered.push_str(open_tag);
                    }
                    rendered.push_str(text);
                    if *is_last {
                        rendered.push_str(close_tag);
                    }
                    (None, Some(rendered))
                }
                FakeReasoningHandling::StripTags => (None, Some(text.clone())),
                FakeReasoningHandling::AsReasoningContent => (Some(text.clone()), None),
            },
        }
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut idx = index.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(handling: FakeReasoningHandling) -> ThinkingParser {
        ThinkingParser::new(vec!["<thinking>".to_string()], 20, handling)
    }

    #[test]
    fn extracts_thinking_block_as_reasoning_content() {
        let mut p = parser(FakeReasoningHandling::AsReasoningContent);
        let mut events = p.feed("<thinking>let me consider</thinking>the answer is 4");
        events.extend(p.finalize());
        let reasoning: String = events
            .iter()
            .filter_map(|e| match e {
                ThinkingEvent::Reasoning { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        let content: String = events
            .iter()
            .filter_map(|e| match e {
                ThinkingEvent::Content(c) => Some(c.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(reasoning, "let me consider");
        assert_eq!(content, "the answer is 4");
    }

    #[test]
    fn short_prefix_with_no_tag_falls_through_as_content() {
        let mut p = parser(FakeReasoningHandling::AsReasoningContent);
        let mut events = p.feed("this is a plain streamed response with no thinking tag at all");
        events.extend(p.finalize());
        let content: String = events
            .iter()
            .filter_map(|e| match e {
                ThinkingEvent::Content(c) => Some(c.clone()),
                _ => None,
            })
            .collect();
        assert!(content.contains("plain streamed response"));
    }

    #[test]
    fn unterminated_thinking_block_is_truncated_at_the_token_cap() {
        let mut p = ThinkingParser::with_max_tokens(
            vec!["<thinking>".to_string()],
            20,
            FakeReasoningHandling::AsReasoningContent,
            2, // 8-char budget
        );
        let mut events = p.feed("<thinking>");
        events.extend(p.feed(&"x".repeat(100)));
        assert!(matches!(p.state, State::Streaming));
        let reasoning_len: usize = events
            .iter()
            .filter_map(|e| match e {
                ThinkingEvent::Reasoning { text, .. } => Some(text.len()),
                _ => None,
            })
            .sum();
        assert!(reasoning_len <= 8);
    }

    #[test]
    fn content_preservation_holds_for_pass_mode() {
        let input = "<thinking>reasoning</thinking>answer";
        let mut p = parser(FakeReasoningHandling::Pass);
        let mut events = p.feed(input);
        events.extend(p.finalize());
        let mut rebuilt = String::new();
        for event in &events {
            let (reasoning, content) = p.render(event);
            if let Some(r) = reasoning {
                rebuilt.push_str(&r);
            }
            if let Some(c) = content {
                rebuilt.push_str(&c);
            }
        }
        assert_eq!(rebuilt, input);
    }

    #[test]
    fn pass_mode_reuses_the_matched_tag_not_the_first_configured_one() {
        let input = "<think>reasoning</think>answer";
        let mut p = ThinkingParser::new(
            vec!["<thinking>".to_string(), "<think>".to_string()],
            20,
            FakeReasoningHandling::Pass,
        );
        let mut events = p.feed(input);
        events.extend(p.finalize());
        let mut rebuilt = String::new();
        for event in &events {
            let (_, content) = p.render(event);
            if let Some(c) = content {
                rebuilt.push_str(&c);
            }
        }
        assert_eq!(rebuilt, input);
    }

    #[test]
    fn pass_mode_emits_open_tag_once_and_close_tag_only_on_last_chunk() {
        let mut p = ThinkingParser::new(vec!["<thinking>".to_string()], 5, FakeReasoningHandling::Pass);
        // Force multiple InThinking flushes before the close tag arrives by
        // exceeding max_tag_length repeatedly.
        let mut events = p.feed("<thinking>");
        events.extend(p.feed(&"a".repeat(50)));
        events.extend(p.feed("</thinking>done"));
        let mut rendered_chunks = Vec::new();
        for event in &events {
            if let (None, Some(c)) = p.render(event) {
                rendered_chunks.push(c);
            }
        }
        let reasoning_chunks: Vec<&String> = rendered_chunks
            .iter()
            .filter(|c| !c.starts_with("done"))
            .collect();
        assert!(reasoning_chunks.len() >= 2, "expected the block to be split into multiple flushes");
        assert_eq!(reasoning_chunks.first().unwrap().matches("<thinking>").count(), 1);
        assert_eq!(
            reasoning_chunks.iter().filter(|c| c.contains("<thinking>")).count(),
            1,
            "open tag must appear exactly once across the whole block"
        );
        assert_eq!(
            reasoning_chunks.iter().filter(|c| c.contains("</thinking>")).count(),
            1,
            "close tag must appear exactly once, only on the last chunk"
        );
        assert!(reasoning_chunks.last().unwrap().ends_with("</thinking>"));
    }
}
