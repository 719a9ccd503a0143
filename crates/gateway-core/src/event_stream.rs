//! Incremental upstream event-stream parser (C7).
//!
//! The upstream frames its response as an arbitrarily-chunked byte stream
//! containing tag-prefixed JSON objects. This parser is chunking-invariant:
//! feeding it `c1, c2, ..., cn` produces the same events as feeding the
//! concatenation of those chunks in one call (P2).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::ids::generate_tool_call_id;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, arguments_fragment: String },
    ToolCallDone { id: String, name: String, arguments: String },
    Usage(Value),
    ContextUsagePercentage(f64),
}

#[derive(Debug, Clone, Default)]
pub struct FinishedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

struct InFlightToolCall {
    id: String,
    name: String,
    arguments_buffer: String,
}

static TAG_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\{"content":|\{"name":|\{"input":|\{"stop":|\{"followupPrompt":|\{"usage":|\{"contextUsagePercentage":"#,
    )
    .unwrap()
});

static BRACKET_TOOL_CALL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[Called\s+(\w+)\s+with\s+args:\s*").unwrap()
});

pub struct AwsEventStreamParser {
    buffer: String,
    last_content: Option<String>,
    in_flight: Option<InFlightToolCall>,
    finished: Vec<FinishedToolCall>,
}

impl Default for AwsEventStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AwsEventStreamParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            last_content: None,
            in_flight: None,
            finished: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();
        loop {
            let Some(m) = TAG_REGEX.find(&self.buffer) else {
                break;
            };
            let start = m.start();
            let end = match find_matching_brace(&self.buffer, start) {
                Some(end) => end,
                None => break, // need more data
            };
            let json_str = self.buffer[start..=end].to_string();
            self.buffer.replace_range(start..=end, "");

            match serde_json::from_str::<Value>(&json_str) {
                Ok(value) => self.process_event(value, &mut events),
                Err(_) => {
                    // malformed slice, drop it and keep scanning
                    continue;
                }
            }
        }
        events
    }

    fn process_event(&mut self, value: Value, events: &mut Vec<StreamEvent>) {
        if let Some(content) = value.get("content").and_then(Value::as_str) {
            if !content.is_empty()
                && Some(content) != self.last_content.as_deref()
                && value.get("followupPrompt").is_none()
            {
                events.push(StreamEvent::Content(content.to_string()));
                self.last_content = Some(content.to_string());
            }
            return;
        }

        if let Some(name) = value.get("name").and_then(Value::as_str) {
            self.finalize_in_flight(events);
            let id = value
                .get("toolUseId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(generate_tool_call_id);
            let initial = match value.get("input") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            events.push(StreamEvent::ToolCallStart { id: id.clone(), name: name.to_string() });
            self.in_flight = Some(InFlightToolCall {
                id,
                name: name.to_string(),
                arguments_buffer: initial,
            });
            if value.get("stop").and_then(Value::as_bool) == Some(true) {
                self.finalize_in_flight(events);
            }
            return;
        }

        if let Some(input) = value.get("input") {
            if let Some(tool) = &mut self.in_flight {
                // Overflow guard: once the buffered arguments already parse
                // as valid JSON, drop further fragments to avoid doubling.
                if serde_json::from_str::<Value>(&tool.arguments_buffer).is_err() {
                    let fragment = match input {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    tool.arguments_buffer.push_str(&fragment);
                    events.push(StreamEvent::ToolCallDelta {
                        id: tool.id.clone(),
                        arguments_fragment: fragment,
                    });
                }
            }
            return;
        }

        if value.get("stop").and_then(Value::as_bool) == Some(true) {
            self.finalize_in_flight(events);
            return;
        }

        if let Some(usage) = value.get("usage") {
            events.push(StreamEvent::Usage(usage.clone()));
            return;
        }

        if let Some(pct) = value.get("contextUsagePercentage").and_then(Value::as_f64) {
            events.push(StreamEvent::ContextUsagePercentage(pct));
        }
    }

    fn finalize_in_flight(&mut self, events: &mut Vec<StreamEvent>) {
        let Some(tool) = self.in_flight.take() else {
            return;
        };
        let arguments = finalize_arguments(&tool.arguments_buffer);
        events.push(StreamEvent::ToolCallDone {
            id: tool.id.clone(),
            name: tool.name.clone(),
            arguments: arguments.clone(),
        });
        self.finished.push(FinishedToolCall { id: tool.id, name: tool.name, arguments });
    }

    /// Flush any still-in-flight tool call; call once the upstream body ends.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.finalize_in_flight(&mut events);
        events
    }

    pub fn tool_calls(&self) -> &[FinishedToolCall] {
        &self.finished
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Walks `s` starting at the `{` found at `start`, honoring string/escape
/// state, and returns the index of the matching `}` (inclusive).
pub fn find_matching_brace(s: &str, start: usize) -> Option<usize> {
    let bytes: Vec<char> = s[start..].chars().collect();
    if bytes.first() != Some(&'{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    for (i, ch) in bytes.iter().enumerate() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    // convert char index back into a byte index relative to `s`
                    let byte_len: usize = bytes[..=i].iter().map(|c| c.len_utf8()).sum();
                    return Some(start + byte_len - 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Attempts to coerce a possibly-truncated JSON object string into valid
/// JSON by trimming and appending missing closing braces; collapses to
/// `"{}"` if repair fails (P3).
fn finalize_arguments(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value.to_string();
    }
    let open = trimmed.chars().filter(|&c| c == '{').count();
    let close = trimmed.chars().filter(|&c| c == '}').count();
    if open > close {
        let mut repaired = trimmed.to_string();
        repaired.push_str(&"}".repeat(open - close));
        if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
            return value.to_string();
        }
    }
    "{}".to_string()
}

/// Parses the `[Called <fn> with args: {...}]` bracket form sometimes
/// emitted inline in `content`, as a post-stream supplement to stream-native
/// tool calls.
pub fn parse_bracket_tool_calls(text: &str) -> Vec<FinishedToolCall> {
    let mut out = Vec::new();
    for m in BRACKET_TOOL_CALL_REGEX.captures_iter(text) {
        let whole = m.get(0).unwrap();
        let name = m.get(1).unwrap().as_str().to_string();
        let search_from = whole.end();
        let Some(brace_start) = text[search_from..].find('{') else {
            continue;
        };
        let abs_start = search_from + brace_start;
        let Some(end) = find_matching_brace(text, abs_start) else {
            continue;
        };
        let json_str = &text[abs_start..=end];
        let Ok(args) = serde_json::from_str::<Value>(json_str) else {
            continue;
        };
        out.push(FinishedToolCall {
            id: generate_tool_call_id(),
            name,
            arguments: args.to_string(),
        });
    }
    out
}

/// Two-stage deduplication (P7: idempotent under repeated application).
pub fn deduplicate_tool_calls(calls: Vec<FinishedToolCall>) -> Vec<FinishedToolCall> {
    use std::collections::HashMap;

    let mut by_id: HashMap<String, FinishedToolCall> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for call in calls {
        match by_id.get(&call.id) {
            Some(existing) if is_better(existing, &call) => {}
            Some(_) => {
                by_id.insert(call.id.clone(), call);
            }
            None => {
                order.push(call.id.clone());
                by_id.insert(call.id.clone(), call);
            }
        }
    }

    let mut seen_by_name_args = std::collections::HashSet::new();
    let mut result = Vec::new();
    for id in order {
        let call = by_id.remove(&id).unwrap();
        let key = format!("{}-{}", call.name, call.arguments);
        if seen_by_name_args.insert(key) {
            result.push(call);
        }
    }
    result
}

fn is_better(existing: &FinishedToolCall, candidate: &FinishedToolCall) -> bool {
    let existing_is_empty = existing.arguments == "{}";
    let candidate_is_empty = candidate.arguments == "{}";
    if existing_is_empty && !candidate_is_empty {
        return false;
    }
    candidate.arguments.len() <= existing.arguments.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_events_are_emitted_and_deduplicated() {
        let mut parser = AwsEventStreamParser::new();
        let events = parser.feed(br#"{"content":"hello"}{"content":"hello"}{"content":"world"}"#);
        let content: Vec<_> = events
            .into_iter()
            .filter_map(|e| match e {
                StreamEvent::Content(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(content, vec!["hello".to_string(), "world".to_string()]);
    }

    #[test]
    fn parser_is_chunking_invariant() {
        let whole = br#"{"name":"search","toolUseId":"t1"}{"input":"{\"q\":"}{"input":"\"rust\"}"}{"stop":true}"#;
        let mut whole_parser = AwsEventStreamParser::new();
        let whole_events = whole_parser.feed(whole);

        let mut chunked_parser = AwsEventStreamParser::new();
        let mut chunked_events = Vec::new();
        for byte in whole.iter() {
            chunked_events.extend(chunked_parser.feed(&[*byte]));
        }

        assert_eq!(whole_events, chunked_events);
    }

    #[test]
    fn tool_call_arguments_are_always_valid_json() {
        let mut parser = AwsEventStreamParser::new();
        parser.feed(br#"{"name":"search","toolUseId":"t1"}{"input":"{\"q\": \"broken"#);
        let events = parser.finish();
        let done = events
            .into_iter()
            .find_map(|e| match e {
                StreamEvent::ToolCallDone { arguments, .. } => Some(arguments),
                _ => None,
            })
            .unwrap();
        assert!(serde_json::from_str::<Value>(&done).is_ok());
    }

    #[test]
    fn overflow_guard_drops_duplicate_argument_fragments() {
        let mut parser = AwsEventStreamParser::new();
        parser.feed(br#"{"name":"search","toolUseId":"t1"}{"input":"{\"q\":\"rust\"}"}"#);
        parser.feed(br#"{"input":"{\"q\":\"rust\"}"}"#);
        let events = parser.finish();
        let arguments = events
            .into_iter()
            .find_map(|e| match e {
                StreamEvent::ToolCallDone { arguments, .. } => Some(arguments),
                _ => None,
            })
            .unwrap();
        let parsed: Value = serde_json::from_str(&arguments).unwrap();
        assert_eq!(parsed["q"], "rust");
    }

    #[test]
    fn deduplication_by_id_prefers_longer_arguments() {
        let calls = vec![
            FinishedToolCall { id: "a".into(), name: "f".into(), arguments: "{}".into() },
            FinishedToolCall { id: "a".into(), name: "f".into(), arguments: r#"{"x":1}"#.into() },
        ];
        let deduped = deduplicate_tool_calls(calls);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].arguments, r#"{"x":1}"#);
    }

    #[test]
    fn deduplication_is_idempotent() {
        let calls = vec![
            FinishedToolCall { id: "a".into(), name: "f".into(), arguments: "{}".into() },
            FinishedToolCall { id: "b".into(), name: "f".into(), arguments: "{}".into() },
        ];
        let once = deduplicate_tool_calls(calls);
        let twice = deduplicate_tool_calls(once.clone());
        assert_eq!(once.len(), twice.len());
    }

    #[test]
    fn bracket_form_tool_calls_are_extracted() {
        let text = r#"prefix [Called lookup with args: {"id": 7}] suffix"#;
        let calls = parse_bracket_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "lookup");
        assert_eq!(calls[0].arguments, r#"{"id":7}"#);
    }
}
