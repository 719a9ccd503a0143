//! Request translator (C6): OpenAI chat messages → upstream conversation state.

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::config::{internal_model_id, Settings};
use crate::error::GatewayError;
use crate::ids::generate_conversation_id;
use crate::openai::{ChatCompletionRequest, ChatMessage, Content, ContentBlock, Role, Tool};

const CONTINUE_PLACEHOLDER: &str = "Continue";

/// A message mid-pipeline. Content is kept as a small internal variant so
/// the merge pass can concatenate lists and promote strings without
/// round-tripping through JSON.
#[derive(Debug, Clone)]
struct WorkingMessage {
    role: Role,
    content: WorkingContent,
    tool_calls: Vec<(String, String, String)>, // (id, name, arguments-json-string)
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone)]
enum WorkingContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl WorkingContent {
    fn from_openai(content: &Content) -> Self {
        match content {
            Content::Empty => WorkingContent::Text(String::new()),
            Content::Text(s) => WorkingContent::Text(s.clone()),
            Content::Blocks(b) => WorkingContent::Blocks(b.clone()),
        }
    }

    fn extract_text(&self) -> String {
        match self {
            WorkingContent::Text(s) => s.clone(),
            WorkingContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            WorkingContent::Text(s) => s.is_empty(),
            WorkingContent::Blocks(b) => b.is_empty(),
        }
    }

    fn prepend_text(&mut self, prefix: &str) {
        match self {
            WorkingContent::Text(s) => *s = format!("{prefix}\n\n{s}"),
            WorkingContent::Blocks(blocks) => {
                blocks.insert(0, ContentBlock::Text { text: prefix.to_string() })
            }
        }
    }
}

/// Step 1: relocate descriptions longer than `max_len` into a synthetic
/// documentation block, replacing them with a pointer. `max_len <= 0`
/// disables relocation entirely.
fn relocate_long_tool_descriptions(tools: &[Tool], max_len: i64) -> (Vec<Tool>, Vec<String>) {
    if max_len <= 0 {
        return (tools.to_vec(), Vec::new());
    }
    let mut docs = Vec::new();
    let mut out = Vec::with_capacity(tools.len());
    for tool in tools {
        if tool.tool_type != "function" || tool.function.description.len() as i64 <= max_len {
            out.push(tool.clone());
            continue;
        }
        docs.push(format!(
            "## Tool: {}\n\n{}",
            tool.function.name, tool.function.description
        ));
        let mut relocated = tool.clone();
        relocated.function.description = format!(
            "[Full documentation in system prompt under '## Tool: {}']",
            tool.function.name
        );
        out.push(relocated);
    }
    (out, docs)
}

/// Step 2: concatenate all `system` message text, plus relocated tool docs.
fn extract_system_and_docs(messages: &[ChatMessage], tool_docs: &[String]) -> (String, Vec<ChatMessage>) {
    let mut system_parts = Vec::new();
    let mut rest = Vec::new();
    for message in messages {
        if message.role == Role::System {
            let text = message.content.extract_text();
            if !text.is_empty() {
                system_parts.push(text);
            }
        } else {
            rest.push(message.clone());
        }
    }
    let mut system_text = system_parts.join("\n").trim().to_string();
    if !tool_docs.is_empty() {
        if !system_text.is_empty() {
            system_text.push_str("\n\n");
        }
        system_text.push_str("---\n# Tool Documentation\n");
        system_text.push_str(&tool_docs.join("\n\n"));
    }
    (system_text, rest)
}

/// Step 3: fold contiguous runs of `tool` messages into a single synthetic
/// user message carrying `tool_result` blocks.
fn fold_tool_messages(messages: Vec<ChatMessage>) -> Vec<WorkingMessage> {
    let mut out = Vec::new();
    let mut pending: Vec<ContentBlock> = Vec::new();

    let flush = |pending: &mut Vec<ContentBlock>, out: &mut Vec<WorkingMessage>| {
        if pending.is_empty() {
            return;
        }
        out.push(WorkingMessage {
            role: Role::User,
            content: WorkingContent::Blocks(std::mem::take(pending)),
            tool_calls: Vec::new(),
            tool_call_id: None,
        });
    };

    for message in messages {
        if message.role == Role::Tool {
            let text = message.content.extract_text();
            let text = if text.is_empty() {
                "(empty result)".to_string()
            } else {
                text
            };
            pending.push(ContentBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: json!(text),
            });
            continue;
        }
        flush(&mut pending, &mut out);
        out.push(WorkingMessage {
            role: message.role.clone(),
            content: WorkingContent::from_openai(&message.content),
            tool_calls: message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| (tc.id, tc.function.name, tc.function.arguments))
                .collect(),
            tool_call_id: message.tool_call_id.clone(),
        });
    }
    flush(&mut pending, &mut out);
    out
}

/// Step 4: collapse consecutive same-role messages.
fn merge_adjacent(messages: Vec<WorkingMessage>) -> Vec<WorkingMessage> {
    let mut out: Vec<WorkingMessage> = Vec::new();
    for message in messages {
        match out.last_mut() {
            Some(prev) if prev.role == message.role => {
                merge_content(&mut prev.content, message.content);
                if prev.role == Role::Assistant {
                    prev.tool_calls.extend(message.tool_calls);
                }
            }
            _ => out.push(message),
        }
    }
    out
}

fn merge_content(into: &mut WorkingContent, other: WorkingContent) {
    *into = match (std::mem::replace(into, WorkingContent::Text(String::new())), other) {
        (WorkingContent::Blocks(mut a), WorkingContent::Blocks(b)) => {
            a.extend(b);
            WorkingContent::Blocks(a)
        }
        (WorkingContent::Blocks(mut a), WorkingContent::Text(s)) => {
            if !s.is_empty() {
                a.push(ContentBlock::Text { text: s });
            }
            WorkingContent::Blocks(a)
        }
        (WorkingContent::Text(a), WorkingContent::Blocks(mut b)) => {
            if !a.is_empty() {
                b.insert(0, ContentBlock::Text { text: a });
            }
            WorkingContent::Blocks(b)
        }
        (WorkingContent::Text(a), WorkingContent::Text(b)) => {
            WorkingContent::Text(if a.is_empty() {
                b
            } else if b.is_empty() {
                a
            } else {
                format!("{a}\n{b}")
            })
        }
    };
}

struct KiroImage {
    format: String,
    bytes_b64: String,
}

fn extract_images(content: &WorkingContent) -> Vec<KiroImage> {
    let WorkingContent::Blocks(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ImageUrl { image_url } => {
                if let Some(data) = image_url.url.strip_prefix("data:") {
                    let (mime, b64) = data.split_once(";base64,")?;
                    Some(KiroImage {
                        format: mime.split('/').next_back().unwrap_or("png").to_string(),
                        bytes_b64: b64.to_string(),
                    })
                } else {
                    warn!("dropping URL-sourced image (only data: URLs are supported)");
                    None
                }
            }
            ContentBlock::Image { source } => Some(KiroImage {
                format: source.media_type.split('/').next_back().unwrap_or("png").to_string(),
                bytes_b64: source.data.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn extract_tool_results(content: &WorkingContent) -> Vec<Value> {
    let WorkingContent::Blocks(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult { tool_use_id, content } => Some(json!({
                "content": [{"text": content.as_str().map(str::to_string).unwrap_or_else(|| content.to_string())}],
                "status": "success",
                "toolUseId": tool_use_id,
            })),
            _ => None,
        })
        .collect()
}

fn extract_tool_uses(message: &WorkingMessage) -> Vec<Value> {
    let mut uses: Vec<Value> = message
        .tool_calls
        .iter()
        .map(|(id, name, arguments)| {
            let input: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
            json!({ "name": name, "input": input, "toolUseId": id })
        })
        .collect();
    if let WorkingContent::Blocks(blocks) = &message.content {
        for block in blocks {
            if let ContentBlock::ToolUse { id, name, input } = block {
                uses.push(json!({ "name": name, "input": input, "toolUseId": id }));
            }
        }
    }
    uses
}

fn images_to_value(images: &[KiroImage]) -> Option<Value> {
    if images.is_empty() {
        return None;
    }
    Some(Value::Array(
        images
            .iter()
            .map(|img| json!({ "format": img.format, "source": { "bytes": img.bytes_b64 } }))
            .collect(),
    ))
}

fn tools_to_value(tools: &[Tool]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|t| {
                json!({
                    "toolSpecification": {
                        "name": t.function.name,
                        "description": t.function.description,
                        "inputSchema": { "json": t.function.parameters.clone().unwrap_or_else(|| json!({})) },
                    }
                })
            })
            .collect(),
    )
}

fn user_input_message(
    content_text: &str,
    model_id: &str,
    tool_results: Vec<Value>,
    tools: Option<&Value>,
    images: Option<Value>,
) -> Value {
    let mut context = Map::new();
    if !tool_results.is_empty() {
        context.insert("toolResults".to_string(), Value::Array(tool_results));
    }
    if let Some(tools) = tools {
        context.insert("tools".to_string(), tools.clone());
    }
    let mut entry = json!({
        "userInputMessage": {
            "content": content_text,
            "modelId": model_id,
            "origin": "AI_EDITOR",
        }
    });
    if let Some(images) = images {
        entry["userInputMessage"]["images"] = images;
    }
    if !context.is_empty() {
        entry["userInputMessage"]["userInputMessageContext"] = Value::Object(context);
    }
    entry
}

fn history_entry(message: &WorkingMessage, model_id: &str) -> Value {
    match message.role {
        Role::Assistant => {
            let tool_uses = extract_tool_uses(message);
            let mut entry = json!({
                "assistantResponseMessage": { "content": message.content.extract_text() }
            });
            if !tool_uses.is_empty() {
                entry["assistantResponseMessage"]["toolUses"] = Value::Array(tool_uses);
            }
            entry
        }
        _ => {
            let tool_results = extract_tool_results(&message.content);
            user_input_message(&message.content.extract_text(), model_id, tool_results, None, None)
        }
    }
}

/// Full translation pipeline (steps 1-9 of §4.3).
pub fn build_kiro_payload(
    request: &ChatCompletionRequest,
    settings: &Settings,
) -> Result<Value, GatewayError> {
    let model_id = internal_model_id(&request.model).map_err(GatewayError::TranslationError)?;

    let (processed_tools, tool_docs) = request
        .tools
        .as_ref()
        .map(|tools| relocate_long_tool_descriptions(tools, settings.tool_description_max_length))
        .unwrap_or_default();

    let (system_prompt, non_system) = extract_system_and_docs(&request.messages, &tool_docs);

    let folded = fold_tool_messages(non_system);
    let mut merged = merge_adjacent(folded);

    if merged.is_empty() {
        return Err(GatewayError::TranslationError("No messages to send".to_string()));
    }

    let current = merged.pop().unwrap();
    let mut history_messages = merged;

    if !system_prompt.is_empty() && !history_messages.is_empty() {
        if let Some(first) = history_messages.first_mut() {
            if first.role == Role::User {
                first.content.prepend_text(&system_prompt);
            }
        }
    }

    let history: Vec<Value> = history_messages
        .iter()
        .map(|m| history_entry(m, &model_id))
        .collect();

    let mut current = current;
    if !system_prompt.is_empty() && history.is_empty() {
        current.content.prepend_text(&system_prompt);
    }

    let mut history = history;
    let mut current_text;
    if current.role == Role::Assistant {
        history.push(history_entry(&current, &model_id));
        current_text = CONTINUE_PLACEHOLDER.to_string();
    } else {
        current_text = current.content.extract_text();
        if current_text.is_empty() {
            current_text = CONTINUE_PLACEHOLDER.to_string();
        }
    }

    let images = if current.role != Role::Assistant {
        images_to_value(&extract_images(&current.content))
    } else {
        None
    };
    let tool_results = if current.role != Role::Assistant {
        extract_tool_results(&current.content)
    } else {
        Vec::new()
    };
    let tools_value = if !processed_tools.is_empty() {
        Some(tools_to_value(&processed_tools))
    } else {
        None
    };

    let current_message = user_input_message(&current_text, &model_id, tool_results, tools_value.as_ref(), images);

    let mut conversation_state = json!({
        "chatTriggerType": "MANUAL",
        "conversationId": generate_conversation_id(),
        "currentMessage": current_message,
    });
    if !history.is_empty() {
        conversation_state["history"] = Value::Array(history);
    }

    let mut payload = json!({ "conversationState": conversation_state });
    let profile_arn = request.profile_arn.clone();
    if let Some(arn) = profile_arn.filter(|s| !s.is_empty()) {
        payload["profileArn"] = Value::String(arn);
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{ChatMessage, Role};

    fn msg(role: Role, text: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: Content::Text(text.to_string()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn base_request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages,
            stream: false,
            tools: None,
            profile_arn: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn empty_messages_is_a_translation_error() {
        let req = base_request(vec![]);
        let settings = Settings::default();
        let err = build_kiro_payload(&req, &settings).unwrap_err();
        assert!(matches!(err, GatewayError::TranslationError(_)));
    }

    #[test]
    fn system_text_folds_into_first_history_message() {
        let req = base_request(vec![
            msg(Role::System, "You are terse."),
            msg(Role::User, "hi"),
            msg(Role::Assistant, "hello"),
            msg(Role::User, "again"),
        ]);
        let settings = Settings::default();
        let payload = build_kiro_payload(&req, &settings).unwrap();
        let history = payload["conversationState"]["history"].as_array().unwrap();
        let first_content = history[0]["userInputMessage"]["content"].as_str().unwrap();
        assert!(first_content.starts_with("You are terse."));
        assert!(first_content.ends_with("hi"));
    }

    #[test]
    fn trailing_assistant_message_becomes_continue() {
        let req = base_request(vec![msg(Role::User, "hi"), msg(Role::Assistant, "partial")]);
        let settings = Settings::default();
        let payload = build_kiro_payload(&req, &settings).unwrap();
        let current = &payload["conversationState"]["currentMessage"]["userInputMessage"]["content"];
        assert_eq!(current.as_str().unwrap(), CONTINUE_PLACEHOLDER);
        let history = payload["conversationState"]["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn history_strictly_alternates_user_and_assistant() {
        let req = base_request(vec![
            msg(Role::User, "a"),
            msg(Role::Assistant, "b"),
            msg(Role::User, "c"),
            msg(Role::Assistant, "d"),
            msg(Role::User, "e"),
        ]);
        let settings = Settings::default();
        let payload = build_kiro_payload(&req, &settings).unwrap();
        let history = payload["conversationState"]["history"].as_array().unwrap();
        for (i, entry) in history.iter().enumerate() {
            let expects_user = i % 2 == 0;
            assert_eq!(entry.get("userInputMessage").is_some(), expects_user);
            assert_eq!(entry.get("assistantResponseMessage").is_some(), !expects_user);
        }
    }
}
