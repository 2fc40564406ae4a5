//! Anthropic messages → OpenAI chat shape. The Anthropic surface is a
//! dialect hop: map here, then share the OpenAI → upstream path.

use serde_json::Value as JsonValue;

use antigate_protocol::claude::MessagesRequest;
use antigate_protocol::openai::{
    ChatCompletionRequest, ChatMessage, FunctionSpec, ToolCall, ToolCallFunction, ToolDefinition,
};

pub fn map_claude_to_openai(body: &MessagesRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();

    if let Some(system) = &body.system {
        let text = system_text(system);
        if !text.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Some(JsonValue::String(text)),
                ..ChatMessage::default()
            });
        }
    }

    for message in &body.messages {
        match message.role.as_str() {
            "assistant" => push_assistant(&mut messages, &message.content),
            _ => push_user(&mut messages, &message.content),
        }
    }

    let tools = body.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| ToolDefinition {
                kind: "function".to_string(),
                function: FunctionSpec {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect::<Vec<_>>()
    });

    ChatCompletionRequest {
        model: body.model.clone(),
        messages,
        stream: body.stream,
        temperature: body.temperature,
        top_p: body.top_p,
        top_k: body.top_k,
        max_tokens: body.max_tokens,
        max_completion_tokens: None,
        stop: body.stop_sequences.as_ref().map(|stops| {
            JsonValue::Array(
                stops
                    .iter()
                    .map(|s| JsonValue::String(s.clone()))
                    .collect(),
            )
        }),
        tools,
        tool_choice: body.tool_choice.clone(),
    }
}

fn system_text(system: &JsonValue) -> String {
    match system {
        JsonValue::String(text) => text.clone(),
        JsonValue::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn push_user(messages: &mut Vec<ChatMessage>, content: &JsonValue) {
    match content {
        JsonValue::String(text) => {
            messages.push(ChatMessage {
                role: "user".to_string(),
                content: Some(JsonValue::String(text.clone())),
                ..ChatMessage::default()
            });
        }
        JsonValue::Array(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                match block.get("type").and_then(|v| v.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                            parts.push(serde_json::json!({"type": "text", "text": text}));
                        }
                    }
                    Some("image") => {
                        if let Some(part) = image_block_to_data_url(block) {
                            parts.push(part);
                        }
                    }
                    Some("tool_result") => {
                        // Tool results become their own OpenAI tool messages.
                        flush_parts(messages, &mut parts);
                        let tool_call_id = block
                            .get("tool_use_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let content = block.get("content").cloned().unwrap_or(JsonValue::Null);
                        messages.push(ChatMessage {
                            role: "tool".to_string(),
                            content: Some(content),
                            tool_call_id: Some(tool_call_id),
                            ..ChatMessage::default()
                        });
                    }
                    _ => {}
                }
            }
            flush_parts(messages, &mut parts);
        }
        _ => {}
    }
}

fn flush_parts(messages: &mut Vec<ChatMessage>, parts: &mut Vec<JsonValue>) {
    if parts.is_empty() {
        return;
    }
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: Some(JsonValue::Array(std::mem::take(parts))),
        ..ChatMessage::default()
    });
}

fn push_assistant(messages: &mut Vec<ChatMessage>, content: &JsonValue) {
    match content {
        JsonValue::String(text) => {
            messages.push(ChatMessage {
                role: "assistant".to_string(),
                content: Some(JsonValue::String(text.clone())),
                ..ChatMessage::default()
            });
        }
        JsonValue::Array(blocks) => {
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();
            for block in blocks {
                match block.get("type").and_then(|v| v.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                            text_parts.push(text.to_string());
                        }
                    }
                    Some("tool_use") => {
                        let id = block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let name = block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let input = block.get("input").cloned().unwrap_or(JsonValue::Null);
                        tool_calls.push(ToolCall {
                            id,
                            kind: Some("function".to_string()),
                            function: ToolCallFunction {
                                name,
                                arguments: input.to_string(),
                            },
                        });
                    }
                    // Replayed thinking blocks are dropped; the upstream
                    // regenerates its own chain of thought.
                    Some("thinking") | Some("redacted_thinking") => {}
                    _ => {}
                }
            }
            let content = if text_parts.is_empty() {
                None
            } else {
                Some(JsonValue::String(text_parts.join("\n")))
            };
            if content.is_some() || !tool_calls.is_empty() {
                messages.push(ChatMessage {
                    role: "assistant".to_string(),
                    content,
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                    ..ChatMessage::default()
                });
            }
        }
        _ => {}
    }
}

fn image_block_to_data_url(block: &JsonValue) -> Option<JsonValue> {
    let source = block.get("source")?;
    if source.get("type").and_then(|v| v.as_str()) != Some("base64") {
        return None;
    }
    let media_type = source.get("media_type").and_then(|v| v.as_str())?;
    let data = source.get("data").and_then(|v| v.as_str())?;
    Some(serde_json::json!({
        "type": "image_url",
        "image_url": { "url": format!("data:{media_type};base64,{data}") }
    }))
}

/// Rough 4-characters-per-token estimate used by the count_tokens surface
/// and as the streaming usage fallback.
pub fn estimate_tokens(text: &str) -> i64 {
    let n = text.chars().count() as i64;
    (n + 3) / 4
}

/// Sum the estimator over every text block in a messages request.
pub fn estimate_request_tokens(body: &MessagesRequest) -> i64 {
    let mut total = 0;
    if let Some(system) = &body.system {
        total += estimate_tokens(&system_text(system));
    }
    for message in &body.messages {
        match &message.content {
            JsonValue::String(text) => total += estimate_tokens(text),
            JsonValue::Array(blocks) => {
                for block in blocks {
                    if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                        total += estimate_tokens(text);
                    }
                }
            }
            _ => {}
        }
    }
    total
}
