//! Buffered (non-stream) response assembly from classified events, plus the
//! chunk merger used when the upstream only speaks SSE.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value as JsonValue;

use antigate_protocol::claude::{ContentBlock, MessageUsage, MessagesResponse};
use antigate_protocol::gemini::{Content, GenerateContentResponse, Part};
use antigate_protocol::openai::{
    ChatChoice, ChatCompletion, ChatMessage, ToolCall, ToolCallFunction,
};

use crate::events::UpstreamEvent;
use crate::openai_stream::map_usage;

pub fn to_openai_completion(events: &[UpstreamEvent], model: &str) -> ChatCompletion {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    let mut usage = None;

    for event in events {
        match event {
            UpstreamEvent::Text(text) => content.push_str(text),
            UpstreamEvent::ToolCall(call) => {
                let arguments = call
                    .args
                    .as_ref()
                    .and_then(|args| serde_json::to_string(args).ok())
                    .unwrap_or_else(|| "{}".to_string());
                tool_calls.push(ToolCall {
                    id: call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                    kind: Some("function".to_string()),
                    function: ToolCallFunction {
                        name: call.name.clone(),
                        arguments,
                    },
                });
            }
            UpstreamEvent::Usage(metadata) => usage = Some(map_usage(metadata)),
            UpstreamEvent::Thinking(_) | UpstreamEvent::Image(_) | UpstreamEvent::Finish(_) => {}
        }
    }

    let finish_reason = if tool_calls.is_empty() {
        "stop"
    } else {
        "tool_calls"
    };
    ChatCompletion {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion",
        created: unix_seconds(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: Some(JsonValue::String(content)),
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                ..ChatMessage::default()
            },
            finish_reason: finish_reason.to_string(),
        }],
        usage,
    }
}

pub fn to_claude_message(
    events: &[UpstreamEvent],
    model: &str,
    input_estimate: i64,
) -> MessagesResponse {
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut saw_tool_use = false;
    let mut output_chars = 0usize;
    let mut usage = None;

    for event in events {
        match event {
            UpstreamEvent::Thinking(text) => {
                output_chars += text.chars().count();
                match blocks.last_mut() {
                    Some(ContentBlock::Thinking { thinking }) => thinking.push_str(text),
                    _ => blocks.push(ContentBlock::Thinking {
                        thinking: text.clone(),
                    }),
                }
            }
            UpstreamEvent::Text(text) => {
                output_chars += text.chars().count();
                match blocks.last_mut() {
                    Some(ContentBlock::Text { text: existing }) => existing.push_str(text),
                    _ => blocks.push(ContentBlock::Text { text: text.clone() }),
                }
            }
            UpstreamEvent::ToolCall(call) => {
                saw_tool_use = true;
                blocks.push(ContentBlock::ToolUse {
                    id: call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple())),
                    name: call.name.clone(),
                    input: call.args.clone().unwrap_or(JsonValue::Object(Default::default())),
                });
            }
            UpstreamEvent::Usage(metadata) => usage = Some(metadata.clone()),
            UpstreamEvent::Image(_) | UpstreamEvent::Finish(_) => {}
        }
    }

    let (input_tokens, output_tokens) = match &usage {
        Some(metadata) => (
            metadata.prompt_token_count.unwrap_or(input_estimate),
            metadata
                .candidates_token_count
                .unwrap_or(((output_chars as i64) + 3) / 4),
        ),
        None => (input_estimate, ((output_chars as i64) + 3) / 4),
    };

    MessagesResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        kind: "message",
        role: "assistant",
        model: model.to_string(),
        content: blocks,
        stop_reason: Some(
            if saw_tool_use {
                "tool_use"
            } else {
                "end_turn"
            }
            .to_string(),
        ),
        stop_sequence: None,
        usage: MessageUsage {
            input_tokens,
            output_tokens,
        },
    }
}

/// Merge a streamed chunk sequence into one response mirroring the upstream
/// schema. Adjacent text parts of the same kind coalesce; a thought
/// signature seen anywhere in a run sticks to the merged part.
pub fn merge_chunks(chunks: Vec<GenerateContentResponse>) -> GenerateContentResponse {
    let mut merged_parts: Vec<Part> = Vec::new();
    let mut finish_reason = None;
    let mut usage = None;
    let mut model_version = None;
    let mut response_id = None;

    for chunk in chunks {
        if let Some(reason) = chunk
            .candidates
            .first()
            .and_then(|candidate| candidate.finish_reason.clone())
        {
            finish_reason = Some(reason);
        }
        if chunk.usage_metadata.is_some() {
            usage = chunk.usage_metadata.clone();
        }
        if chunk.model_version.is_some() {
            model_version = chunk.model_version.clone();
        }
        if chunk.response_id.is_some() {
            response_id = chunk.response_id.clone();
        }

        for part in chunk.first_parts() {
            let mergeable_text = part.text.is_some()
                && part.function_call.is_none()
                && part.function_response.is_none()
                && part.inline_data.is_none();
            if mergeable_text
                && let Some(last) = merged_parts.last_mut()
                && last.text.is_some()
                && last.thought == part.thought
                && last.function_call.is_none()
                && last.inline_data.is_none()
            {
                if let (Some(existing), Some(incoming)) = (last.text.as_mut(), part.text.as_ref()) {
                    existing.push_str(incoming);
                }
                if part.thought_signature.is_some() {
                    last.thought_signature = part.thought_signature.clone();
                }
                continue;
            }
            merged_parts.push(part.clone());
        }
    }

    GenerateContentResponse {
        candidates: vec![antigate_protocol::gemini::Candidate {
            content: Some(Content::model(merged_parts)),
            finish_reason,
            index: Some(0),
        }],
        usage_metadata: usage,
        model_version,
        response_id,
    }
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
