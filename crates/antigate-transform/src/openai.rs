//! OpenAI chat-completions → upstream translation. The other two dialects
//! funnel through here: Anthropic via `map_claude_to_openai`, Gemini with
//! its own lighter path in `gemini.rs`.

use std::error::Error;
use std::fmt;

use serde_json::Value as JsonValue;
use tracing::warn;

use antigate_protocol::gemini::{
    Content, FunctionCall, FunctionResponse, GenerateContentRequest, GenerationConfig, Part,
    ThinkingConfig,
};
use antigate_protocol::openai::{ChatCompletionRequest, ChatMessage};

use crate::signatures::SignatureStore;
use crate::tools::{extract_tool_content, map_tool_declarations, tool_response_name};

/// Stop sequences the upstream expects on every request.
const STOP_SEQUENCES: [&str; 5] = [
    "<|user|>",
    "<|bot|>",
    "<|context_request|>",
    "<|endoftext|>",
    "<|end_of_turn|>",
];

const DEFAULT_TEMPERATURE: f64 = 1.0;
const DEFAULT_TOP_P: f64 = 0.95;
const DEFAULT_TOP_K: u32 = 64;
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 65535;
const THINKING_BUDGET: u32 = 1024;

/// Models that think without advertising it in the name.
const THINKING_ALLOWLIST: [&str; 2] = ["claude-sonnet-4-5", "claude-opus-4-5"];

const IMAGE_STEERING_NOTE: &str =
    "When asked for images, generate them inline and keep any accompanying text brief.";

#[derive(Debug, Clone)]
pub enum AdapterError {
    InvalidMessage(String),
    EmptyRequest,
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::InvalidMessage(msg) => write!(f, "invalid message: {msg}"),
            AdapterError::EmptyRequest => write!(f, "request carries no usable messages"),
        }
    }
}

impl Error for AdapterError {}

#[derive(Debug, Clone)]
pub struct AdaptedRequest {
    /// Model name as the client sent it.
    pub client_model: String,
    /// Normalized upstream model id.
    pub upstream_model: String,
    pub stream: bool,
    pub request: GenerateContentRequest,
}

pub fn from_openai_chat(
    body: &ChatCompletionRequest,
    signatures: &SignatureStore,
) -> Result<AdaptedRequest, AdapterError> {
    if body.messages.is_empty() {
        return Err(AdapterError::EmptyRequest);
    }
    let client_model = body.model.clone();
    let model = client_model
        .strip_prefix("models/")
        .unwrap_or(&client_model)
        .to_string();

    let mut contents: Vec<Content> = Vec::new();
    for message in &body.messages {
        match message.role.as_str() {
            "system" | "developer" | "user" => push_user_message(&mut contents, message),
            "assistant" => push_assistant_message(&mut contents, message, &model, signatures),
            "tool" => push_tool_message(&mut contents, message),
            other => {
                return Err(AdapterError::InvalidMessage(format!(
                    "unknown role: {other}"
                )));
            }
        }
    }
    if contents.is_empty() {
        return Err(AdapterError::EmptyRequest);
    }

    let mut request = GenerateContentRequest {
        contents,
        tools: body.tools.as_deref().and_then(map_tool_declarations),
        generation_config: Some(generation_config(body, &model)),
        ..GenerateContentRequest::default()
    };

    if is_claude_family(&model) {
        apply_claude_constraints(&mut request);
    }
    if is_image_model(&model) {
        apply_image_config(&mut request);
    }

    Ok(AdaptedRequest {
        client_model,
        upstream_model: model,
        stream: body.stream.unwrap_or(false),
        request,
    })
}

pub fn is_claude_family(model: &str) -> bool {
    model.contains("claude")
}

pub fn is_image_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("image")
}

fn is_gemini3_family(model: &str) -> bool {
    model.contains("gemini-3")
}

fn thinking_enabled(model: &str) -> bool {
    model.ends_with("-thinking")
        || model == "gemini-2.5-pro"
        || model.starts_with("gemini-3-pro-")
        || THINKING_ALLOWLIST.contains(&model)
}

fn push_user_message(contents: &mut Vec<Content>, message: &ChatMessage) {
    let parts = user_parts(message.content.as_ref());
    if !parts.is_empty() {
        contents.push(Content::user(parts));
    }
}

/// System and user content: plain text plus data-URI images.
fn user_parts(content: Option<&JsonValue>) -> Vec<Part> {
    let mut parts = Vec::new();
    match content {
        Some(JsonValue::String(text)) => {
            if !text.is_empty() {
                parts.push(Part::text(text.clone()));
            }
        }
        Some(JsonValue::Array(items)) => {
            for item in items {
                match item.get("type").and_then(|v| v.as_str()) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(|v| v.as_str())
                            && !text.is_empty()
                        {
                            parts.push(Part::text(text.to_string()));
                        }
                    }
                    Some("image_url") => {
                        let url = item
                            .get("image_url")
                            .and_then(|v| v.get("url"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        match parse_data_url(url) {
                            Some((mime, data)) => parts.push(Part::inline_data(mime, data)),
                            None => warn!("skipping non-data image url in user message"),
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    parts
}

fn push_assistant_message(
    contents: &mut Vec<Content>,
    message: &ChatMessage,
    model: &str,
    signatures: &SignatureStore,
) {
    let text = assistant_text(message.content.as_ref());
    let mut call_parts = Vec::new();
    if let Some(tool_calls) = &message.tool_calls {
        for call in tool_calls {
            let args = serde_json::from_str(&call.function.arguments)
                .unwrap_or(JsonValue::String(call.function.arguments.clone()));
            let mut part = Part::function_call(FunctionCall {
                id: Some(call.id.clone()),
                name: call.function.name.clone(),
                args: Some(args),
            });
            part.thought_signature = signatures.for_tool_call(&call.id);
            call_parts.push(part);
        }
    }

    // A tool-call-only assistant turn continues the previous model turn when
    // that turn is itself tool-calls only.
    if text.is_none() && !call_parts.is_empty() {
        if let Some(last) = contents.last_mut()
            && last.role.as_deref() == Some("model")
            && last.parts.iter().all(|part| part.function_call.is_some())
        {
            last.parts.extend(call_parts);
            return;
        }
        contents.push(Content::model(call_parts));
        return;
    }

    let mut parts = Vec::new();
    if let Some(text) = text {
        if is_gemini3_family(model) {
            match signatures.for_text(&text) {
                Some(signature) => {
                    let mut part = Part::text(text);
                    part.thought_signature = Some(signature);
                    parts.push(part);
                }
                None => {
                    // The upstream rejects unsigned replayed text for this
                    // family; the part is dropped, never forged.
                    warn!(model, "no thought signature for assistant text, dropping part");
                }
            }
        } else {
            parts.push(Part::text(text));
        }
    }
    parts.extend(call_parts);
    if !parts.is_empty() {
        contents.push(Content::model(parts));
    }
}

fn assistant_text(content: Option<&JsonValue>) -> Option<String> {
    match content {
        Some(JsonValue::String(text)) if !text.is_empty() => Some(text.clone()),
        Some(JsonValue::Array(items)) => {
            let joined = items
                .iter()
                .filter_map(|item| item.get("text").and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
                .join("\n");
            if joined.is_empty() { None } else { Some(joined) }
        }
        _ => None,
    }
}

fn push_tool_message(contents: &mut Vec<Content>, message: &ChatMessage) {
    let tool_call_id = message.tool_call_id.clone().unwrap_or_default();
    let name = tool_response_name(contents, &tool_call_id)
        .or_else(|| message.name.clone())
        .unwrap_or_else(|| tool_call_id.clone());
    let text = message
        .content
        .as_ref()
        .map(extract_tool_content)
        .unwrap_or_default();
    let part = Part::function_response(FunctionResponse {
        id: if tool_call_id.is_empty() {
            None
        } else {
            Some(tool_call_id)
        },
        name,
        response: JsonValue::String(text),
    });

    // Consecutive tool results share one user turn.
    if let Some(last) = contents.last_mut()
        && last.role.as_deref() == Some("user")
        && last.parts.iter().all(|p| p.function_response.is_some())
    {
        last.parts.push(part);
        return;
    }
    contents.push(Content::user(vec![part]));
}

fn generation_config(body: &ChatCompletionRequest, model: &str) -> GenerationConfig {
    let mut stop_sequences: Vec<String> =
        STOP_SEQUENCES.iter().map(|s| s.to_string()).collect();
    match &body.stop {
        Some(JsonValue::String(stop)) => stop_sequences.push(stop.clone()),
        Some(JsonValue::Array(stops)) => {
            stop_sequences.extend(
                stops
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string())),
            );
        }
        _ => {}
    }

    let enabled = thinking_enabled(model);
    GenerationConfig {
        temperature: Some(body.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
        top_p: Some(body.top_p.unwrap_or(DEFAULT_TOP_P)),
        top_k: Some(body.top_k.unwrap_or(DEFAULT_TOP_K)),
        max_output_tokens: Some(
            body.max_completion_tokens
                .or(body.max_tokens)
                .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
        ),
        stop_sequences,
        response_modalities: None,
        thinking_config: Some(ThinkingConfig {
            include_thoughts: enabled,
            thinking_budget: if enabled { THINKING_BUDGET } else { 0 },
        }),
    }
}

/// The upstream rejects Claude-family requests that carry thought signatures
/// or that enable thinking on top of tool-call history.
fn apply_claude_constraints(request: &mut GenerateContentRequest) {
    let has_tool_history = request.contents.iter().any(|content| {
        content
            .parts
            .iter()
            .any(|part| part.function_call.is_some() || part.function_response.is_some())
    });
    for content in &mut request.contents {
        for part in &mut content.parts {
            part.thought_signature = None;
        }
    }
    if has_tool_history
        && let Some(config) = request.generation_config.as_mut()
        && let Some(thinking) = config.thinking_config.as_mut()
        && thinking.include_thoughts
    {
        thinking.include_thoughts = false;
        thinking.thinking_budget = 0;
    }
}

fn apply_image_config(request: &mut GenerateContentRequest) {
    if let Some(config) = request.generation_config.as_mut() {
        config.response_modalities = Some(vec!["TEXT".to_string(), "IMAGE".to_string()]);
    }
    let note = Part::text(IMAGE_STEERING_NOTE);
    match request.system_instruction.as_mut() {
        Some(instruction) => instruction.parts.push(note),
        None => {
            request.system_instruction = Some(Content {
                role: None,
                parts: vec![note],
            });
        }
    }
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}
