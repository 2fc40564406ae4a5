//! Upstream events → OpenAI chat.completion.chunk encoding.

use std::time::{SystemTime, UNIX_EPOCH};

use antigate_protocol::gemini::UsageMetadata;
use antigate_protocol::openai::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ToolCallChunk, ToolCallFunctionChunk, Usage,
};

use crate::events::UpstreamEvent;

/// The upstream occasionally inlines its reasoning into plain text events
/// between these markers; clients expect it under `reasoning_content`.
const THINK_OPEN: &str = "<思考>";
const THINK_CLOSE: &str = "</思考>";

pub struct OpenAiStreamEncoder {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    tool_index: u32,
    saw_tool_call: bool,
    inside_think_marker: bool,
    usage: Option<Usage>,
}

impl OpenAiStreamEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            created: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            role_sent: false,
            tool_index: 0,
            saw_tool_call: false,
            inside_think_marker: false,
            usage: None,
        }
    }

    pub fn saw_tool_call(&self) -> bool {
        self.saw_tool_call
    }

    pub fn on_event(&mut self, event: &UpstreamEvent) -> Vec<ChatCompletionChunk> {
        match event {
            UpstreamEvent::Text(text) => {
                let (content, reasoning) = self.split_think_markers(text);
                let mut chunks = Vec::new();
                if !content.is_empty() {
                    let role = self.take_role();
                    chunks.push(self.chunk(ChunkDelta {
                        role,
                        content: Some(content),
                        ..ChunkDelta::default()
                    }));
                }
                if !reasoning.is_empty() {
                    let role = self.take_role();
                    chunks.push(self.chunk(ChunkDelta {
                        role,
                        reasoning_content: Some(reasoning),
                        ..ChunkDelta::default()
                    }));
                }
                chunks
            }
            UpstreamEvent::Thinking(text) => {
                let role = self.take_role();
                vec![self.chunk(ChunkDelta {
                    role,
                    reasoning_content: Some(text.clone()),
                    ..ChunkDelta::default()
                })]
            }
            UpstreamEvent::ToolCall(call) => {
                self.saw_tool_call = true;
                let index = self.tool_index;
                self.tool_index += 1;
                let arguments = call
                    .args
                    .as_ref()
                    .and_then(|args| serde_json::to_string(args).ok())
                    .unwrap_or_else(|| "{}".to_string());
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                let role = self.take_role();
                vec![self.chunk(ChunkDelta {
                    role,
                    tool_calls: Some(vec![ToolCallChunk {
                        index,
                        id: Some(id),
                        kind: Some("function"),
                        function: ToolCallFunctionChunk {
                            name: Some(call.name.clone()),
                            arguments: Some(arguments),
                        },
                    }]),
                    ..ChunkDelta::default()
                })]
            }
            UpstreamEvent::Usage(usage) => {
                self.usage = Some(map_usage(usage));
                Vec::new()
            }
            UpstreamEvent::Image(_) | UpstreamEvent::Finish(_) => Vec::new(),
        }
    }

    /// Terminal chunk: empty delta, finish_reason, usage when known.
    pub fn finish(&mut self) -> ChatCompletionChunk {
        let finish_reason = if self.saw_tool_call {
            "tool_calls"
        } else {
            "stop"
        };
        let mut chunk = self.chunk(ChunkDelta::default());
        chunk.choices[0].finish_reason = Some(finish_reason.to_string());
        chunk.usage = self.usage.clone();
        chunk
    }

    fn chunk(&self, delta: ChunkDelta) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
            usage: None,
        }
    }

    fn take_role(&mut self) -> Option<String> {
        if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some("assistant".to_string())
        }
    }

    /// Split one text event into (content, reasoning). Marker state survives
    /// across events so a block spanning several chunks stays reasoning.
    fn split_think_markers(&mut self, text: &str) -> (String, String) {
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut rest = text;
        loop {
            if self.inside_think_marker {
                match rest.find(THINK_CLOSE) {
                    Some(pos) => {
                        reasoning.push_str(&rest[..pos]);
                        rest = &rest[pos + THINK_CLOSE.len()..];
                        self.inside_think_marker = false;
                    }
                    None => {
                        reasoning.push_str(rest);
                        break;
                    }
                }
            } else {
                match rest.find(THINK_OPEN) {
                    Some(pos) => {
                        content.push_str(&rest[..pos]);
                        rest = &rest[pos + THINK_OPEN.len()..];
                        self.inside_think_marker = true;
                    }
                    None => {
                        content.push_str(rest);
                        break;
                    }
                }
            }
        }
        (content, reasoning)
    }
}

pub(crate) fn map_usage(usage: &UsageMetadata) -> Usage {
    let prompt = usage.prompt_token_count.unwrap_or(0);
    let completion = usage.candidates_token_count.unwrap_or(0);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: usage.total_token_count.unwrap_or(prompt + completion),
    }
}
