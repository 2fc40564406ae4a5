//! Upstream events → Anthropic event-stream sequencing. The sequence is a
//! strict grammar: message_start, content blocks (start/delta/stop), one
//! message_delta with final usage, message_stop.

use serde_json::Value as JsonValue;

use antigate_protocol::claude::{
    ContentBlock, ContentDelta, MessageStart, MessageUsage, StreamEvent,
};
use antigate_protocol::gemini::UsageMetadata;

use crate::events::UpstreamEvent;

#[derive(Debug, Clone, Copy, PartialEq)]
enum OpenBlock {
    Text,
    Thinking,
}

pub struct ClaudeStreamEncoder {
    model: String,
    message_id: String,
    next_index: u32,
    open_block: Option<OpenBlock>,
    saw_tool_use: bool,
    input_estimate: i64,
    output_chars: usize,
    usage: Option<UsageMetadata>,
    stop_sent: bool,
}

impl ClaudeStreamEncoder {
    pub fn new(model: impl Into<String>, input_estimate: i64) -> Self {
        Self {
            model: model.into(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            next_index: 0,
            open_block: None,
            saw_tool_use: false,
            input_estimate,
            output_chars: 0,
            usage: None,
            stop_sent: false,
        }
    }

    pub fn start(&self) -> Vec<StreamEvent> {
        let message = MessageStart {
            id: self.message_id.clone(),
            kind: "message",
            role: "assistant",
            model: self.model.clone(),
            content: Vec::new(),
            stop_reason: None,
            stop_sequence: None,
            usage: MessageUsage {
                input_tokens: self.input_estimate,
                output_tokens: 0,
            },
        };
        vec![
            StreamEvent::MessageStart {
                message: serde_json::to_value(&message).unwrap_or(JsonValue::Null),
            },
            StreamEvent::Ping,
        ]
    }

    pub fn on_event(&mut self, event: &UpstreamEvent) -> Vec<StreamEvent> {
        match event {
            UpstreamEvent::Thinking(text) => {
                self.output_chars += text.chars().count();
                let mut events = self.ensure_block(OpenBlock::Thinking);
                events.push(StreamEvent::ContentBlockDelta {
                    index: self.current_index(),
                    delta: ContentDelta::ThinkingDelta {
                        thinking: text.clone(),
                    },
                });
                events
            }
            UpstreamEvent::Text(text) => {
                self.output_chars += text.chars().count();
                let mut events = self.ensure_block(OpenBlock::Text);
                events.push(StreamEvent::ContentBlockDelta {
                    index: self.current_index(),
                    delta: ContentDelta::TextDelta { text: text.clone() },
                });
                events
            }
            UpstreamEvent::ToolCall(call) => {
                self.saw_tool_use = true;
                let mut events = self.close_open_block();
                let index = self.next_index;
                self.next_index += 1;
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                let args = call.args.clone().unwrap_or(JsonValue::Object(Default::default()));
                let partial_json = args.to_string();
                self.output_chars += partial_json.chars().count();
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse {
                        id,
                        name: call.name.clone(),
                        input: JsonValue::Object(Default::default()),
                    },
                });
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::InputJsonDelta { partial_json },
                });
                events.push(StreamEvent::ContentBlockStop { index });
                events
            }
            UpstreamEvent::Usage(usage) => {
                self.usage = Some(usage.clone());
                Vec::new()
            }
            UpstreamEvent::Image(_) | UpstreamEvent::Finish(_) => Vec::new(),
        }
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.stop_sent {
            return Vec::new();
        }
        self.stop_sent = true;
        let mut events = self.close_open_block();
        let stop_reason = if self.saw_tool_use {
            "tool_use"
        } else {
            "end_turn"
        };
        let (input_tokens, output_tokens) = match &self.usage {
            Some(usage) => (
                usage.prompt_token_count.unwrap_or(self.input_estimate),
                usage
                    .candidates_token_count
                    .unwrap_or_else(|| self.estimated_output()),
            ),
            None => (self.input_estimate, self.estimated_output()),
        };
        events.push(StreamEvent::MessageDelta {
            delta: serde_json::json!({
                "stop_reason": stop_reason,
                "stop_sequence": JsonValue::Null,
            }),
            usage: serde_json::json!({
                "input_tokens": input_tokens,
                "output_tokens": output_tokens,
            }),
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    fn estimated_output(&self) -> i64 {
        let n = self.output_chars as i64;
        (n + 3) / 4
    }

    fn current_index(&self) -> u32 {
        self.next_index - 1
    }

    fn ensure_block(&mut self, kind: OpenBlock) -> Vec<StreamEvent> {
        if self.open_block == Some(kind) {
            return Vec::new();
        }
        let mut events = self.close_open_block();
        let index = self.next_index;
        self.next_index += 1;
        let content_block = match kind {
            OpenBlock::Text => ContentBlock::Text {
                text: String::new(),
            },
            OpenBlock::Thinking => ContentBlock::Thinking {
                thinking: String::new(),
            },
        };
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
        self.open_block = Some(kind);
        events
    }

    fn close_open_block(&mut self) -> Vec<StreamEvent> {
        match self.open_block.take() {
            Some(_) => vec![StreamEvent::ContentBlockStop {
                index: self.current_index(),
            }],
            None => Vec::new(),
        }
    }
}
