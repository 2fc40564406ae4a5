//! Upstream response classification. One SSE payload may carry several
//! parts; each becomes its own event for the per-dialect emitters.

use antigate_protocol::gemini::{Blob, FunctionCall, GenerateContentResponse, UsageMetadata};

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Text(String),
    Thinking(String),
    ToolCall(FunctionCall),
    Image(Blob),
    Usage(UsageMetadata),
    Finish(String),
}

pub fn classify_response(response: &GenerateContentResponse) -> Vec<UpstreamEvent> {
    let mut events = Vec::new();

    for part in response.first_parts() {
        if let Some(text) = &part.text
            && !text.is_empty()
        {
            if part.thought == Some(true) {
                events.push(UpstreamEvent::Thinking(text.clone()));
            } else {
                events.push(UpstreamEvent::Text(text.clone()));
            }
        }
        if let Some(call) = &part.function_call {
            events.push(UpstreamEvent::ToolCall(call.clone()));
        }
        if let Some(blob) = &part.inline_data {
            events.push(UpstreamEvent::Image(blob.clone()));
        }
    }

    if let Some(usage) = &response.usage_metadata {
        events.push(UpstreamEvent::Usage(usage.clone()));
    }
    if let Some(reason) = response
        .candidates
        .first()
        .and_then(|candidate| candidate.finish_reason.clone())
    {
        events.push(UpstreamEvent::Finish(reason));
    }

    events
}
