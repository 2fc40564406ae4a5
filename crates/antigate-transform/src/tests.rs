use serde_json::json;

use antigate_protocol::claude::{ContentBlock, ContentDelta, MessagesRequest, StreamEvent};
use antigate_protocol::gemini::{
    Candidate, Content, FunctionCall, GenerateContentResponse, Part, UsageMetadata,
};
use antigate_protocol::openai::ChatCompletionRequest;

use crate::claude::map_claude_to_openai;
use crate::claude_stream::ClaudeStreamEncoder;
use crate::collect::{merge_chunks, to_openai_completion};
use crate::events::UpstreamEvent;
use crate::openai::from_openai_chat;
use crate::openai_stream::OpenAiStreamEncoder;
use crate::schema::clean_tool_schema;
use crate::signatures::SignatureStore;

fn openai_request(value: serde_json::Value) -> ChatCompletionRequest {
    serde_json::from_value(value).unwrap()
}

#[test]
fn schema_cleaner_strips_and_surfaces_constraints() {
    let schema = json!({
        "type": "object",
        "properties": {
            "x": { "type": "string", "minLength": 3, "pattern": "^a" }
        },
        "additionalProperties": false,
        "required": ["x"]
    });
    let cleaned = clean_tool_schema(&schema);

    assert!(cleaned.get("additionalProperties").is_none());
    assert!(cleaned["properties"]["x"].get("minLength").is_none());
    assert!(cleaned["properties"]["x"].get("pattern").is_none());
    assert_eq!(cleaned["required"], json!(["x"]));

    let description = cleaned["description"].as_str().unwrap();
    assert!(description.contains("minLength: 3"));
    assert!(description.contains("pattern: ^a"));
    assert!(description.contains("no additional properties"));
}

#[test]
fn schema_cleaner_drops_rejected_keywords_and_empty_required() {
    let schema = json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": [],
        "properties": {
            "items": {
                "type": "array",
                "uniqueItems": true,
                "exclusiveMinimum": 0,
                "items": { "type": "number", "multipleOf": 2 }
            }
        }
    });
    let cleaned = clean_tool_schema(&schema);
    assert!(cleaned.get("$schema").is_none());
    assert!(cleaned.get("required").is_none());
    assert!(cleaned["properties"]["items"].get("uniqueItems").is_none());
    assert!(cleaned["properties"]["items"].get("exclusiveMinimum").is_none());
    assert!(cleaned["properties"]["items"]["items"].get("multipleOf").is_none());
    assert!(cleaned["description"].as_str().unwrap().contains("multipleOf: 2"));
    // Untouched fields ride through.
    assert_eq!(cleaned["properties"]["items"]["type"], json!("array"));
}

#[test]
fn adapter_maps_user_and_system_to_user_turns() {
    let store = SignatureStore::new();
    let request = openai_request(json!({
        "model": "gemini-2.5-flash",
        "messages": [
            { "role": "system", "content": "be brief" },
            { "role": "user", "content": "ping" }
        ]
    }));
    let adapted = from_openai_chat(&request, &store).unwrap();

    assert_eq!(adapted.upstream_model, "gemini-2.5-flash");
    assert!(!adapted.stream);
    assert_eq!(adapted.request.contents.len(), 2);
    assert_eq!(adapted.request.contents[0].role.as_deref(), Some("user"));
    assert_eq!(
        adapted.request.contents[0].parts[0].text.as_deref(),
        Some("be brief")
    );

    let config = adapted.request.generation_config.as_ref().unwrap();
    assert!(config.stop_sequences.contains(&"<|user|>".to_string()));
    assert!(config.stop_sequences.contains(&"<|end_of_turn|>".to_string()));
    let thinking = config.thinking_config.as_ref().unwrap();
    assert!(!thinking.include_thoughts);
    assert_eq!(thinking.thinking_budget, 0);
}

#[test]
fn adapter_decodes_data_uri_images() {
    let store = SignatureStore::new();
    let request = openai_request(json!({
        "model": "gemini-2.5-flash",
        "messages": [{
            "role": "user",
            "content": [
                { "type": "text", "text": "what is this" },
                { "type": "image_url", "image_url": { "url": "data:image/png;base64,aGk=" } }
            ]
        }]
    }));
    let adapted = from_openai_chat(&request, &store).unwrap();
    let parts = &adapted.request.contents[0].parts;
    assert_eq!(parts.len(), 2);
    let blob = parts[1].inline_data.as_ref().unwrap();
    assert_eq!(blob.mime_type, "image/png");
    assert_eq!(blob.data, "aGk=");
}

#[test]
fn adapter_pairs_tool_results_with_prior_calls() {
    let store = SignatureStore::new();
    let request = openai_request(json!({
        "model": "gemini-2.5-flash",
        "messages": [
            { "role": "user", "content": "look it up" },
            { "role": "assistant", "tool_calls": [
                { "id": "call-7", "type": "function",
                  "function": { "name": "lookup", "arguments": "{\"q\":\"x\"}" } }
            ]},
            { "role": "tool", "tool_call_id": "call-7", "content": "result text" }
        ]
    }));
    let adapted = from_openai_chat(&request, &store).unwrap();

    let model_turn = &adapted.request.contents[1];
    assert_eq!(model_turn.role.as_deref(), Some("model"));
    let call = model_turn.parts[0].function_call.as_ref().unwrap();
    assert_eq!(call.name, "lookup");
    assert_eq!(call.args.as_ref().unwrap()["q"], json!("x"));

    let tool_turn = &adapted.request.contents[2];
    assert_eq!(tool_turn.role.as_deref(), Some("user"));
    let response = tool_turn.parts[0].function_response.as_ref().unwrap();
    assert_eq!(response.name, "lookup");
    assert_eq!(response.response, json!("result text"));
}

#[test]
fn adapter_merges_consecutive_tool_call_turns() {
    let store = SignatureStore::new();
    let request = openai_request(json!({
        "model": "gemini-2.5-flash",
        "messages": [
            { "role": "user", "content": "go" },
            { "role": "assistant", "tool_calls": [
                { "id": "c1", "type": "function", "function": { "name": "a", "arguments": "{}" } }
            ]},
            { "role": "assistant", "tool_calls": [
                { "id": "c2", "type": "function", "function": { "name": "b", "arguments": "{}" } }
            ]}
        ]
    }));
    let adapted = from_openai_chat(&request, &store).unwrap();
    assert_eq!(adapted.request.contents.len(), 2);
    assert_eq!(adapted.request.contents[1].parts.len(), 2);
}

#[test]
fn adapter_merges_consecutive_tool_responses() {
    let store = SignatureStore::new();
    let request = openai_request(json!({
        "model": "gemini-2.5-flash",
        "messages": [
            { "role": "assistant", "tool_calls": [
                { "id": "c1", "type": "function", "function": { "name": "a", "arguments": "{}" } },
                { "id": "c2", "type": "function", "function": { "name": "b", "arguments": "{}" } }
            ]},
            { "role": "tool", "tool_call_id": "c1", "content": "one" },
            { "role": "tool", "tool_call_id": "c2", "content": {"text": "two"} }
        ]
    }));
    let adapted = from_openai_chat(&request, &store).unwrap();
    assert_eq!(adapted.request.contents.len(), 2);
    let responses = &adapted.request.contents[1];
    assert_eq!(responses.parts.len(), 2);
    assert_eq!(responses.parts[1].function_response.as_ref().unwrap().response, json!("two"));
}

#[test]
fn gemini3_unsigned_assistant_text_is_dropped() {
    let store = SignatureStore::new();
    store.register_parts(&[Part {
        text: Some("signed answer".to_string()),
        thought_signature: Some("sig-1".to_string()),
        ..Part::default()
    }]);

    let request = openai_request(json!({
        "model": "gemini-3-pro-preview",
        "messages": [
            { "role": "user", "content": "a" },
            { "role": "assistant", "content": "signed answer" },
            { "role": "user", "content": "b" },
            { "role": "assistant", "content": "never seen before" },
            { "role": "user", "content": "c" }
        ]
    }));
    let adapted = from_openai_chat(&request, &store).unwrap();

    // Signed text survives and carries the signature; unsigned text is gone.
    let roles: Vec<_> = adapted
        .request
        .contents
        .iter()
        .map(|content| content.role.as_deref().unwrap().to_string())
        .collect();
    assert_eq!(roles, vec!["user", "model", "user", "user"]);
    assert_eq!(
        adapted.request.contents[1].parts[0].thought_signature.as_deref(),
        Some("sig-1")
    );
}

#[test]
fn claude_family_strips_signatures_and_disables_thinking_on_tool_history() {
    let store = SignatureStore::new();
    store.register_parts(&[Part {
        function_call: Some(FunctionCall {
            id: Some("c1".to_string()),
            name: "a".to_string(),
            args: None,
        }),
        thought_signature: Some("sig-x".to_string()),
        ..Part::default()
    }]);

    let request = openai_request(json!({
        "model": "claude-sonnet-4-5",
        "messages": [
            { "role": "user", "content": "go" },
            { "role": "assistant", "tool_calls": [
                { "id": "c1", "type": "function", "function": { "name": "a", "arguments": "{}" } }
            ]},
            { "role": "tool", "tool_call_id": "c1", "content": "done" }
        ]
    }));
    let adapted = from_openai_chat(&request, &store).unwrap();

    for content in &adapted.request.contents {
        for part in &content.parts {
            assert!(part.thought_signature.is_none());
        }
    }
    let thinking = adapted
        .request
        .generation_config
        .as_ref()
        .unwrap()
        .thinking_config
        .as_ref()
        .unwrap();
    assert!(!thinking.include_thoughts);
}

#[test]
fn thinking_enabled_for_thinking_models_without_tool_history() {
    let store = SignatureStore::new();
    let request = openai_request(json!({
        "model": "gemini-2.5-pro",
        "messages": [{ "role": "user", "content": "hi" }]
    }));
    let adapted = from_openai_chat(&request, &store).unwrap();
    let thinking = adapted
        .request
        .generation_config
        .unwrap()
        .thinking_config
        .unwrap();
    assert!(thinking.include_thoughts);
    assert_eq!(thinking.thinking_budget, 1024);
}

#[test]
fn image_models_get_modalities_and_steering_note() {
    let store = SignatureStore::new();
    let request = openai_request(json!({
        "model": "gemini-2.5-flash-image",
        "messages": [{ "role": "user", "content": "draw a cat" }]
    }));
    let adapted = from_openai_chat(&request, &store).unwrap();
    assert_eq!(
        adapted.request.generation_config.unwrap().response_modalities,
        Some(vec!["TEXT".to_string(), "IMAGE".to_string()])
    );
    assert!(adapted.request.system_instruction.is_some());
}

#[test]
fn claude_hop_maps_system_tools_and_results() {
    let body: MessagesRequest = serde_json::from_value(json!({
        "model": "claude-sonnet-4-5",
        "system": "stay close to the text",
        "max_tokens": 512,
        "stream": true,
        "messages": [
            { "role": "user", "content": [
                { "type": "text", "text": "check the weather" },
                { "type": "image", "source": { "type": "base64", "media_type": "image/jpeg", "data": "QUJD" } }
            ]},
            { "role": "assistant", "content": [
                { "type": "thinking", "thinking": "history thinking" },
                { "type": "tool_use", "id": "toolu_1", "name": "weather", "input": { "city": "Oslo" } }
            ]},
            { "role": "user", "content": [
                { "type": "tool_result", "tool_use_id": "toolu_1", "content": "rainy" }
            ]}
        ],
        "tools": [
            { "name": "weather", "description": "look up weather", "input_schema": { "type": "object" } }
        ]
    }))
    .unwrap();

    let mapped = map_claude_to_openai(&body);
    assert_eq!(mapped.model, "claude-sonnet-4-5");
    assert_eq!(mapped.stream, Some(true));
    assert_eq!(mapped.max_tokens, Some(512));
    assert_eq!(mapped.messages[0].role, "system");
    assert_eq!(mapped.messages[1].role, "user");

    let assistant = &mapped.messages[2];
    assert_eq!(assistant.role, "assistant");
    assert!(assistant.content.is_none(), "thinking history is dropped");
    let calls = assistant.tool_calls.as_ref().unwrap();
    assert_eq!(calls[0].id, "toolu_1");
    assert_eq!(calls[0].function.name, "weather");

    let tool = &mapped.messages[3];
    assert_eq!(tool.role, "tool");
    assert_eq!(tool.tool_call_id.as_deref(), Some("toolu_1"));

    let tools = mapped.tools.as_ref().unwrap();
    assert_eq!(tools[0].function.name, "weather");
}

fn parity_events() -> Vec<UpstreamEvent> {
    vec![
        UpstreamEvent::Thinking("A".to_string()),
        UpstreamEvent::Text("B".to_string()),
        UpstreamEvent::ToolCall(FunctionCall {
            id: Some("t1".to_string()),
            name: "tool".to_string(),
            args: Some(json!({"k": "v"})),
        }),
    ]
}

#[test]
fn openai_stream_parity() {
    let mut encoder = OpenAiStreamEncoder::new("gemini-2.5-pro");
    let mut chunks = Vec::new();
    for event in parity_events() {
        chunks.extend(encoder.on_event(&event));
    }
    chunks.push(encoder.finish());

    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks[0].choices[0].delta.reasoning_content.as_deref(), Some("A"));
    assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("B"));
    let tool_calls = chunks[2].choices[0].delta.tool_calls.as_ref().unwrap();
    assert_eq!(tool_calls[0].index, 0);
    assert_eq!(tool_calls[0].id.as_deref(), Some("t1"));
    assert_eq!(tool_calls[0].function.name.as_deref(), Some("tool"));
    assert_eq!(
        chunks[3].choices[0].finish_reason.as_deref(),
        Some("tool_calls")
    );
}

#[test]
fn claude_stream_parity() {
    let mut encoder = ClaudeStreamEncoder::new("claude-sonnet-4-5", 3);
    let mut events = encoder.start();
    for event in parity_events() {
        events.extend(encoder.on_event(&event));
    }
    events.extend(encoder.finish());

    let names: Vec<&str> = events.iter().map(|event| event.name()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "ping",
            "content_block_start", // thinking
            "content_block_delta",
            "content_block_stop",
            "content_block_start", // text
            "content_block_delta",
            "content_block_stop",
            "content_block_start", // tool_use
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    match &events[2] {
        StreamEvent::ContentBlockStart { content_block, .. } => {
            assert!(matches!(content_block, ContentBlock::Thinking { .. }));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match &events[9] {
        StreamEvent::ContentBlockDelta { delta, .. } => match delta {
            ContentDelta::InputJsonDelta { partial_json } => {
                assert_eq!(
                    serde_json::from_str::<serde_json::Value>(partial_json).unwrap(),
                    json!({"k": "v"})
                );
            }
            other => panic!("unexpected delta: {other:?}"),
        },
        other => panic!("unexpected event: {other:?}"),
    }
    match &events[11] {
        StreamEvent::MessageDelta { delta, .. } => {
            assert_eq!(delta["stop_reason"], json!("tool_use"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn think_markers_split_into_reasoning_across_events() {
    let mut encoder = OpenAiStreamEncoder::new("gemini-2.5-pro");
    let first = encoder.on_event(&UpstreamEvent::Text("before<思考>inner".to_string()));
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].choices[0].delta.content.as_deref(), Some("before"));
    assert_eq!(
        first[1].choices[0].delta.reasoning_content.as_deref(),
        Some("inner")
    );

    // The marker state carries into the next event.
    let second = encoder.on_event(&UpstreamEvent::Text("more</思考>after".to_string()));
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].choices[0].delta.content.as_deref(), Some("after"));
    assert_eq!(
        second[1].choices[0].delta.reasoning_content.as_deref(),
        Some("more")
    );
}

#[test]
fn buffered_openai_completion_assembles_text_and_finish() {
    let events = vec![
        UpstreamEvent::Text("po".to_string()),
        UpstreamEvent::Text("ng".to_string()),
        UpstreamEvent::Usage(UsageMetadata {
            prompt_token_count: Some(1),
            candidates_token_count: Some(2),
            total_token_count: Some(3),
            ..UsageMetadata::default()
        }),
    ];
    let completion = to_openai_completion(&events, "gemini-2.5-flash");
    assert_eq!(
        completion.choices[0].message.content,
        Some(json!("pong"))
    );
    assert_eq!(completion.choices[0].finish_reason, "stop");
    assert_eq!(completion.usage.as_ref().unwrap().total_tokens, 3);
}

#[test]
fn merge_chunks_coalesces_text_and_keeps_signature() {
    let chunk = |part: Part| GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content::model(vec![part])),
            finish_reason: None,
            index: Some(0),
        }],
        ..GenerateContentResponse::default()
    };

    let signed = Part {
        text: Some("world".to_string()),
        thought_signature: Some("sig-9".to_string()),
        ..Part::default()
    };
    let mut last = chunk(signed);
    last.candidates[0].finish_reason = Some("STOP".to_string());

    let merged = merge_chunks(vec![chunk(Part::text("hello ")), last]);
    let parts = merged.first_parts();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].text.as_deref(), Some("hello world"));
    assert_eq!(parts[0].thought_signature.as_deref(), Some("sig-9"));
    assert_eq!(
        merged.candidates[0].finish_reason.as_deref(),
        Some("STOP")
    );
}
