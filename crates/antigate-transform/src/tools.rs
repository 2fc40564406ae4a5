use serde_json::Value as JsonValue;

use antigate_protocol::gemini::{Content, FunctionDeclaration, Tool};
use antigate_protocol::openai::ToolDefinition;

use crate::schema::clean_tool_schema;

/// Wrap OpenAI-style tool declarations into the upstream's single
/// functionDeclarations tool, cleaning each parameter schema.
pub fn map_tool_declarations(tools: &[ToolDefinition]) -> Option<Vec<Tool>> {
    let declarations: Vec<FunctionDeclaration> = tools
        .iter()
        .filter(|tool| tool.kind == "function" || tool.kind.is_empty())
        .map(|tool| FunctionDeclaration {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            parameters: tool.function.parameters.as_ref().map(clean_tool_schema),
        })
        .collect();

    if declarations.is_empty() {
        None
    } else {
        Some(vec![Tool {
            function_declarations: declarations,
        }])
    }
}

/// Resolve the function name paired with a tool result by scanning the prior
/// model turns for the matching functionCall id.
pub fn tool_response_name(contents: &[Content], tool_call_id: &str) -> Option<String> {
    contents
        .iter()
        .rev()
        .filter(|content| content.role.as_deref() == Some("model"))
        .flat_map(|content| content.parts.iter())
        .filter_map(|part| part.function_call.as_ref())
        .find(|call| call.id.as_deref() == Some(tool_call_id))
        .map(|call| call.name.clone())
}

/// Tool message content arrives as a string, an object carrying `.text`, or
/// an array of parts; anything else is JSON-stringified.
pub(crate) fn extract_tool_content(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        JsonValue::Object(map) => match map.get("text").and_then(|v| v.as_str()) {
            Some(text) => text.to_string(),
            None => value.to_string(),
        },
        JsonValue::Array(items) => items
            .iter()
            .find_map(|item| {
                item.as_str().map(|s| s.to_string()).or_else(|| {
                    item.get("text")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                })
            })
            .unwrap_or_else(|| value.to_string()),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}
