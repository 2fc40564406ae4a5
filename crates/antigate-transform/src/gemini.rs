//! Gemini-surface requests already speak the upstream content schema; the
//! adapter's work is tool-schema cleaning and per-family constraints.

use antigate_protocol::gemini::GenerateContentRequest;

use crate::openai::AdaptedRequest;
use crate::schema::clean_tool_schema;

pub fn from_gemini(mut body: GenerateContentRequest, model: &str) -> AdaptedRequest {
    let client_model = model.to_string();
    let upstream_model = client_model
        .strip_prefix("models/")
        .unwrap_or(&client_model)
        .to_string();

    if let Some(tools) = body.tools.as_mut() {
        for tool in tools {
            for declaration in &mut tool.function_declarations {
                if let Some(parameters) = &declaration.parameters {
                    declaration.parameters = Some(clean_tool_schema(parameters));
                }
            }
        }
    }

    AdaptedRequest {
        client_model,
        upstream_model,
        stream: false,
        request: body,
    }
}
