//! The Antigravity internal-API envelope wrapped around every generate call.

use serde::{Deserialize, Serialize};

use crate::gemini::{GenerateContentRequest, GenerateContentResponse};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamRequest {
    pub model: String,
    pub project: String,
    pub request: GenerateContentRequest,
    pub request_id: String,
    pub user_agent: String,
    pub request_type: String,
}

/// One SSE payload of a streaming generate call; the candidate data is
/// nested under `response`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamChunk {
    pub response: Option<GenerateContentResponse>,
    pub trace_id: Option<String>,
}

/// Non-stream responses use the same nesting.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamResponse {
    pub response: Option<GenerateContentResponse>,
    pub trace_id: Option<String>,
}
