mod claude;
mod claude_stream;
mod collect;
mod events;
mod gemini;
mod openai;
mod openai_stream;
mod schema;
mod signatures;
mod tools;

#[cfg(test)]
mod tests;

pub use claude::{estimate_request_tokens, estimate_tokens, map_claude_to_openai};
pub use claude_stream::ClaudeStreamEncoder;
pub use collect::{merge_chunks, to_claude_message, to_openai_completion};
pub use events::{UpstreamEvent, classify_response};
pub use gemini::from_gemini;
pub use openai::{AdaptedRequest, AdapterError, from_openai_chat, is_claude_family, is_image_model};
pub use openai_stream::OpenAiStreamEncoder;
pub use schema::clean_tool_schema;
pub use signatures::SignatureStore;
pub use tools::{map_tool_declarations, tool_response_name};
