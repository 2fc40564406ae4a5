//! The request orchestrator: acquire a credential, adapt, drive the
//! upstream call, re-emit per dialect, account the outcome. A response is
//! always written even if logging fails, and a log entry is always
//! attempted even if the response write fails.

use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use bytes::Bytes;
use http::StatusCode;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{info, warn};

use antigate_common::GatewayConfig;
use antigate_pool::{CredentialPool, CredentialView};
use antigate_protocol::claude::MessagesRequest;
use antigate_protocol::gemini::{Blob, GenerateContentRequest, GenerateContentResponse};
use antigate_protocol::openai::{ChatCompletionRequest, ModelEntry, ModelList};
use antigate_protocol::sse::SseDecoder;
use antigate_protocol::upstream::{UpstreamRequest, UpstreamResponse};
use antigate_storage::{LogDetail, NewLogEntry, RequestLog, RequestSnapshot, ResponseSnapshot};
use antigate_transform::{
    AdaptedRequest, SignatureStore, UpstreamEvent, classify_response, estimate_request_tokens,
    from_gemini, from_openai_chat, is_image_model, map_claude_to_openai, to_claude_message,
    to_openai_completion,
};

use crate::error::GatewayError;
use crate::images::ImageStore;
use crate::sink::{ClaudeSink, OpenAiSink, SseWriter, StreamSink};
use crate::upstream::{ReplyBody, UpstreamClient, UpstreamReply};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dialect {
    OpenAi,
    Claude,
    Gemini,
}

/// Request facts the orchestrator needs for logging and routing.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body_snapshot: Option<JsonValue>,
    /// Set by the `/{credential}/v1/...` routes.
    pub forced_project: Option<String>,
}

pub enum ClientResponse {
    Json {
        status: StatusCode,
        body: JsonValue,
    },
    Stream {
        content_type: &'static str,
        receiver: mpsc::Receiver<Bytes>,
    },
}

/// The collaborators a detached stream pump holds on to.
#[derive(Clone)]
struct Collaborators {
    pool: Arc<CredentialPool>,
    log: Arc<RequestLog>,
    signatures: Arc<SignatureStore>,
    images: Arc<dyn ImageStore>,
}

pub struct GatewayEngine {
    config: GatewayConfig,
    shared: Collaborators,
    upstream: Arc<UpstreamClient>,
}

impl GatewayEngine {
    pub fn new(
        config: GatewayConfig,
        pool: Arc<CredentialPool>,
        log: Arc<RequestLog>,
        signatures: Arc<SignatureStore>,
        upstream: Arc<UpstreamClient>,
        images: Arc<dyn ImageStore>,
    ) -> Self {
        Self {
            config,
            shared: Collaborators {
                pool,
                log,
                signatures,
                images,
            },
            upstream,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.shared.pool
    }

    pub fn log(&self) -> &Arc<RequestLog> {
        &self.shared.log
    }

    pub async fn handle_openai_chat(
        &self,
        ctx: RequestContext,
        body: ChatCompletionRequest,
    ) -> ClientResponse {
        let model = body.model.clone();
        let adapted = match from_openai_chat(&body, &self.shared.signatures) {
            Ok(adapted) => adapted,
            Err(err) => {
                return self
                    .fail(ctx, &model, GatewayError::BadRequest(err.to_string()), 0)
                    .await;
            }
        };
        if adapted.stream {
            self.run_stream(ctx, adapted, Dialect::OpenAi, 0).await
        } else {
            self.run_buffered(ctx, adapted, Dialect::OpenAi, 0).await
        }
    }

    pub async fn handle_claude_messages(
        &self,
        ctx: RequestContext,
        body: MessagesRequest,
    ) -> ClientResponse {
        let model = body.model.clone();
        let input_estimate = estimate_request_tokens(&body);
        let hopped = map_claude_to_openai(&body);
        let adapted = match from_openai_chat(&hopped, &self.shared.signatures) {
            Ok(adapted) => adapted,
            Err(err) => {
                return self
                    .fail(ctx, &model, GatewayError::BadRequest(err.to_string()), 0)
                    .await;
            }
        };
        if adapted.stream {
            self.run_stream(ctx, adapted, Dialect::Claude, input_estimate)
                .await
        } else {
            self.run_buffered(ctx, adapted, Dialect::Claude, input_estimate)
                .await
        }
    }

    pub async fn handle_gemini_generate(
        &self,
        ctx: RequestContext,
        model: &str,
        body: GenerateContentRequest,
    ) -> ClientResponse {
        let adapted = from_gemini(body, model);
        self.run_buffered(ctx, adapted, Dialect::Gemini, 0).await
    }

    pub async fn list_models(&self, _ctx: RequestContext) -> ClientResponse {
        let view = match self.shared.pool.acquire().await {
            Ok(view) => view,
            Err(err) => {
                let err = GatewayError::from(err);
                return ClientResponse::Json {
                    status: err.status(),
                    body: err.body(),
                };
            }
        };
        match self.upstream.fetch_models(&view).await {
            Ok(payload) => {
                let list = ModelList {
                    object: "list",
                    data: extract_model_ids(&payload)
                        .into_iter()
                        .map(|id| ModelEntry {
                            id,
                            object: "model",
                            created: 0,
                            owned_by: "antigravity".to_string(),
                        })
                        .collect(),
                };
                ClientResponse::Json {
                    status: StatusCode::OK,
                    body: serde_json::to_value(list).unwrap_or(JsonValue::Null),
                }
            }
            Err(err) => ClientResponse::Json {
                status: err.status(),
                body: err.body(),
            },
        }
    }

    /// Log-and-respond for requests that failed before any upstream write.
    async fn fail(
        &self,
        ctx: RequestContext,
        model: &str,
        err: GatewayError,
        duration_ms: u64,
    ) -> ClientResponse {
        let status = err.status();
        append_log(
            &self.shared.log,
            &ctx,
            model,
            "",
            false,
            status.as_u16(),
            &err.to_string(),
            duration_ms,
            None,
        )
        .await;
        ClientResponse::Json {
            status,
            body: err.body(),
        }
    }

    /// Auth-gate failures still produce their log entry.
    pub async fn log_rejected(&self, ctx: &RequestContext, status: u16, message: &str) {
        append_log(&self.shared.log, ctx, "", "", false, status, message, 0, None).await;
    }

    async fn acquire(&self, ctx: &RequestContext) -> Result<CredentialView, GatewayError> {
        match &ctx.forced_project {
            Some(project_id) => Ok(self.shared.pool.acquire_by_project_id(project_id).await?),
            None => Ok(self.shared.pool.acquire().await?),
        }
    }

    fn envelope(&self, adapted: &AdaptedRequest, view: &CredentialView) -> UpstreamRequest {
        let mut request = adapted.request.clone();
        request.session_id = Some(view.session_id.clone());
        UpstreamRequest {
            model: adapted.upstream_model.clone(),
            project: view.project_id.clone(),
            request,
            request_id: format!("agent-{}", uuid::Uuid::new_v4()),
            user_agent: "antigravity".to_string(),
            request_type: if is_image_model(&adapted.upstream_model) {
                "image_gen".to_string()
            } else {
                "agent".to_string()
            },
        }
    }

    async fn run_buffered(
        &self,
        ctx: RequestContext,
        adapted: AdaptedRequest,
        dialect: Dialect,
        input_estimate: i64,
    ) -> ClientResponse {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let view = match self.acquire(&ctx).await {
                Ok(view) => view,
                Err(err) => {
                    return self
                        .fail(ctx, &adapted.client_model, err, elapsed_ms(started))
                        .await;
                }
            };
            let envelope = self.envelope(&adapted, &view);

            match self.upstream.generate(&view, &envelope, false).await {
                Ok(UpstreamReply { status, body }) if (200..300).contains(&status) => {
                    let ReplyBody::Bytes(bytes) = body else {
                        unreachable!("non-stream call yields bytes");
                    };
                    let response = unwrap_upstream_body(&bytes);
                    self.shared.signatures.register_parts(response.first_parts());
                    let mut events = classify_response(&response);
                    if is_image_model(&adapted.upstream_model) {
                        resolve_images(self.shared.images.as_ref(), &mut events).await;
                    }

                    let body = match dialect {
                        Dialect::OpenAi => serde_json::to_value(to_openai_completion(
                            &events,
                            &adapted.client_model,
                        ))
                        .unwrap_or(JsonValue::Null),
                        Dialect::Claude => serde_json::to_value(to_claude_message(
                            &events,
                            &adapted.client_model,
                            input_estimate,
                        ))
                        .unwrap_or(JsonValue::Null),
                        Dialect::Gemini => {
                            serde_json::to_value(&response).unwrap_or(JsonValue::Null)
                        }
                    };

                    self.shared
                        .pool
                        .record_outcome(&view.project_id, true, &adapted.client_model)
                        .await;
                    append_log(
                        &self.shared.log,
                        &ctx,
                        &adapted.client_model,
                        &view.project_id,
                        true,
                        200,
                        "",
                        elapsed_ms(started),
                        Some(ResponseSnapshot::Body { body: body.clone() }),
                    )
                    .await;
                    info!(
                        model = %adapted.client_model,
                        project_id = %view.project_id,
                        elapsed_ms = elapsed_ms(started),
                        "completed"
                    );
                    return ClientResponse::Json {
                        status: StatusCode::OK,
                        body,
                    };
                }
                Ok(UpstreamReply { status, body }) => {
                    let message = match body {
                        ReplyBody::Bytes(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                        ReplyBody::Stream(_) => String::new(),
                    };
                    self.shared
                        .pool
                        .record_outcome(&view.project_id, false, &adapted.client_model)
                        .await;
                    if self.config.retry.should_retry(status)
                        && attempt < self.config.retry.max_attempts
                    {
                        warn!(status, attempt, "upstream rejected, retrying with fresh credential");
                        continue;
                    }
                    return self
                        .fail(
                            ctx,
                            &adapted.client_model,
                            GatewayError::Upstream { status, message },
                            elapsed_ms(started),
                        )
                        .await;
                }
                Err(err) => {
                    self.shared
                        .pool
                        .record_outcome(&view.project_id, false, &adapted.client_model)
                        .await;
                    if attempt < self.config.retry.max_attempts {
                        warn!(error = %err, attempt, "upstream transport error, retrying");
                        continue;
                    }
                    return self
                        .fail(ctx, &adapted.client_model, err, elapsed_ms(started))
                        .await;
                }
            }
        }
    }

    async fn run_stream(
        &self,
        ctx: RequestContext,
        adapted: AdaptedRequest,
        dialect: Dialect,
        input_estimate: i64,
    ) -> ClientResponse {
        let started = Instant::now();
        let mut attempt = 0u32;
        let (view, upstream_rx) = loop {
            attempt += 1;
            let view = match self.acquire(&ctx).await {
                Ok(view) => view,
                Err(err) => {
                    return self
                        .fail(ctx, &adapted.client_model, err, elapsed_ms(started))
                        .await;
                }
            };
            let envelope = self.envelope(&adapted, &view);
            match self.upstream.generate(&view, &envelope, true).await {
                Ok(UpstreamReply { status, body }) if (200..300).contains(&status) => {
                    let ReplyBody::Stream(rx) = body else {
                        unreachable!("stream call yields a channel");
                    };
                    break (view, rx);
                }
                Ok(UpstreamReply { status, body }) => {
                    let message = match body {
                        ReplyBody::Bytes(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                        ReplyBody::Stream(_) => String::new(),
                    };
                    self.shared
                        .pool
                        .record_outcome(&view.project_id, false, &adapted.client_model)
                        .await;
                    if self.config.retry.should_retry(status)
                        && attempt < self.config.retry.max_attempts
                    {
                        warn!(status, attempt, "upstream rejected, retrying with fresh credential");
                        continue;
                    }
                    return self
                        .fail(
                            ctx,
                            &adapted.client_model,
                            GatewayError::Upstream { status, message },
                            elapsed_ms(started),
                        )
                        .await;
                }
                Err(err) => {
                    self.shared
                        .pool
                        .record_outcome(&view.project_id, false, &adapted.client_model)
                        .await;
                    if attempt < self.config.retry.max_attempts {
                        warn!(error = %err, attempt, "upstream transport error, retrying");
                        continue;
                    }
                    return self
                        .fail(ctx, &adapted.client_model, err, elapsed_ms(started))
                        .await;
                }
            }
        };

        let (tx, rx) = mpsc::channel::<Bytes>(32);
        let shared = self.shared.clone();
        tokio::spawn(pump_stream(
            shared,
            ctx,
            adapted,
            dialect,
            input_estimate,
            view,
            upstream_rx,
            tx,
            started,
        ));
        ClientResponse::Stream {
            content_type: "text/event-stream",
            receiver: rx,
        }
    }
}

/// Consume the upstream SSE stream, re-emit per dialect, collect the log
/// detail and register thought signatures at the end.
#[allow(clippy::too_many_arguments)]
async fn pump_stream(
    shared: Collaborators,
    ctx: RequestContext,
    adapted: AdaptedRequest,
    dialect: Dialect,
    input_estimate: i64,
    view: CredentialView,
    mut upstream_rx: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<Bytes>,
    started: Instant,
) {
    let mut writer = SseWriter::new(tx);
    let mut sink: Box<dyn StreamSink> = match dialect {
        Dialect::Claude => Box::new(ClaudeSink::new(&adapted.client_model, input_estimate)),
        _ => Box::new(OpenAiSink::new(&adapted.client_model)),
    };

    let image_model = is_image_model(&adapted.upstream_model);
    let mut decoder = SseDecoder::new();
    let mut collected: Vec<JsonValue> = Vec::new();
    let mut responses: Vec<GenerateContentResponse> = Vec::new();
    let mut buffered_images: Vec<Blob> = Vec::new();
    let mut success = true;
    let mut message = String::new();
    let mut connected = sink.start(&mut writer).await;

    'outer: while connected {
        let Some(chunk) = upstream_rx.recv().await else {
            break;
        };
        for sse in decoder.feed_bytes(&chunk) {
            if sse.data.is_empty() || sse.data == "[DONE]" {
                continue;
            }
            match parse_stream_payload(&sse.data) {
                StreamPayload::Response(response) => {
                    responses.push(response.clone());
                    for event in classify_response(&response) {
                        if image_model
                            && let UpstreamEvent::Image(blob) = &event
                        {
                            buffered_images.push(blob.clone());
                            continue;
                        }
                        if let Some(record) = event_log_record(&event) {
                            collected.push(record);
                        }
                        connected = sink.on_event(&mut writer, &event).await;
                        if !connected {
                            break 'outer;
                        }
                    }
                }
                StreamPayload::Error(err_message) => {
                    // Headers are long gone; the failure rides in-stream.
                    success = false;
                    message = err_message.clone();
                    collected
                        .push(serde_json::json!({ "content": format!("错误: {err_message}") }));
                    sink.error(&mut writer, &err_message).await;
                    break 'outer;
                }
                StreamPayload::Skip => {}
            }
        }
    }

    if connected && success {
        if image_model && !buffered_images.is_empty() {
            let markdown = save_images_markdown(shared.images.as_ref(), &buffered_images).await;
            if !markdown.is_empty() {
                collected.push(serde_json::json!({ "content": markdown }));
                connected = sink
                    .on_event(&mut writer, &UpstreamEvent::Text(markdown))
                    .await;
            }
        }
        if connected {
            sink.finish(&mut writer).await;
        }
    }
    if !connected {
        // Cancellation is not an error signal; the credential stays good.
        message = "client disconnected".to_string();
    }

    for response in &responses {
        shared.signatures.register_parts(response.first_parts());
    }
    shared
        .pool
        .record_outcome(&view.project_id, success, &adapted.client_model)
        .await;
    append_log(
        &shared.log,
        &ctx,
        &adapted.client_model,
        &view.project_id,
        success,
        if success { 200 } else { 502 },
        &message,
        elapsed_ms(started),
        Some(ResponseSnapshot::stream(collected)),
    )
    .await;
    info!(
        model = %adapted.client_model,
        project_id = %view.project_id,
        success,
        elapsed_ms = elapsed_ms(started),
        "stream finished"
    );
}

#[allow(clippy::too_many_arguments)]
async fn append_log(
    log: &RequestLog,
    ctx: &RequestContext,
    model: &str,
    project_id: &str,
    success: bool,
    status_code: u16,
    message: &str,
    duration_ms: u64,
    response: Option<ResponseSnapshot>,
) {
    let detail = Some(LogDetail {
        request: Some(RequestSnapshot::new(
            ctx.headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
            ctx.body_snapshot.clone(),
        )),
        response,
    });
    let entry = NewLogEntry {
        model: model.to_string(),
        project_id: project_id.to_string(),
        success,
        status_code,
        message: message.to_string(),
        duration_ms,
        method: ctx.method.clone(),
        path: ctx.path.clone(),
        detail,
    };
    if let Err(err) = log.append(entry).await {
        warn!(error = %err, "request log append failed");
    }
}

/// Turn buffered events' inline blobs into markdown via the image store.
async fn resolve_images(images: &dyn ImageStore, events: &mut Vec<UpstreamEvent>) {
    let mut blobs = Vec::new();
    events.retain(|event| match event {
        UpstreamEvent::Image(blob) => {
            blobs.push(blob.clone());
            false
        }
        _ => true,
    });
    if blobs.is_empty() {
        return;
    }
    let markdown = save_images_markdown(images, &blobs).await;
    if !markdown.is_empty() {
        events.push(UpstreamEvent::Text(markdown));
    }
}

async fn save_images_markdown(images: &dyn ImageStore, blobs: &[Blob]) -> String {
    let mut lines = Vec::new();
    for blob in blobs {
        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&blob.data) else {
            warn!("undecodable inline image payload, skipping");
            continue;
        };
        match images.save_image(&bytes, &blob.mime_type).await {
            Ok(url) => lines.push(format!("![image]({url})")),
            Err(err) => warn!(error = %err, "image save failed"),
        }
    }
    lines.join("\n")
}

enum StreamPayload {
    Response(GenerateContentResponse),
    Error(String),
    Skip,
}

fn parse_stream_payload(data: &str) -> StreamPayload {
    let Ok(value) = serde_json::from_str::<JsonValue>(data) else {
        return StreamPayload::Skip;
    };
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("upstream error")
            .to_string();
        return StreamPayload::Error(message);
    }
    let inner = value.get("response").cloned().unwrap_or(value);
    match serde_json::from_value::<GenerateContentResponse>(inner) {
        Ok(response) => StreamPayload::Response(response),
        Err(_) => StreamPayload::Skip,
    }
}

/// Non-stream bodies nest the candidates under `response`; accept both the
/// wrapped and the bare schema.
fn unwrap_upstream_body(bytes: &Bytes) -> GenerateContentResponse {
    if let Ok(wrapped) = serde_json::from_slice::<UpstreamResponse>(bytes)
        && let Some(response) = wrapped.response
    {
        return response;
    }
    serde_json::from_slice::<GenerateContentResponse>(bytes).unwrap_or_default()
}

fn event_log_record(event: &UpstreamEvent) -> Option<JsonValue> {
    match event {
        UpstreamEvent::Text(text) => Some(serde_json::json!({ "content": text })),
        UpstreamEvent::Thinking(text) => Some(serde_json::json!({ "thinking": text })),
        UpstreamEvent::ToolCall(call) => Some(serde_json::json!({
            "tool_calls": [{
                "id": call.id,
                "name": call.name,
                "arguments": call.args,
            }]
        })),
        UpstreamEvent::Image(blob) => Some(serde_json::json!({ "image": blob.mime_type })),
        UpstreamEvent::Usage(usage) => {
            Some(serde_json::json!({ "usage": serde_json::to_value(usage).ok()? }))
        }
        UpstreamEvent::Finish(reason) => Some(serde_json::json!({ "finish_reason": reason })),
    }
}

fn extract_model_ids(payload: &JsonValue) -> Vec<String> {
    let mut ids = Vec::new();
    match payload.get("models") {
        Some(JsonValue::Object(map)) => {
            ids.extend(map.keys().cloned());
        }
        Some(JsonValue::Array(items)) => {
            for item in items {
                if let Some(id) = item
                    .get("id")
                    .and_then(|v| v.as_str())
                    .or_else(|| item.get("name").and_then(|v| v.as_str()))
                    .or_else(|| item.as_str())
                {
                    ids.push(id.strip_prefix("models/").unwrap_or(id).to_string());
                }
            }
        }
        _ => {}
    }
    ids.sort();
    ids.dedup();
    ids
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_payload_classification() {
        let data = r#"{"response":{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]}}]}}"#;
        assert!(matches!(
            parse_stream_payload(data),
            StreamPayload::Response(_)
        ));

        let error = r#"{"error":{"message":"quota exhausted","code":429}}"#;
        match parse_stream_payload(error) {
            StreamPayload::Error(message) => assert_eq!(message, "quota exhausted"),
            _ => panic!("expected error payload"),
        }

        assert!(matches!(parse_stream_payload("not json"), StreamPayload::Skip));
    }

    #[test]
    fn model_ids_from_object_and_array() {
        let object = serde_json::json!({"models": {"gemini-2.5-pro": {}, "gemini-2.5-flash": {}}});
        assert_eq!(
            extract_model_ids(&object),
            vec!["gemini-2.5-flash", "gemini-2.5-pro"]
        );

        let array = serde_json::json!({"models": [
            {"name": "models/gemini-3-pro-preview"},
            {"id": "claude-sonnet-4-5"},
            "models/gemini-3-pro-preview"
        ]});
        assert_eq!(
            extract_model_ids(&array),
            vec!["claude-sonnet-4-5", "gemini-3-pro-preview"]
        );
    }

    #[test]
    fn upstream_body_unwraps_both_shapes() {
        let wrapped = Bytes::from_static(
            br#"{"response":{"candidates":[{"content":{"parts":[{"text":"pong"}]}}]}}"#,
        );
        assert_eq!(
            unwrap_upstream_body(&wrapped).first_parts()[0].text.as_deref(),
            Some("pong")
        );

        let bare = Bytes::from_static(
            br#"{"candidates":[{"content":{"parts":[{"text":"pong"}]}}]}"#,
        );
        assert_eq!(
            unwrap_upstream_body(&bare).first_parts()[0].text.as_deref(),
            Some("pong")
        );
    }

    #[test]
    fn log_records_match_stream_summary_keys() {
        let record = event_log_record(&UpstreamEvent::Text("hi".to_string())).unwrap();
        assert_eq!(record["content"], "hi");
        let record = event_log_record(&UpstreamEvent::Thinking("hmm".to_string())).unwrap();
        assert_eq!(record["thinking"], "hmm");
    }
}
