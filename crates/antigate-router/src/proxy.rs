//! The API-key-gated client surface: OpenAI chat completions (with the
//! forced-credential prefix form), Anthropic messages, the token estimator,
//! the model list and the Gemini generateContent shape.
//!
//! The key check is a path-based layer covering `/v1/...` and
//! `/{credential}/v1/...`; the `/v1beta` Gemini route sits outside that
//! pattern and gates explicitly.

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tracing::info;

use antigate_core::{ClientResponse, GatewayError, RequestContext, check_api_key, requires_api_key};
use antigate_protocol::claude::{CountTokensResponse, MessagesRequest};
use antigate_protocol::gemini::GenerateContentRequest;
use antigate_protocol::openai::ChatCompletionRequest;
use antigate_transform::estimate_request_tokens;

use crate::state::RouterState;

pub fn proxy_router(state: RouterState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai_chat))
        .route("/{credential}/v1/chat/completions", post(openai_chat_forced))
        .route("/v1/messages", post(claude_messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/v1/models", get(list_models))
        .route("/v1beta/models/{model_action}", post(gemini_generate))
        .layer(middleware::from_fn_with_state(state.clone(), api_key_gate))
        .with_state(state)
}

/// Key check for every path matching the `/v1` pattern; missing
/// configuration answers 503, a mismatch 401. Rejections still log.
async fn api_key_gate(State(state): State<RouterState>, request: Request, next: Next) -> Response {
    if requires_api_key(request.uri().path()) {
        if let Err(err) = check_api_key(&state.config.api_key, request.headers()) {
            let ctx = request_context(
                request.method(),
                request.uri(),
                request.headers(),
                None,
                None,
            );
            state
                .engine
                .log_rejected(&ctx, err.status().as_u16(), &err.to_string())
                .await;
            return error_response(&err);
        }
    }
    next.run(request).await
}

fn request_context(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Option<&JsonValue>,
    forced_project: Option<String>,
) -> RequestContext {
    RequestContext {
        method: method.to_string(),
        path: uri.path().to_string(),
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect(),
        body_snapshot: body.cloned(),
        forced_project,
    }
}

fn error_response(err: &GatewayError) -> Response {
    json_response(err.status(), err.body())
}

fn json_response(status: StatusCode, body: JsonValue) -> Response {
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    let mut resp = Response::new(Body::from(bytes));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

fn client_response(response: ClientResponse) -> Response {
    match response {
        ClientResponse::Json { status, body } => json_response(status, body),
        ClientResponse::Stream {
            content_type,
            mut receiver,
        } => {
            let stream = futures_util::stream::poll_fn(move |cx| receiver.poll_recv(cx))
                .map(Ok::<Bytes, std::convert::Infallible>);
            let mut resp = Response::new(Body::from_stream(stream));
            resp.headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            resp.headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            resp
        }
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(
    bytes: &Bytes,
) -> Result<(T, JsonValue), GatewayError> {
    let snapshot: JsonValue = serde_json::from_slice(bytes)
        .map_err(|err| GatewayError::BadRequest(format!("invalid json: {err}")))?;
    let parsed: T = serde_json::from_value(snapshot.clone())
        .map_err(|err| GatewayError::BadRequest(format!("invalid request shape: {err}")))?;
    Ok((parsed, snapshot))
}

async fn openai_chat(
    State(state): State<RouterState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_openai_chat(state, method, uri, headers, body, None).await
}

async fn openai_chat_forced(
    State(state): State<RouterState>,
    Path(credential): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_openai_chat(state, method, uri, headers, body, Some(credential)).await
}

async fn run_openai_chat(
    state: RouterState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    forced_project: Option<String>,
) -> Response {
    let (request, snapshot) = match parse_body::<ChatCompletionRequest>(&body) {
        Ok(parsed) => parsed,
        Err(err) => return error_response(&err),
    };
    let ctx = request_context(&method, &uri, &headers, Some(&snapshot), forced_project);
    info!(model = %request.model, stream = request.stream.unwrap_or(false), "openai chat request");
    client_response(state.engine.handle_openai_chat(ctx, request).await)
}

async fn claude_messages(
    State(state): State<RouterState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (request, snapshot) = match parse_body::<MessagesRequest>(&body) {
        Ok(parsed) => parsed,
        Err(err) => return error_response(&err),
    };
    let ctx = request_context(&method, &uri, &headers, Some(&snapshot), None);
    info!(model = %request.model, stream = request.stream.unwrap_or(false), "anthropic messages request");
    client_response(state.engine.handle_claude_messages(ctx, request).await)
}

async fn count_tokens(
    State(_state): State<RouterState>,
    body: Bytes,
) -> Response {
    let (request, _snapshot) = match parse_body::<MessagesRequest>(&body) {
        Ok(parsed) => parsed,
        Err(err) => return error_response(&err),
    };
    let response = CountTokensResponse {
        input_tokens: estimate_request_tokens(&request),
    };
    json_response(
        StatusCode::OK,
        serde_json::to_value(response).unwrap_or(JsonValue::Null),
    )
}

async fn list_models(
    State(state): State<RouterState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let ctx = request_context(&method, &uri, &headers, None, None);
    client_response(state.engine.list_models(ctx).await)
}

/// `/v1beta/models/{model}:generateContent`. The streaming variant is not
/// offered on this surface and is rejected with 400.
async fn gemini_generate(
    State(state): State<RouterState>,
    Path(model_action): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = check_api_key(&state.config.api_key, &headers) {
        let ctx = request_context(&method, &uri, &headers, None, None);
        state
            .engine
            .log_rejected(&ctx, err.status().as_u16(), &err.to_string())
            .await;
        return error_response(&err);
    }

    let Some((model, action)) = model_action.split_once(':') else {
        return error_response(&GatewayError::BadRequest(
            "expected {model}:generateContent".to_string(),
        ));
    };
    if action == "streamGenerateContent" {
        return error_response(&GatewayError::BadRequest(
            "streaming is not supported on the Gemini surface".to_string(),
        ));
    }
    if action != "generateContent" {
        return error_response(&GatewayError::BadRequest(format!(
            "unsupported action: {action}"
        )));
    }

    let (request, snapshot) = match parse_body::<GenerateContentRequest>(&body) {
        Ok(parsed) => parsed,
        Err(err) => return error_response(&err),
    };
    let ctx = request_context(&method, &uri, &headers, Some(&snapshot), None);
    info!(model, "gemini generate request");
    client_response(
        state
            .engine
            .handle_gemini_generate(ctx, model, request)
            .await,
    )
}
