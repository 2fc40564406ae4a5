//! Panel surface: credential management under `/auth`, request log and
//! usage under `/admin`. Every route but the login requires a panel session
//! token.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use axum::routing::{delete, get, post};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use antigate_pool::RefreshAtError;
use antigate_storage::{CredentialRecord, ImportOptions, parse_toml_accounts, unix_ms};

use crate::state::RouterState;

pub fn admin_router(state: RouterState) -> Router {
    Router::new()
        .route("/auth/panel/login", post(panel_login))
        .route("/auth/accounts", get(list_accounts))
        .route("/auth/accounts/import-toml", post(import_toml))
        .route("/auth/accounts/refresh-all", post(refresh_all))
        .route("/auth/accounts/delete-disabled", post(delete_disabled))
        .route("/auth/accounts/{index}/refresh", post(refresh_account))
        .route("/auth/accounts/{index}/enable", post(enable_account))
        .route("/auth/accounts/{index}", delete(delete_account))
        .route(
            "/auth/accounts/{index}/refresh-project-id",
            post(refresh_project_id),
        )
        .route("/auth/oauth/url", get(oauth_url))
        .route("/auth/oauth/parse-url", post(oauth_parse_url))
        .route("/admin/logs", get(logs_list))
        .route("/admin/logs/clear", post(logs_clear))
        .route("/admin/logs/usage", get(logs_usage))
        .route("/admin/logs/{id}", get(log_detail))
        .with_state(state)
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

fn error_json(status: StatusCode, message: &str) -> Response {
    json_response(status, json!({ "error": { "message": message } }))
}

fn panel_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("x-panel-token")
        .and_then(|value| value.to_str().ok())
    {
        return Some(token.trim().to_string());
    }
    let auth = headers.get("authorization")?.to_str().ok()?;
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

fn require_panel(state: &RouterState, headers: &HeaderMap) -> Option<Response> {
    match panel_token(headers) {
        Some(token) if state.sessions.validate(&token) => None,
        _ => Some(error_json(StatusCode::UNAUTHORIZED, "panel session required")),
    }
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

async fn panel_login(
    State(state): State<RouterState>,
    body: axum::Json<LoginBody>,
) -> Response {
    if body.username != state.config.panel_user || body.password != state.config.panel_password {
        warn!("panel login rejected");
        return error_json(StatusCode::UNAUTHORIZED, "invalid panel credentials");
    }
    let token = state.sessions.issue();
    json_response(StatusCode::OK, json!({ "token": token }))
}

/// Secrets never leave the pool: the listing carries flags, not tokens.
fn account_view(index: usize, record: &CredentialRecord) -> JsonValue {
    json!({
        "index": index,
        "project_id": record.project_id,
        "email": record.email,
        "enabled": record.enabled,
        "created_at": record.created_at,
        "has_access_token": record.access_token.as_deref().map(|t| !t.is_empty()).unwrap_or(false),
        "fresh": record.is_fresh(unix_ms()),
    })
}

async fn list_accounts(State(state): State<RouterState>, headers: HeaderMap) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    let accounts: Vec<JsonValue> = state
        .store
        .enumerate()
        .await
        .iter()
        .enumerate()
        .map(|(index, record)| account_view(index, record))
        .collect();
    json_response(StatusCode::OK, json!({ "accounts": accounts }))
}

#[derive(Debug, Deserialize)]
struct ImportBody {
    toml: String,
    #[serde(default)]
    replace_existing: bool,
    #[serde(default)]
    filter_disabled: bool,
}

async fn import_toml(
    State(state): State<RouterState>,
    headers: HeaderMap,
    body: axum::Json<ImportBody>,
) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    let records = match parse_toml_accounts(&body.toml) {
        Ok(records) => records,
        Err(err) => return error_json(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    let options = ImportOptions {
        replace_existing: body.replace_existing,
        filter_disabled: body.filter_disabled,
    };
    match state.store.import(records, options).await {
        Ok(outcome) => {
            info!(
                imported = outcome.imported,
                skipped = outcome.skipped,
                total = outcome.total,
                "toml import"
            );
            json_response(
                StatusCode::OK,
                json!({
                    "imported": outcome.imported,
                    "skipped": outcome.skipped,
                    "total": outcome.total,
                }),
            )
        }
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn refresh_account(
    State(state): State<RouterState>,
    Path(index): Path<usize>,
    headers: HeaderMap,
) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    match state.pool.refresh_at(index).await {
        Ok(record) => json_response(StatusCode::OK, account_view(index, &record)),
        Err(RefreshAtError::NotFound) => error_json(StatusCode::NOT_FOUND, "credential not found"),
        Err(RefreshAtError::Terminal) => {
            error_json(StatusCode::BAD_GATEWAY, "refresh rejected; credential disabled")
        }
        Err(RefreshAtError::Transient) => error_json(StatusCode::BAD_GATEWAY, "refresh failed"),
    }
}

async fn refresh_all(State(state): State<RouterState>, headers: HeaderMap) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    let total = state.store.len().await;
    let mut refreshed = 0usize;
    let mut failed = 0usize;
    for index in 0..total {
        match state.pool.refresh_at(index).await {
            Ok(_) => refreshed += 1,
            Err(_) => failed += 1,
        }
    }
    json_response(StatusCode::OK, json!({ "refreshed": refreshed, "failed": failed }))
}

#[derive(Debug, Deserialize)]
struct EnableBody {
    enable: bool,
}

async fn enable_account(
    State(state): State<RouterState>,
    Path(index): Path<usize>,
    headers: HeaderMap,
    body: axum::Json<EnableBody>,
) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    match state.store.set_enabled(index, body.enable).await {
        Ok(()) => json_response(StatusCode::OK, json!({ "index": index, "enabled": body.enable })),
        Err(err) => error_json(StatusCode::NOT_FOUND, &err.to_string()),
    }
}

async fn delete_account(
    State(state): State<RouterState>,
    Path(index): Path<usize>,
    headers: HeaderMap,
) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    match state.store.remove_at(index).await {
        Ok(_) => json_response(StatusCode::OK, json!({ "removed": index })),
        Err(err) => error_json(StatusCode::NOT_FOUND, &err.to_string()),
    }
}

async fn delete_disabled(State(state): State<RouterState>, headers: HeaderMap) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    match state.store.remove_disabled().await {
        Ok(removed) => json_response(StatusCode::OK, json!({ "removed": removed })),
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn refresh_project_id(
    State(state): State<RouterState>,
    Path(index): Path<usize>,
    headers: HeaderMap,
) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    let Some(record) = state.store.get(index).await else {
        return error_json(StatusCode::NOT_FOUND, "credential not found");
    };
    let Some(access_token) = record.access_token.as_deref() else {
        return error_json(StatusCode::BAD_REQUEST, "credential has no access token");
    };
    match state.auth_api.resolve_project_id(access_token, false).await {
        Ok(project_id) => {
            if let Err(err) = state.store.set_project_id_at(index, project_id.clone()).await {
                return error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
            }
            json_response(StatusCode::OK, json!({ "index": index, "project_id": project_id }))
        }
        Err(err) => error_json(
            StatusCode::BAD_REQUEST,
            &format!("project id unresolved: {err}"),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct OAuthUrlQuery {
    redirect_uri: Option<String>,
}

const MANUAL_REDIRECT_URI: &str = "http://localhost:51121/oauth-callback";

async fn oauth_url(
    State(state): State<RouterState>,
    headers: HeaderMap,
    Query(query): Query<OAuthUrlQuery>,
) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    let redirect_uri = query
        .redirect_uri
        .unwrap_or_else(|| MANUAL_REDIRECT_URI.to_string());
    let oauth_state = uuid::Uuid::new_v4().to_string();
    let auth_url = state.auth_api.build_auth_url(&redirect_uri, &oauth_state);
    json_response(
        StatusCode::OK,
        json!({
            "auth_url": auth_url,
            "state": oauth_state,
            "redirect_uri": redirect_uri,
            "instructions": "Open auth_url, authorize, then paste the callback URL to /auth/oauth/parse-url.",
        }),
    )
}

#[derive(Debug, Deserialize)]
struct ParseUrlBody {
    url: String,
    #[serde(default)]
    redirect_uri: Option<String>,
    /// Re-authorization: replace this slot instead of appending.
    #[serde(default)]
    replace_index: Option<usize>,
}

/// Accept a pasted callback URL, exchange the code and store the resulting
/// credential, either appended or replacing an existing slot.
async fn oauth_parse_url(
    State(state): State<RouterState>,
    headers: HeaderMap,
    body: axum::Json<ParseUrlBody>,
) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    if let Some(error) = query_value(&body.url, "error") {
        return error_json(StatusCode::BAD_REQUEST, &error);
    }
    let Some(code) = query_value(&body.url, "code") else {
        return error_json(StatusCode::BAD_REQUEST, "callback url carries no code");
    };
    let redirect_uri = body
        .redirect_uri
        .clone()
        .unwrap_or_else(|| MANUAL_REDIRECT_URI.to_string());

    let grant = match state.auth_api.exchange_code(&code, &redirect_uri).await {
        Ok(grant) => grant,
        Err(err) => return error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };
    let Some(refresh_token) = grant.refresh_token.clone() else {
        return error_json(StatusCode::BAD_REQUEST, "exchange returned no refresh_token");
    };

    let project_id = state
        .auth_api
        .resolve_project_id(&grant.access_token, true)
        .await
        .ok();
    let email = state.auth_api.fetch_user_email(&grant.access_token).await;

    let mut record = CredentialRecord::new(refresh_token);
    record.access_token = Some(grant.access_token);
    record.expires_in = Some(grant.expires_in);
    record.issued_at = Some(unix_ms());
    record.project_id = project_id.clone();
    record.email = email.clone();

    let stored = match body.replace_index {
        Some(index) => state.store.replace_at(index, record).await,
        None => state.store.push(record).await,
    };
    if let Err(err) = stored {
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
    }
    info!(project_id = project_id.as_deref().unwrap_or(""), "credential added via oauth");
    json_response(
        StatusCode::OK,
        json!({ "project_id": project_id, "email": email }),
    )
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn logs_list(
    State(state): State<RouterState>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    let logs = state.log.recent(query.limit.unwrap_or(100)).await;
    json_response(
        StatusCode::OK,
        json!({ "logs": serde_json::to_value(logs).unwrap_or(JsonValue::Null) }),
    )
}

async fn log_detail(
    State(state): State<RouterState>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    match state.log.detail(id).await {
        Some(entry) => json_response(
            StatusCode::OK,
            serde_json::to_value(entry).unwrap_or(JsonValue::Null),
        ),
        None => error_json(StatusCode::NOT_FOUND, "log entry not found"),
    }
}

async fn logs_clear(State(state): State<RouterState>, headers: HeaderMap) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    match state.log.clear().await {
        Ok(()) => json_response(StatusCode::OK, json!({ "cleared": true })),
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    minutes: Option<u64>,
}

async fn logs_usage(
    State(state): State<RouterState>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Response {
    if let Some(rejected) = require_panel(&state, &headers) {
        return rejected;
    }
    let body = match query.minutes {
        Some(minutes) => {
            let usage = state
                .log
                .usage_within(Duration::from_secs(minutes * 60))
                .await;
            serde_json::to_value(usage).unwrap_or(JsonValue::Null)
        }
        None => {
            let usage = state.log.usage_summary().await;
            serde_json::to_value(usage).unwrap_or(JsonValue::Null)
        }
    };
    json_response(StatusCode::OK, json!({ "usage": body }))
}

fn query_value(url: &str, key: &str) -> Option<String> {
    let query = url.split_once('?').map(|(_, q)| q).unwrap_or(url);
    for pair in query.split('&') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        if name == key {
            return urlencoding::decode(value).ok().map(|v| v.into_owned());
        }
    }
    None
}
