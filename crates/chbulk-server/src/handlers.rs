// HTTP handlers: classify on the write path, proxy everything else.

use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use chbulk_core::{parse_query, percent_encode, Classified};
use metrics::counter;
use serde_json::json;
use tracing::debug;

use crate::AppState;

/// Errors surfaced to HTTP clients. Pass-through failures map to 502 so
/// callers can tell a dead backend apart from a proxy bug.
pub(crate) struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_GATEWAY, format!("{:#}", self.0)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Fold HTTP credentials into the routed query string the way the backend
/// expects them: Basic auth or X-ClickHouse-User/Key headers become
/// `user=`/`password=` parameters unless the client already set them.
fn with_auth(params: &str, headers: &HeaderMap) -> String {
    if params.contains("user=") {
        return params.to_string();
    }

    let creds = basic_credentials(headers).or_else(|| native_credentials(headers));
    let Some((user, password)) = creds else {
        return params.to_string();
    };

    let auth = format!(
        "user={}&password={}",
        percent_encode(&user),
        percent_encode(&password)
    );
    if params.is_empty() {
        auth
    } else {
        format!("{params}&{auth}")
    }
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn native_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let user = headers.get("x-clickhouse-user")?.to_str().ok()?;
    let password = headers
        .get("x-clickhouse-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    Some((user.to_string(), password.to_string()))
}

/// GET on the root path. An empty query is the standard liveness ping and
/// answered locally; inserts arriving via the `query=` parameter are
/// buffered like any other, the rest is proxied verbatim.
pub(crate) async fn read_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let params = query.unwrap_or_default();
    if params.is_empty() {
        return Ok("Ok.\n".into_response());
    }

    let params = with_auth(&params, &headers);
    match parse_query(&params, "") {
        Classified::Insert(stmt) => {
            state.collector.push(stmt);
            Ok(StatusCode::OK.into_response())
        }
        Classified::PassThrough => {
            let (body, status) = state.sender.send_query(&params, String::new()).await?;
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            Ok((status, body).into_response())
        }
    }
}

/// POST on the root path: recognized inserts are buffered and acknowledged
/// immediately; everything else is proxied and the backend's verdict
/// returned verbatim.
pub(crate) async fn write_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: String,
) -> Result<Response, AppError> {
    counter!("chbulk.http.requests", 1);
    let params = with_auth(&query.unwrap_or_default(), &headers);

    if state.debug {
        debug!(params = %params, body_bytes = body.len(), "incoming write");
    }

    match parse_query(&params, &body) {
        Classified::Insert(stmt) => {
            state.collector.push(stmt);
            Ok(StatusCode::OK.into_response())
        }
        Classified::PassThrough => {
            counter!("chbulk.http.passthrough", 1);
            let (body, status) = state.sender.send_query(&params, body).await?;
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            Ok((status, body).into_response())
        }
    }
}

/// Operational snapshot: queue depth, per-node health, buffered tables.
pub(crate) async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let servers: Vec<_> = state
        .sender
        .nodes_status()
        .into_iter()
        .map(|node| json!({ "url": node.url, "up": node.up, "last_error": node.last_error }))
        .collect();

    Json(json!({
        "status": "ok",
        "send_queue": state.sender.len(),
        "servers": servers,
        "tables": state.collector.pending_tables(),
    }))
}

pub(crate) async fn health_check() -> &'static str {
    "OK"
}
