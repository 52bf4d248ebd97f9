//! HTTP and WebSocket routes over the core front-ends.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sqlharbor_core::config::{Attachment, DatabaseConfig};
use sqlharbor_core::manager::{AttachOutcome, ConnectionManager};
use sqlharbor_core::session::{TxId, TxSessionRegistry};
use sqlharbor_core::statement::StatementRunner;
use sqlharbor_core::tx::{run_script, run_stream, Command, Inbound, Reply, TxEngine};
use sqlharbor_core::{CallContext, Caller, ErrorKind, ServerError};

use crate::status;

pub const ROLE_HEADER: &str = "x-sqlharbor-role";
pub const READ_ONLY_HEADER: &str = "x-sqlharbor-read-only";
pub const TIMEOUT_HEADER: &str = "x-sqlharbor-timeout-ms";

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
    pub engine: Arc<TxEngine>,
    pub sessions: Arc<TxSessionRegistry>,
    pub runner: Arc<StatementRunner>,
    pub stream_idle_timeout: Duration,
    /// Cancelled on shutdown; open streams observe it.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status.json", get(status::status_json))
        .route("/v1/databases", get(list_databases).post(mount_database))
        .route(
            "/v1/databases/:name",
            get(get_database).put(update_database).delete(unmount_database),
        )
        .route("/v1/databases/:name/attachments", post(attach))
        .route("/v1/databases/:name/attachments/:alias", delete(detach))
        .route("/v1/databases/:name/statements", post(run_statement))
        .route("/v1/script", post(script))
        .route("/v1/transactions", post(begin_transaction))
        .route(
            "/v1/transactions/:id",
            post(transaction_command).delete(rollback_transaction),
        )
        .route("/v1/stream", get(stream_upgrade))
        .with_state(state)
}

pub fn status_from_error(err: &ServerError) -> StatusCode {
    match err.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ProtocolViolation => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::ResourceFailure => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Statement => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Cancelled => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub struct ApiError(ServerError);

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_from_error(&self.0);
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        } else {
            debug!(error = %self.0, "request rejected");
        }
        (status, Json(Reply::error(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn caller_from_headers(headers: &HeaderMap) -> Caller {
    let role = headers
        .get(ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous");
    let read_only = headers
        .get(READ_ONLY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    Caller::new(role, read_only)
}

fn request_context(headers: &HeaderMap) -> CallContext {
    let ctx = CallContext::new(caller_from_headers(headers));
    match headers
        .get(TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        Some(ms) if ms > 0 => ctx.with_timeout(Duration::from_millis(ms)),
        _ => ctx,
    }
}

async fn list_databases(State(state): State<AppState>) -> Json<Vec<DatabaseConfig>> {
    Json(state.manager.databases())
}

async fn get_database(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<DatabaseConfig>> {
    let config = state
        .manager
        .database(&name)
        .ok_or(ServerError::DatabaseNotFound(name))?;
    Ok(Json(config.as_ref().clone()))
}

async fn mount_database(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(config): Json<DatabaseConfig>,
) -> ApiResult<(StatusCode, Json<DatabaseConfig>)> {
    let ctx = request_context(&headers);
    state.manager.mount(&ctx, config.clone()).await?;
    Ok((StatusCode::CREATED, Json(config)))
}

async fn update_database(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(config): Json<DatabaseConfig>,
) -> ApiResult<Json<DatabaseConfig>> {
    if config.name != name {
        return Err(ServerError::ProtocolViolation(format!(
            "body names database '{}' but the path names '{name}'",
            config.name
        ))
        .into());
    }
    let ctx = request_context(&headers);
    state.manager.update(&ctx, config.clone()).await?;
    Ok(Json(config))
}

async fn unmount_database(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.manager.unmount(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn attach(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(attachment): Json<Attachment>,
) -> ApiResult<(StatusCode, Json<Attachment>)> {
    let status = match state.manager.attach(&name, attachment.clone())? {
        AttachOutcome::Added => StatusCode::CREATED,
        AttachOutcome::Unchanged => StatusCode::OK,
    };
    Ok((status, Json(attachment)))
}

async fn detach(
    State(state): State<AppState>,
    Path((name, alias)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.manager.detach(&name, &alias)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_statement(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(command): Json<Command>,
) -> ApiResult<Json<Reply>> {
    let ctx = request_context(&headers);
    Ok(Json(state.runner.run(&ctx, &name, command).await?))
}

#[derive(Debug, Deserialize)]
struct ScriptRequest {
    commands: Vec<Command>,
}

#[derive(Debug, Serialize)]
struct ScriptResponse {
    replies: Vec<Reply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_at: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Reply>,
}

async fn script(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ScriptRequest>,
) -> (StatusCode, Json<ScriptResponse>) {
    let ctx = request_context(&headers);
    match run_script(&state.engine, &ctx, request.commands).await {
        Ok(replies) => (
            StatusCode::OK,
            Json(ScriptResponse {
                replies,
                failed_at: None,
                error: None,
            }),
        ),
        Err(failure) => (
            status_from_error(&failure.error),
            Json(ScriptResponse {
                error: Some(Reply::error(&failure.error)),
                replies: failure.replies,
                failed_at: failure.index,
            }),
        ),
    }
}

async fn begin_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(command): Json<Command>,
) -> ApiResult<(StatusCode, Json<Reply>)> {
    let (database, lock_mode, timeout_ms) = match command {
        Command::Begin {
            database,
            lock_mode,
            timeout_ms,
        } => (database, lock_mode, timeout_ms),
        other => {
            return Err(ServerError::ProtocolViolation(format!(
                "expected begin, got {}",
                other.name()
            ))
            .into())
        }
    };
    let ctx = request_context(&headers);
    let reply = state
        .sessions
        .begin(&ctx, &database, lock_mode, timeout_ms.map(Duration::from_millis))
        .await?;
    Ok((StatusCode::CREATED, Json(reply)))
}

async fn transaction_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(command): Json<Command>,
) -> ApiResult<Json<Reply>> {
    let ctx = request_context(&headers);
    let reply = state
        .sessions
        .execute(&ctx, &TxId::from(id), command)
        .await?;
    Ok(Json(reply))
}

async fn rollback_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Reply>> {
    Ok(Json(state.sessions.rollback(&TxId::from(id)).await?))
}

async fn stream_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let caller = caller_from_headers(&headers);
    ws.on_upgrade(move |socket| drive_socket(state, caller, socket))
}

fn decode_message(message: Result<Message, axum::Error>) -> Option<Result<Inbound, ServerError>> {
    match message {
        Ok(Message::Text(text)) => Some(decode_command(text.as_bytes()).map(Inbound::Command)),
        Ok(Message::Binary(bytes)) => Some(decode_command(&bytes).map(Inbound::Command)),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Some(Ok(Inbound::KeepAlive)),
        Ok(Message::Close(_)) => None,
        Err(err) => {
            debug!(error = %err, "websocket receive failed");
            Some(Err(ServerError::Cancelled))
        }
    }
}

fn decode_command(bytes: &[u8]) -> Result<Command, ServerError> {
    serde_json::from_slice(bytes)
        .map_err(|err| ServerError::ProtocolViolation(format!("malformed command: {err}")))
}

async fn drive_socket(state: AppState, caller: Caller, socket: WebSocket) {
    let (mut sink, source) = socket.split();
    let inbound = Box::pin(
        source
            .take_while(|message| futures::future::ready(!matches!(message, Ok(Message::Close(_)))))
            .filter_map(|message| futures::future::ready(decode_message(message))),
    );

    let (tx, mut rx) = mpsc::channel::<Reply>(64);
    let writer = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            let text = match serde_json::to_string(&reply) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode reply");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let ctx = CallContext::new(caller).with_cancellation(state.shutdown.child_token());
    if let Err(err) = run_stream(&state.engine, ctx, state.stream_idle_timeout, inbound, tx).await {
        debug!(error = %err, "stream ended with an error");
    }
    if let Err(err) = writer.await {
        warn!(error = %err, "stream writer task failed");
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    fn state() -> AppState {
        let manager = Arc::new(ConnectionManager::in_memory(Duration::from_secs(60)));
        let engine = Arc::new(TxEngine::new(Arc::clone(&manager), 64));
        let sessions = Arc::new(TxSessionRegistry::new(
            Arc::clone(&engine),
            Duration::from_secs(30),
            Duration::from_secs(60),
        ));
        let runner = Arc::new(StatementRunner::new(Arc::clone(&manager), 64));
        AppState {
            manager,
            engine,
            sessions,
            runner,
            stream_idle_timeout: Duration::from_secs(5),
            shutdown: CancellationToken::new(),
        }
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Result<(StatusCode, Value)> {
        let mut request = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => request.body(Body::empty())?,
        };
        let response = app.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, value))
    }

    async fn mounted(dir: &std::path::Path) -> Result<Router> {
        let app = router(state());
        let path = dir.join("app.sqlite");
        let (status, _) = call(
            &app,
            "POST",
            "/v1/databases",
            Some(json!({ "name": "app", "path": path })),
            &[],
        )
        .await?;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(
            &app,
            "POST",
            "/v1/databases/app/statements",
            Some(json!({ "type": "exec", "sql": "CREATE TABLE t (v INTEGER)" })),
            &[],
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        Ok(app)
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(
            status_from_error(&ServerError::DatabaseNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_from_error(&ServerError::Conflict("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_from_error(&ServerError::InvalidParameter("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_from_error(&ServerError::ResourceFailure("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn callers_come_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_from_headers(&headers), Caller::read_write("anonymous"));
        headers.insert(ROLE_HEADER, "analyst".parse().unwrap());
        headers.insert(READ_ONLY_HEADER, "True".parse().unwrap());
        assert_eq!(caller_from_headers(&headers), Caller::read_only("analyst"));
    }

    #[test]
    fn websocket_frames_decode_to_inbound_items() {
        assert!(matches!(
            decode_message(Ok(Message::Ping(vec![1]))),
            Some(Ok(Inbound::KeepAlive))
        ));
        assert!(matches!(
            decode_message(Ok(Message::Pong(Vec::new()))),
            Some(Ok(Inbound::KeepAlive))
        ));
        assert!(matches!(
            decode_message(Ok(Message::Text(r#"{"type":"commit"}"#.to_string()))),
            Some(Ok(Inbound::Command(Command::Commit)))
        ));
        assert!(matches!(
            decode_message(Ok(Message::Text("{".to_string()))),
            Some(Err(ServerError::ProtocolViolation(_)))
        ));
        assert!(decode_message(Ok(Message::Close(None))).is_none());
    }

    #[tokio::test]
    async fn status_lists_mounted_databases() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let app = mounted(dir.path()).await?;
        let (status, body) = call(&app, "GET", "/status.json", None, &[]).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["manager"]["databases"], json!(["app"]));
        assert_eq!(body["sessions"]["total_sessions"], json!(0));
        assert!(body["generated_at_ms"].as_u64().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn session_transactions_over_http() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let app = mounted(dir.path()).await?;
        let (status, begun) = call(
            &app,
            "POST",
            "/v1/transactions",
            Some(json!({ "type": "begin", "database": "app", "lock_mode": "immediate" })),
            &[],
        )
        .await?;
        assert_eq!(status, StatusCode::CREATED);
        let id = begun["id"].as_str().unwrap_or_default().to_string();
        assert!(!id.is_empty());
        let uri = format!("/v1/transactions/{id}");

        let (status, _) = call(
            &app,
            "POST",
            &uri,
            Some(json!({ "type": "exec", "sql": "INSERT INTO t VALUES (?)", "params": [{ "type": "integer", "value": 7 }] })),
            &[],
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        let (status, reply) = call(
            &app,
            "POST",
            &uri,
            Some(json!({ "type": "exec", "sql": "INSERT INTO missing VALUES (1)" })),
            &[],
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["type"], "statement_error");
        let (status, reply) = call(&app, "POST", &uri, Some(json!({ "type": "commit" })), &[]).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["type"], "committed");

        let (status, reply) = call(&app, "POST", &uri, Some(json!({ "type": "commit" })), &[]).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(reply["kind"], "not_found");
        let (status, _) = call(&app, "DELETE", &uri, None, &[]).await?;
        assert_eq!(status, StatusCode::OK);

        let (_, rows) = call(
            &app,
            "POST",
            "/v1/databases/app/statements",
            Some(json!({ "type": "query", "sql": "SELECT v FROM t" })),
            &[],
        )
        .await?;
        assert_eq!(rows["rows"], json!([[{ "type": "integer", "value": 7 }]]));
        Ok(())
    }

    #[tokio::test]
    async fn failed_scripts_report_the_failing_command() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let app = mounted(dir.path()).await?;
        let (status, body) = call(
            &app,
            "POST",
            "/v1/script",
            Some(json!({ "commands": [
                { "type": "begin", "database": "app" },
                { "type": "exec", "sql": "INSERT INTO t VALUES (1)" },
                { "type": "exec", "sql": "INSERT INTO nope VALUES (1)" },
                { "type": "commit" }
            ] })),
            &[],
        )
        .await?;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["failed_at"], json!(2));
        assert_eq!(body["replies"].as_array().map(Vec::len), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn read_only_callers_cannot_write() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let app = mounted(dir.path()).await?;
        let (status, body) = call(
            &app,
            "POST",
            "/v1/databases/app/statements",
            Some(json!({ "type": "exec", "sql": "INSERT INTO t VALUES (1)" })),
            &[(ROLE_HEADER, "viewer"), (READ_ONLY_HEADER, "1")],
        )
        .await?;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "statement");
        Ok(())
    }

    #[tokio::test]
    async fn attachments_and_unmount_conflicts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let app = mounted(dir.path()).await?;
        let other = dir.path().join("other.sqlite");
        let (status, _) = call(
            &app,
            "POST",
            "/v1/databases",
            Some(json!({ "name": "other", "path": other })),
            &[],
        )
        .await?;
        assert_eq!(status, StatusCode::CREATED);

        let attach = json!({ "alias": "o", "database": "other" });
        let (status, _) = call(&app, "POST", "/v1/databases/app/attachments", Some(attach.clone()), &[]).await?;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(&app, "POST", "/v1/databases/app/attachments", Some(attach), &[]).await?;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&app, "DELETE", "/v1/databases/other", None, &[]).await?;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = call(&app, "DELETE", "/v1/databases/app/attachments/o", None, &[]).await?;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "DELETE", "/v1/databases/other", None, &[]).await?;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", "/v1/databases/other", None, &[]).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        Ok(())
    }
}
