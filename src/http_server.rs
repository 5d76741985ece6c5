//! HTTP server implementation using Axum.

use crate::error::ExecError;
use crate::file_store::{Detail, FileRecord};
use crate::runner::{ExecRequest, Execution, Outcome};
use crate::state::AppState;
use crate::workspace::FileRef;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::any::Any;
use std::net::SocketAddr;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const API_KEY_HEADER: &str = "x-api-key";

// Request/Response types
#[derive(Deserialize)]
struct ExecBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    lang: String,
    args: Option<String>,
    user_id: Option<String>,
    entity_id: Option<String>,
    #[serde(default)]
    files: Vec<FileRef>,
}

#[derive(Serialize)]
struct RunReport {
    stdout: String,
    stderr: String,
    code: Option<i32>,
    signal: Option<String>,
    output: String,
    status: Outcome,
    message: Option<String>,
    wall_time: u64,
    stdout_truncated: bool,
    stderr_truncated: bool,
}

#[derive(Serialize)]
struct ArtifactRef {
    id: String,
    name: String,
    path: String,
}

#[derive(Serialize)]
struct ExecResponse {
    run: RunReport,
    language: String,
    version: String,
    session_id: String,
    files: Vec<ArtifactRef>,
}

impl From<Execution> for ExecResponse {
    fn from(exec: Execution) -> Self {
        let r = exec.result;
        let files = exec
            .artifacts
            .into_iter()
            .map(|name| ArtifactRef {
                id: uuid::Uuid::new_v4().to_string(),
                path: format!("/download/{}/{}", exec.session_id, name),
                name,
            })
            .collect();
        Self {
            run: RunReport {
                output: r.stdout.clone(),
                wall_time: r.elapsed.as_millis() as u64,
                stdout: r.stdout,
                stderr: r.stderr,
                code: r.exit_code,
                signal: r.signal,
                status: r.outcome,
                message: r.message,
                stdout_truncated: r.stdout_truncated,
                stderr_truncated: r.stderr_truncated,
            },
            language: exec.language.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            session_id: exec.session_id,
            files,
        }
    }
}

#[derive(Serialize)]
struct UploadResponse {
    message: &'static str,
    session_id: String,
    files: Vec<FileRecord>,
}

#[derive(Deserialize)]
struct ListQuery {
    detail: Option<String>,
}

/// Errors as seen by HTTP callers.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Exec(ExecError),
}

impl From<ExecError> for ApiError {
    fn from(e: ExecError) -> Self {
        ApiError::Exec(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Invalid API key".to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Exec(e) if e.is_infrastructure() => {
                error!(error = %e, "Internal error");
                return internal_error();
            }
            ApiError::Exec(ExecError::TooLarge { .. }) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "File size limit exceeded".to_string(),
            ),
            ApiError::Exec(e @ ExecError::NotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()),
            ApiError::Exec(e) => (StatusCode::BAD_REQUEST, e.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response()
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "Handler panicked");
    internal_error()
}

/// Build the router. `/health` is open; everything else needs the API key.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/exec", post(execute))
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/files/:session_id", get(list_files))
        .route("/files/:session_id/:name", delete(delete_file))
        .route("/download/:session_id/:name", get(download_file))
        .route("/sessions/:session_id", delete(purge_session))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(protected)
        .route("/health", get(health))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if !presented.is_some_and(|key| keys_match(key, &state.config.api_key)) {
        warn!(path = %req.uri().path(), "Invalid API key attempt");
        return ApiError::Unauthorized.into_response();
    }
    next.run(req).await
}

/// Compare secrets in time independent of where they differ. Both sides are
/// hashed first so the length of the expected key does not leak either.
fn keys_match(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    let diff = presented
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    std::hint::black_box(diff) == 0
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn execute(
    State(state): State<AppState>,
    body: Result<Json<ExecBody>, JsonRejection>,
) -> Result<Json<ExecResponse>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    info!(
        lang = %body.lang,
        user = body.user_id.as_deref().unwrap_or("-"),
        files = body.files.len(),
        "POST /exec"
    );

    let exec = state
        .runner
        .execute(ExecRequest {
            code: body.code,
            lang: body.lang,
            args: body.args,
            session_id: body.entity_id,
            files: body.files,
        })
        .await?;
    Ok(Json(exec.into()))
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut entity_id = None;
    let mut batch = state.files.begin_upload().await?;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let file_name = field.file_name().map(str::to_string);
        let field_name = field.name().map(str::to_string);
        let Some(name) = file_name else {
            if field_name.as_deref() == Some("entity_id") {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                entity_id = Some(text);
            }
            continue;
        };
        let content_type = field.content_type().map(str::to_string);

        batch.start_file(name.clone(), content_type).await?;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?
        {
            if let Err(e) = batch.write(&chunk).await {
                if let ExecError::TooLarge { limit, .. } = &e {
                    warn!(name = %name, limit, "Upload exceeds size limit");
                }
                return Err(e.into());
            }
        }
    }

    info!(count = batch.len(), "POST /upload");
    let uploaded = state.files.upload(entity_id, batch).await?;
    Ok(Json(UploadResponse {
        message: "Files uploaded successfully",
        session_id: uploaded.session_id,
        files: uploaded.files,
    }))
}

async fn list_files(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<FileRecord>>, ApiError> {
    let detail = Detail::parse(query.detail.as_deref());
    let files = state.files.list(&session_id, detail).await?;
    info!(session = %session_id, count = files.len(), "Listed files");
    Ok(Json(files))
}

async fn delete_file(
    State(state): State<AppState>,
    Path((session_id, name)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.files.delete(&session_id, &name).await?;
    Ok(Json(json!({ "message": "File deleted successfully" })))
}

async fn download_file(
    State(state): State<AppState>,
    Path((session_id, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let file = state.files.download(&session_id, &name).await?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        file.name.replace('\\', "\\\\").replace('"', "\\\"")
    );
    let disposition =
        HeaderValue::from_str(&disposition).unwrap_or(HeaderValue::from_static("attachment"));
    let content_type = HeaderValue::from_str(&file.content_type)
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        file.data,
    )
        .into_response())
}

async fn purge_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.files.purge(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
