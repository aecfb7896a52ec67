//! HTTP routes for the web server.

use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::json;
use tokio_util::io::{ReaderStream, StreamReader};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use super::error::ApiError;
use crate::archive::{ArchiveBuilder, ARCHIVE_FILE_NAME};
use crate::discovery::{local_network_address, server_url};
use crate::store::content_type::{self, ALLOWED_PREFIXES, DEFAULT_CONTENT_TYPE};
use crate::store::{FileStore, StoredFile};

/// Multipart field carrying uploaded files.
pub const UPLOAD_FIELD: &str = "files";

/// SSE event name for store changes.
pub const FILES_UPDATED_EVENT: &str = "files-updated";

/// Room for multipart framing on top of the file payloads.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Shared application state.
pub struct AppState {
    pub store: Arc<FileStore>,
    pub archive: ArchiveBuilder,
    pub max_files_per_upload: usize,
    /// Port the HTTP server is reachable on.
    pub port: u16,
}

impl AppState {
    pub fn new(store: Arc<FileStore>, max_files_per_upload: usize, port: u16) -> Self {
        Self {
            archive: ArchiveBuilder::new(Arc::clone(&store)),
            store,
            max_files_per_upload,
            port,
        }
    }

    /// Largest request body accepted by the upload route.
    fn upload_body_limit(&self) -> usize {
        let limit = self
            .store
            .max_file_bytes()
            .saturating_mul(self.max_files_per_upload as u64)
            .saturating_add(MULTIPART_OVERHEAD);
        usize::try_from(limit).unwrap_or(usize::MAX)
    }
}

/// Build the router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.upload_body_limit();

    Router::new()
        .route("/api/files", get(list_handler))
        .route(
            "/api/upload",
            post(upload_handler).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/download/:storage_name", get(download_handler))
        .route("/api/preview/:storage_name", get(preview_handler))
        .route("/api/delete/:storage_name", delete(delete_handler))
        .route("/api/download-all", get(download_all_handler))
        .route("/api/events", get(events_handler))
        .route("/api/server-info", get(server_info_handler))
        .route("/api/allowed-types", get(allowed_types_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Every stored file, newest first.
async fn list_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<StoredFile>>, ApiError> {
    let mut files = state.store.list().await?;
    files.sort_by(|a, b| {
        b.modified_at
            .cmp(&a.modified_at)
            .then_with(|| b.storage_name.cmp(&a.storage_name))
    });
    Ok(Json(files))
}

#[derive(Serialize)]
struct UploadResponse {
    message: &'static str,
    files: Vec<StoredFile>,
}

/// Accept one or more files; either all of them are stored or none.
async fn upload_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut batch = state.store.begin_batch();

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            debug!(field = ?field.name(), "ignoring unexpected multipart field");
            continue;
        }
        if batch.len() >= state.max_files_per_upload {
            return Err(ApiError::bad_request(format!(
                "Too many files: at most {} per upload",
                state.max_files_per_upload
            )));
        }

        let display_name = field.file_name().unwrap_or_default().to_string();
        let declared_type = field
            .content_type()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let content = StreamReader::new(
            field.map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        );

        batch
            .stage(&display_name, &declared_type, content)
            .await?;
    }

    if batch.is_empty() {
        return Err(ApiError::bad_request("No files uploaded"));
    }

    let files = batch.commit().await?;
    Ok(Json(UploadResponse {
        message: "Files uploaded successfully",
        files,
    }))
}

/// Download a file under its display name.
async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(storage_name): Path<String>,
) -> Result<Response, ApiError> {
    transfer(&state.store, &storage_name, Disposition::Attachment).await
}

/// Serve a file for viewing in the browser.
async fn preview_handler(
    State(state): State<Arc<AppState>>,
    Path(storage_name): Path<String>,
) -> Result<Response, ApiError> {
    transfer(&state.store, &storage_name, Disposition::Inline).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Attachment,
    Inline,
}

async fn transfer(
    store: &FileStore,
    storage_name: &str,
    disposition: Disposition,
) -> Result<Response, ApiError> {
    let download = store.resolve_for_download(storage_name).await?;
    debug!(storage_name, size = download.size_bytes, "serving file");

    let headers = [
        (header::CONTENT_TYPE, download.content_type.clone()),
        (
            header::CONTENT_DISPOSITION,
            content_disposition(disposition, &download.display_name),
        ),
        (header::CONTENT_LENGTH, download.size_bytes.to_string()),
    ];
    let body = Body::from_stream(ReaderStream::new(download.file));
    Ok((headers, body).into_response())
}

/// `attachment; filename="..."; filename*=UTF-8''...` with an ASCII fallback.
fn content_disposition(disposition: Disposition, file_name: &str) -> String {
    let kind = match disposition {
        Disposition::Attachment => "attachment",
        Disposition::Inline => "inline",
    };
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "{}; filename=\"{}\"; filename*=UTF-8''{}",
        kind,
        fallback,
        percent_encode(file_name)
    )
}

/// RFC 5987 `attr-char` encoding.
fn percent_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        let keep = byte.is_ascii_alphanumeric()
            || matches!(
                byte,
                b'!' | b'#' | b'$' | b'&' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
            );
        if keep {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path(storage_name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.store.remove(&storage_name).await?;
    Ok(Json(MessageResponse {
        message: "File deleted successfully",
    }))
}

/// Stream every stored file as one ZIP.
async fn download_all_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let stream = state.archive.build().await?;
    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            content_disposition(Disposition::Attachment, ARCHIVE_FILE_NAME),
        ),
    ];
    Ok((headers, Body::from_stream(stream)).into_response())
}

/// Push every store change to the viewer as a Server-Sent Event.
async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = state.store.subscribe();
    info!(
        viewers = state.store.notifier().subscriber_count(),
        "viewer subscribed to changes"
    );

    let events = subscription
        .into_stream()
        .map(|event| Event::default().event(FILES_UPDATED_EVENT).json_data(event));
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfo {
    server_url: String,
    #[serde(rename = "localIP")]
    local_ip: String,
    port: u16,
}

async fn server_info_handler(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    let ip = local_network_address();
    Json(ServerInfo {
        server_url: match ip {
            Some(ip) => server_url(ip, state.port),
            None => format!("http://localhost:{}", state.port),
        },
        local_ip: ip.map_or_else(|| "localhost".to_string(), |ip| ip.to_string()),
        port: state.port,
    })
}

async fn allowed_types_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let examples = [
        ("PNG Image", "image/png"),
        ("JPEG Image", "image/jpeg"),
        ("PDF Document", content_type::PDF_CONTENT_TYPE),
        (
            "Word Doc",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ),
        (
            "Excel",
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ),
        ("Text File", "text/plain"),
        ("ZIP Archive", "application/zip"),
    ];
    let examples: serde_json::Map<String, serde_json::Value> = examples
        .into_iter()
        .map(|(label, mime)| (label.to_string(), json!(mime)))
        .collect();

    Json(json!({
        "allowedMimeTypes": ALLOWED_PREFIXES,
        "examples": examples,
        "maxFileBytes": state.store.max_file_bytes(),
        "maxFilesPerUpload": state.max_files_per_upload,
    }))
}
