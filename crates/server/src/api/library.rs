use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use library::{absolute_path, Job};
use tracing::info;
use uuid::Uuid;

use crate::scan::run_scan;
use crate::state::{
    AppState, DownloadCompleteRequest, EnqueuedResponse, ErrorResponse, HealthResponse,
    ScanRequest, UploadQuery, UploadResponse,
};
use crate::utils::{json_error, sanitize_file_name};

type Accepted<T> = Result<(StatusCode, Json<T>), (StatusCode, Json<ErrorResponse>)>;

pub async fn trigger_scan(
    State(state): State<AppState>,
    request: Option<Json<ScanRequest>>,
) -> Accepted<HealthResponse> {
    let floor = request
        .and_then(|Json(request)| request.modified_since)
        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        run_scan(pipeline, floor, "Requested").await;
    });
    Ok((StatusCode::ACCEPTED, Json(HealthResponse { status: "scanning" })))
}

/// Stores the request body under the uploads directory and queues ingestion.
pub async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Accepted<UploadResponse> {
    let dir = state
        .uploads_dir
        .clone()
        .ok_or_else(|| json_error(StatusCode::SERVICE_UNAVAILABLE, "music directory must be set"))?;
    let name = query
        .filename
        .as_deref()
        .and_then(sanitize_file_name)
        .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "filename is required"))?;
    if !state.pipeline.is_audio(Path::new(&name)) {
        return Err(json_error(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported file type"));
    }
    if body.is_empty() {
        return Err(json_error(StatusCode::BAD_REQUEST, "empty upload"));
    }

    let path = dir.join(format!("{}-{}", Uuid::new_v4().simple(), name));
    let write = async {
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(&path, &body).await
    };
    if let Err(err) = write.await {
        return Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to store upload: {}", err),
        ));
    }

    let job = Job::IngestFile { path: path.clone() };
    enqueue(&state, job.clone())?;
    info!("Stored upload {:?} ({} bytes)", path, body.len());
    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            path: path.to_string_lossy().to_string(),
            job,
        }),
    ))
}

/// Called by the downloader once a file has landed inside the library.
pub async fn download_complete(
    State(state): State<AppState>,
    Json(request): Json<DownloadCompleteRequest>,
) -> Accepted<EnqueuedResponse> {
    let path = absolute_path(Path::new(request.path.trim()));
    if !inside_library(&state, &path) {
        return Err(json_error(StatusCode::BAD_REQUEST, "path is outside the library"));
    }
    if !state.pipeline.is_audio(&path) {
        return Err(json_error(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported file type"));
    }
    if !path.is_file() {
        return Err(json_error(StatusCode::NOT_FOUND, "file not found"));
    }
    let job = Job::IngestFile { path };
    enqueue(&state, job.clone())?;
    Ok((StatusCode::ACCEPTED, Json(EnqueuedResponse { job })))
}

fn inside_library(state: &AppState, path: &Path) -> bool {
    let roots: Vec<&PathBuf> = state
        .pipeline
        .config()
        .roots
        .iter()
        .chain(state.uploads_dir.iter())
        .collect();
    !path
        .components()
        .any(|part| matches!(part, std::path::Component::ParentDir))
        && roots.iter().any(|root| path.starts_with(root))
}

fn enqueue(state: &AppState, job: Job) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if state.pipeline.enqueue(job) {
        Ok(())
    } else {
        Err(json_error(StatusCode::SERVICE_UNAVAILABLE, "job queue closed"))
    }
}
