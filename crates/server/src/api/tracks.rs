use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use common::{find_cover, CoverSize, HistoryEntry, TrackId, TrackView};
use library::{Job, LibraryError};
use tracing::info;

use crate::state::{
    AppState, CoverQuery, DeletedResponse, EditTrackRequest, EnqueuedResponse, ErrorResponse,
    JsonResult, ListResponse, TrackResponse,
};
use crate::utils::{file_response, json_error, json_error_response, library_error};

use super::blocking;

pub async fn list_errored(State(state): State<AppState>) -> JsonResult<ListResponse<TrackView>> {
    let catalog = state.pipeline.catalog().clone();
    let tracks = blocking(move || catalog.list_errored()).await?;
    let items: Vec<TrackView> = tracks.iter().map(TrackView::from).collect();
    Ok(Json(ListResponse {
        total: items.len(),
        items,
    }))
}

pub async fn get_track(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<TrackId>,
) -> JsonResult<TrackResponse> {
    let catalog = state.pipeline.catalog().clone();
    let track = blocking(move || catalog.get_track(id)?.ok_or(LibraryError::TrackNotFound(id))).await?;
    Ok(Json(TrackResponse {
        track: TrackView::from(&track),
    }))
}

pub async fn edit_track(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<TrackId>,
    Json(request): Json<EditTrackRequest>,
) -> JsonResult<TrackResponse> {
    let title = non_empty(request.title);
    let artist = non_empty(request.artist);
    if title.is_none() && artist.is_none() {
        return Err(json_error(StatusCode::BAD_REQUEST, "title or artist is required"));
    }
    let track = state
        .pipeline
        .edit_track(id, title, artist)
        .await
        .map_err(library_error)?;
    Ok(Json(TrackResponse {
        track: TrackView::from(&track),
    }))
}

/// Deletion runs as a job; the response only confirms it was queued.
pub async fn delete_track(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<TrackId>,
) -> Result<(StatusCode, Json<DeletedResponse>), (StatusCode, Json<ErrorResponse>)> {
    let catalog = state.pipeline.catalog().clone();
    blocking(move || catalog.get_track(id)?.ok_or(LibraryError::TrackNotFound(id))).await?;
    let job = Job::DeleteTrack { id };
    if !state.pipeline.enqueue(job.clone()) {
        return Err(json_error(StatusCode::SERVICE_UNAVAILABLE, "job queue closed"));
    }
    info!("Queued deletion of track {}", id);
    Ok((StatusCode::ACCEPTED, Json(DeletedResponse { id, job })))
}

pub async fn retry_track(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<TrackId>,
) -> JsonResult<EnqueuedResponse> {
    let job = state.pipeline.requeue(id).await.map_err(library_error)?;
    Ok(Json(EnqueuedResponse { job }))
}

pub async fn track_history(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<TrackId>,
) -> JsonResult<ListResponse<HistoryEntry>> {
    let catalog = state.pipeline.catalog().clone();
    let items = blocking(move || {
        catalog.get_track(id)?.ok_or(LibraryError::TrackNotFound(id))?;
        catalog.history_for(id)
    })
    .await?;
    Ok(Json(ListResponse {
        total: items.len(),
        items,
    }))
}

pub async fn rollback(
    State(state): State<AppState>,
    AxumPath(entry_id): AxumPath<u64>,
) -> JsonResult<TrackResponse> {
    let track = state.pipeline.rollback(entry_id).await.map_err(library_error)?;
    Ok(Json(TrackResponse {
        track: TrackView::from(&track),
    }))
}

pub async fn get_cover(
    State(state): State<AppState>,
    Query(query): Query<CoverQuery>,
    AxumPath(id): AxumPath<TrackId>,
) -> Response {
    let size = match query.size.as_deref() {
        None | Some("small") => CoverSize::Small,
        Some("original") => CoverSize::Original,
        Some(other) => {
            return json_error_response(StatusCode::BAD_REQUEST, format!("unknown size {}", other))
        }
    };
    let path = match find_cover(&state.pipeline.config().covers_dir, id, size) {
        Some(path) => path,
        None => return json_error_response(StatusCode::NOT_FOUND, "cover not found"),
    };
    // Renditions are rewritten in place; a vanished file is just a miss.
    match tokio::fs::read(&path).await {
        Ok(bytes) => file_response(bytes, &path),
        Err(_) => json_error_response(StatusCode::NOT_FOUND, "cover not found"),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
