pub mod events;
pub mod library;
pub mod tracks;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use ::library::LibraryError;

use crate::state::{AppState, ErrorResponse, HealthResponse};
use crate::utils::library_error;

const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

pub fn api_router(state: AppState) -> Router {
    let uploads = Router::new()
        .route("/uploads", post(library::upload))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES));

    Router::new()
        .route("/health", get(health))
        .route("/events", get(events::subscribe).post(events::publish))
        .route("/queues", get(events::queues))
        .route("/library/scan", post(library::trigger_scan))
        .route("/downloads/complete", post(library::download_complete))
        .route("/tracks/errors", get(tracks::list_errored))
        .route(
            "/tracks/:track_id",
            get(tracks::get_track)
                .patch(tracks::edit_track)
                .delete(tracks::delete_track),
        )
        .route("/tracks/:track_id/retry", post(tracks::retry_track))
        .route("/tracks/:track_id/history", get(tracks::track_history))
        .route("/tracks/:track_id/cover", get(tracks::get_cover))
        .route("/history/:entry_id/rollback", post(tracks::rollback))
        .merge(uploads)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Runs catalog work off the async threads and maps its errors for HTTP.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, (StatusCode, Json<ErrorResponse>)>
where
    F: FnOnce() -> Result<T, LibraryError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(library_error),
        Err(err) => Err(library_error(LibraryError::Task(err))),
    }
}
