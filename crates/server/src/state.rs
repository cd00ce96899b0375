use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::Json;
use common::{TrackId, TrackView};
use library::{EventPublisher, Job, Pipeline, PoolStats, QueueDepths, WorkerPool};
use notify::RecommendedWatcher;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub events: EventPublisher,
    pub pool: Arc<RwLock<Option<WorkerPool>>>,
    pub watcher: Arc<RwLock<Option<RecommendedWatcher>>>,
    pub config: Arc<ServerConfig>,
    pub uploads_dir: Option<PathBuf>,
    /// Cancelled once the server starts shutting down; ends open event streams.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn pool_stats(&self) -> PoolStats {
        self.pool
            .read()
            .as_ref()
            .map(WorkerPool::stats)
            .unwrap_or_default()
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct QueuesResponse {
    pub queues: QueueDepths,
    pub workers: PoolStats,
    pub subscribers: usize,
}

#[derive(Serialize)]
pub struct EnqueuedResponse {
    pub job: Job,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub path: String,
    pub job: Job,
}

#[derive(Serialize)]
pub struct DeletedResponse {
    pub id: TrackId,
    pub job: Job,
}

#[derive(Serialize)]
pub struct TrackResponse {
    pub track: TrackView,
}

#[derive(Debug, Default, Deserialize)]
pub struct EditTrackRequest {
    pub title: Option<String>,
    pub artist: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadCompleteRequest {
    pub path: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    /// Unix seconds; only files modified after this are read.
    pub modified_since: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CoverQuery {
    pub size: Option<String>,
}

pub type JsonResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;
