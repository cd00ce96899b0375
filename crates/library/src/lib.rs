use std::path::{Path, PathBuf};

use common::{TrackId, TrackStatus};
use metadata::MetadataError;
use redb::{CommitError, DatabaseError, StorageError, TableError, TransactionError};

mod catalog;
mod enrich;
mod events;
mod extract;
mod history;
mod identity;
mod jobs;
mod lease;
mod media;
mod pipeline;
mod rescan;
mod scanner;

#[cfg(test)]
mod testing;

pub use catalog::{BatchOutcome, Catalog, CatalogStats, UpsertOutcome, DEFAULT_HISTORY_KEEP};
pub use enrich::{EnrichOutcome, Enricher, DEFAULT_DURATION_TOLERANCE_SECS};
pub use events::{EventPublisher, EventSink, EventStream, HttpEventSink};
pub use extract::{extract, ExtractedTrack};
pub use identity::{diff_fields, resolve, Resolution};
pub use jobs::{
    Job, JobHandler, JobQueue, JobReceivers, PoolOptions, PoolStats, Priority, QueueDepths,
    WorkerPool,
};
pub use lease::{lease_key, LeaseStore, MemoryLeaseStore, WriteLeases, DEFAULT_LEASE_TTL};
pub use media::{CoverRenderer, FileTags, ImageCovers, LocalMedia, MediaTools};
pub use pipeline::{FsChange, IngestReport, Pipeline, PipelineConfig, PipelineParts, ScanReport};
pub use rescan::PeriodicRescan;
pub use scanner::{newest_first, scan_paths, ScanOptions};

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error("db error: {0}")]
    Redb(#[from] redb::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("track {0} not found")]
    TrackNotFound(TrackId),
    #[error("history entry {0} not found")]
    EntryNotFound(u64),
    #[error("track {id} cannot go from {current:?} to {requested:?}")]
    InvalidTransition {
        id: TrackId,
        current: TrackStatus,
        requested: TrackStatus,
    },
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<DatabaseError> for LibraryError {
    fn from(err: DatabaseError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TableError> for LibraryError {
    fn from(err: TableError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TransactionError> for LibraryError {
    fn from(err: TransactionError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<StorageError> for LibraryError {
    fn from(err: StorageError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<CommitError> for LibraryError {
    fn from(err: CommitError) -> Self {
        LibraryError::Redb(err.into())
    }
}

/// Catalog rows and lease keys both use absolute, non-canonicalized paths.
pub fn absolute_path(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let ext = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => return false,
    };
    extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(&ext))
}

pub const DEFAULT_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "opus", "m4a", "aac", "wav"];

pub fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect()
}
