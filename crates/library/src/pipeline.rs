use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{
    now_secs, remove_covers, EventAction, EventLevel, LastError, Track, TrackEvent, TrackId,
};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::{BatchOutcome, Catalog, UpsertOutcome};
use crate::enrich::{restore_times, EnrichOutcome, Enricher};
use crate::events::EventSink;
use crate::extract::{extract, path_inode, ExtractedTrack};
use crate::jobs::{Job, JobHandler, JobQueue, QueueDepths, ENRICH_TRACK};
use crate::lease::WriteLeases;
use crate::media::{CoverRenderer, MediaTools};
use crate::scanner::{newest_first, scan_paths, ScanOptions};
use crate::{absolute_path, default_extensions, has_extension, LibraryError};

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub roots: Vec<PathBuf>,
    pub extensions: Vec<String>,
    pub covers_dir: PathBuf,
    pub extract_parallelism: usize,
    pub batch_size: usize,
    pub duration_tolerance_secs: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            extensions: default_extensions(),
            covers_dir: PathBuf::from("covers"),
            extract_parallelism: 4,
            batch_size: 100,
            duration_tolerance_secs: crate::enrich::DEFAULT_DURATION_TOLERANCE_SECS,
        }
    }
}

/// Everything the pipeline is built from. Handles are passed in rather
/// than created here so the caller owns their lifecycle.
pub struct PipelineParts {
    pub catalog: Catalog,
    pub media: Arc<dyn MediaTools>,
    pub covers: Arc<dyn CoverRenderer>,
    pub leases: WriteLeases,
    pub queue: JobQueue,
    pub events: Arc<dyn EventSink>,
    pub config: PipelineConfig,
}

/// Filesystem change as reported by a watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsChange {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub updated: usize,
    pub moved: usize,
    pub unchanged: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub files: usize,
    pub ingest: IngestReport,
    pub missing: usize,
    /// PENDING rows from earlier runs whose enrichment was queued again.
    pub resumed: usize,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: Catalog,
    media: Arc<dyn MediaTools>,
    leases: WriteLeases,
    queue: JobQueue,
    events: Arc<dyn EventSink>,
    enricher: Enricher,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(parts: PipelineParts) -> Self {
        let PipelineParts {
            catalog,
            media,
            covers,
            leases,
            queue,
            events,
            mut config,
        } = parts;
        config.roots = config.roots.iter().map(|root| absolute_path(root)).collect();
        let enricher = Enricher::new(catalog.clone(), Arc::clone(&media), covers, leases.clone())
            .with_duration_tolerance(config.duration_tolerance_secs);
        Self {
            inner: Arc::new(Inner {
                catalog,
                media,
                leases,
                queue,
                events,
                enricher,
                config,
            }),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn queue_depths(&self) -> QueueDepths {
        self.inner.queue.depths()
    }

    pub fn enqueue(&self, job: Job) -> bool {
        self.inner.queue.enqueue(job)
    }

    pub fn publish(&self, event: TrackEvent) {
        self.inner.events.publish(event);
    }

    pub fn is_audio(&self, path: &Path) -> bool {
        has_extension(path, &self.inner.config.extensions)
    }

    /// Walks every root and ingests what it finds. Without a floor this is a
    /// full pass, which also queues removal of rows whose file is gone.
    pub async fn scan(&self, modified_since: Option<SystemTime>) -> Result<ScanReport, LibraryError> {
        let roots = self.inner.config.roots.clone();
        let options = ScanOptions {
            extensions: self.inner.config.extensions.clone(),
            modified_since,
        };
        let paths =
            tokio::task::spawn_blocking(move || newest_first(scan_paths(&roots, &options).collect()))
                .await?;

        let files = paths.len();
        let (ingest, inserted) = self.ingest_collecting(paths).await?;
        let (missing, resumed) = match modified_since {
            Some(_) => (0, 0),
            None => (
                self.reconcile_missing().await?,
                self.resume_pending(&inserted).await?,
            ),
        };

        let report = ScanReport {
            files,
            ingest,
            missing,
            resumed,
        };
        info!(
            "Scan done: {} files, {} new, {} updated, {} moved, {} failed, {} missing, {} resumed",
            files, ingest.inserted, ingest.updated, ingest.moved, ingest.failed, missing, resumed
        );
        let mut event = TrackEvent::new(
            EventAction::LibraryScanned,
            EventLevel::Info,
            format!("Scanned {} files ({} new)", files, ingest.inserted),
        );
        event.payload = serde_json::to_value(report).ok();
        self.publish(event);
        Ok(report)
    }

    /// Extracts in parallel, then upserts each chunk in one transaction.
    /// Files that fail extraction are counted and never touch the catalog.
    pub async fn ingest_paths(&self, paths: Vec<PathBuf>) -> Result<IngestReport, LibraryError> {
        Ok(self.ingest_collecting(paths).await?.0)
    }

    /// Queues enrichment for every PENDING row not in `skip`. The queues live
    /// in memory, so rows whose jobs died with a previous process are only
    /// picked up here.
    pub async fn resume_pending(&self, skip: &[TrackId]) -> Result<usize, LibraryError> {
        let catalog = self.inner.catalog.clone();
        let pending = tokio::task::spawn_blocking(move || catalog.list_pending()).await??;
        let resumed = pending
            .iter()
            .filter(|track| !skip.contains(&track.id))
            .filter(|track| self.enqueue(Job::EnrichTrack { id: track.id }))
            .count();
        if resumed > 0 {
            info!("Requeued enrichment for {} pending tracks", resumed);
        }
        Ok(resumed)
    }

    async fn ingest_collecting(
        &self,
        paths: Vec<PathBuf>,
    ) -> Result<(IngestReport, Vec<TrackId>), LibraryError> {
        let mut report = IngestReport::default();
        let mut inserted = Vec::new();
        let batch_size = self.inner.config.batch_size.max(1);

        for chunk in paths.chunks(batch_size) {
            let records = self.extract_all(chunk.to_vec()).await;
            report.failed += chunk.len() - records.len();
            if records.is_empty() {
                continue;
            }
            let catalog = self.inner.catalog.clone();
            let outcome = tokio::task::spawn_blocking(move || catalog.upsert_batch(&records)).await??;
            self.apply_outcomes(&outcome, &mut report);
            inserted.extend(outcome.inserted_ids());
        }
        Ok((report, inserted))
    }

    /// Routes a watcher change into the job queue. Returns whether it was
    /// forwarded; modifications carrying our own write lease are dropped.
    pub fn handle_fs_change(&self, change: FsChange) -> bool {
        match change {
            FsChange::Created(path) => {
                self.is_audio(&path) && self.enqueue(Job::IngestFile { path })
            }
            FsChange::Modified(path) => {
                if !self.is_audio(&path) {
                    return false;
                }
                if self.inner.leases.consume(&path) {
                    debug!("Ignoring our own write to {:?}", path);
                    return false;
                }
                self.enqueue(Job::IngestFile { path })
            }
            FsChange::Removed(path) => {
                self.is_audio(&path) && self.enqueue(Job::RemoveFile { path })
            }
            FsChange::Renamed { from, to } => {
                if !self.is_audio(&from) && !self.is_audio(&to) {
                    return false;
                }
                self.enqueue(Job::MoveFile { from, to })
            }
        }
    }

    /// ERROR back to PENDING, then resubmit the job that failed.
    pub async fn requeue(&self, id: TrackId) -> Result<Job, LibraryError> {
        let catalog = self.inner.catalog.clone();
        let job = tokio::task::spawn_blocking(move || -> Result<Job, LibraryError> {
            let track = catalog.get_track(id)?.ok_or(LibraryError::TrackNotFound(id))?;
            let job = track
                .last_error
                .as_ref()
                .and_then(|error| Job::retry_for(&error.job, id))
                .unwrap_or(Job::EnrichTrack { id });
            catalog.requeue(id)?;
            Ok(job)
        })
        .await??;
        info!("Requeued track {} as {}", id, job.name());
        self.enqueue(job.clone());
        Ok(job)
    }

    pub async fn edit_track(
        &self,
        id: TrackId,
        title: Option<String>,
        artist: Option<String>,
    ) -> Result<Track, LibraryError> {
        let inner = Arc::clone(&self.inner);
        let (track, changes) = tokio::task::spawn_blocking(move || {
            let track = inner.catalog.get_track(id)?.ok_or(LibraryError::TrackNotFound(id))?;
            let new_title = title.clone().unwrap_or_else(|| track.title.clone());
            let new_artist = artist.clone().unwrap_or_else(|| track.artist.clone());
            inner.write_file_tags(&track, &new_title, &new_artist)?;
            inner.catalog.edit_track(id, title, artist)
        })
        .await??;
        if !changes.is_empty() {
            self.publish_track(EventAction::TrackUpdated, EventLevel::Info, "Track edited", &track);
        }
        Ok(track)
    }

    pub async fn rollback(&self, entry_id: u64) -> Result<Track, LibraryError> {
        let inner = Arc::clone(&self.inner);
        let track = tokio::task::spawn_blocking(move || {
            let entry = inner
                .catalog
                .history_entry(entry_id)?
                .ok_or(LibraryError::EntryNotFound(entry_id))?;
            let track = inner
                .catalog
                .get_track(entry.track_id)?
                .ok_or(LibraryError::TrackNotFound(entry.track_id))?;
            inner.write_file_tags(&track, &entry.snapshot.title, &entry.snapshot.artist)?;
            inner.catalog.rollback(entry_id).map(|(track, _)| track)
        })
        .await??;
        self.publish_track(
            EventAction::TrackUpdated,
            EventLevel::Info,
            "Track rolled back",
            &track,
        );
        Ok(track)
    }

    /// Removes the row, its covers and the file itself.
    pub async fn delete_track(&self, id: TrackId) -> Result<Option<Track>, LibraryError> {
        let catalog = self.inner.catalog.clone();
        let removed = tokio::task::spawn_blocking(move || catalog.delete_track(id)).await??;
        if let Some(track) = &removed {
            if let Err(err) = fs::remove_file(&track.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", track.path, err);
                }
            }
            self.forget(track);
        }
        Ok(removed)
    }

    pub async fn run_job(&self, job: Job) -> Result<(), LibraryError> {
        match job {
            Job::IngestFile { path } => {
                let report = self.ingest_paths(vec![path.clone()]).await?;
                if report.failed > 0 {
                    debug!("Could not read {:?}", path);
                }
            }
            Job::RemoveFile { path } => {
                self.remove_path(&path).await?;
            }
            Job::MoveFile { from, to } => {
                if self.is_audio(&to) && to.is_file() {
                    self.ingest_paths(vec![to]).await?;
                }
                // Only still catalogued when inode matching could not follow the file.
                self.remove_path(&from).await?;
            }
            Job::DeleteTrack { id } => {
                self.delete_track(id).await?;
            }
            Job::TrackAdded { id } => {
                let catalog = self.inner.catalog.clone();
                if let Some(track) = tokio::task::spawn_blocking(move || catalog.get_track(id)).await?? {
                    let message = format!("Added {}", track.file_name());
                    self.publish_track(EventAction::TrackAdded, EventLevel::Info, &message, &track);
                    self.enqueue(Job::EnrichTrack { id });
                }
            }
            Job::EnrichTrack { id } => self.enrich(id).await?,
        }
        Ok(())
    }

    /// A timed-out enrichment counts as a failed one.
    pub async fn handle_timeout(&self, job: Job, limit: Duration) {
        let id = match job {
            Job::EnrichTrack { id } => id,
            other => {
                warn!("{} job gave up after {:?}", other.name(), limit);
                return;
            }
        };
        let catalog = self.inner.catalog.clone();
        let error = LastError {
            at: now_secs(),
            job: ENRICH_TRACK.to_string(),
            message: format!("timed out after {}s", limit.as_secs()),
        };
        match tokio::task::spawn_blocking(move || catalog.mark_error(id, error)).await {
            Ok(Ok(track)) => {
                let message = format!("Processing {} timed out", track.file_name());
                self.publish_track(EventAction::TrackError, EventLevel::Error, &message, &track);
            }
            Ok(Err(err)) => debug!("Track {} not marked after timeout: {}", id, err),
            Err(err) => warn!("Timeout bookkeeping failed for track {}: {}", id, err),
        }
    }

    async fn enrich(&self, id: TrackId) -> Result<(), LibraryError> {
        let enricher = self.inner.enricher.clone();
        match tokio::task::spawn_blocking(move || enricher.enrich(id)).await?? {
            EnrichOutcome::Complete(track) => {
                let message = format!("Metadata ready for {}", track.file_name());
                self.publish_track(EventAction::TrackUpdated, EventLevel::Info, &message, &track);
            }
            EnrichOutcome::Failed(track) => {
                let reason = track
                    .last_error
                    .as_ref()
                    .map(|error| error.message.clone())
                    .unwrap_or_default();
                let message = format!("Processing {} failed: {}", track.file_name(), reason);
                self.publish_track(EventAction::TrackError, EventLevel::Error, &message, &track);
            }
            EnrichOutcome::Missing | EnrichOutcome::Skipped(_) => {}
        }
        Ok(())
    }

    async fn extract_all(&self, paths: Vec<PathBuf>) -> Vec<ExtractedTrack> {
        let parallelism = self.inner.config.extract_parallelism.max(1);
        stream::iter(paths.into_iter().map(|path| {
            let media = Arc::clone(&self.inner.media);
            tokio::task::spawn_blocking(move || extract(media.as_ref(), &path))
        }))
        .buffer_unordered(parallelism)
        .filter_map(|joined| async move {
            match joined {
                Ok(record) => record,
                Err(err) => {
                    warn!("Extraction task failed: {}", err);
                    None
                }
            }
        })
        .collect()
        .await
    }

    fn apply_outcomes(&self, batch: &BatchOutcome, report: &mut IngestReport) {
        for outcome in &batch.outcomes {
            match outcome {
                UpsertOutcome::Inserted(track) => {
                    report.inserted += 1;
                    self.enqueue(Job::TrackAdded { id: track.id });
                }
                UpsertOutcome::Updated { track, .. } => {
                    report.updated += 1;
                    let message = format!("Tags changed on {}", track.file_name());
                    self.publish_track(EventAction::TrackUpdated, EventLevel::Info, &message, track);
                }
                UpsertOutcome::Moved {
                    track,
                    from,
                    replaced,
                } => {
                    report.moved += 1;
                    if let Some(stale) = replaced {
                        self.forget(stale);
                    }
                    let message = format!("Moved from {}", from);
                    self.publish_track(EventAction::TrackMoved, EventLevel::Info, &message, track);
                }
                UpsertOutcome::Unchanged(_) => report.unchanged += 1,
            }
        }
    }

    async fn reconcile_missing(&self) -> Result<usize, LibraryError> {
        let catalog = self.inner.catalog.clone();
        let roots: Vec<PathBuf> = self
            .inner
            .config
            .roots
            .iter()
            .filter(|root| root.is_dir())
            .cloned()
            .collect();
        let missing = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>, LibraryError> {
            Ok(catalog
                .list_tracks()?
                .into_iter()
                .map(|track| PathBuf::from(track.path))
                .filter(|path| roots.iter().any(|root| path.starts_with(root)) && !path.exists())
                .collect())
        })
        .await??;

        for path in &missing {
            self.enqueue(Job::RemoveFile { path: path.clone() });
        }
        Ok(missing.len())
    }

    async fn remove_path(&self, path: &Path) -> Result<Option<Track>, LibraryError> {
        let path = absolute_path(path);
        if path.is_file() {
            debug!("{:?} exists again; refreshing instead of removing", path);
            self.ingest_paths(vec![path]).await?;
            return Ok(None);
        }
        let key = path.to_string_lossy().to_string();
        let catalog = self.inner.catalog.clone();
        let lookup = key.clone();
        let tracked = tokio::task::spawn_blocking(move || catalog.find_by_path(&lookup)).await??;
        let Some(track) = tracked else {
            return Ok(None);
        };

        if let Some(inode) = track.inode {
            let extensions = self.inner.config.extensions.clone();
            let old = path.clone();
            let relocated =
                tokio::task::spawn_blocking(move || find_relocated(&old, inode, &extensions)).await?;
            if let Some(new_path) = relocated {
                debug!("{:?} reappeared as {:?}; following the move", path, new_path);
                self.ingest_paths(vec![new_path]).await?;
                return Ok(None);
            }
        }

        let catalog = self.inner.catalog.clone();
        let removed = tokio::task::spawn_blocking(move || catalog.delete_by_path(&key)).await??;
        if let Some(track) = &removed {
            self.forget(track);
        }
        Ok(removed)
    }

    fn forget(&self, track: &Track) {
        let removed = remove_covers(&self.inner.config.covers_dir, track.id);
        debug!("Removed {} cover files for track {}", removed, track.id);
        let message = format!("Removed {}", track.file_name());
        self.publish_track(EventAction::TrackDeleted, EventLevel::Info, &message, track);
    }

    fn publish_track(&self, action: EventAction, level: EventLevel, message: &str, track: &Track) {
        self.publish(TrackEvent::for_track(action, level, message, track));
    }
}

/// Looks next to a vanished file for an audio file carrying its inode, which
/// is where a rename whose create half has not been seen yet will have put it.
fn find_relocated(old: &Path, inode: u64, extensions: &[String]) -> Option<PathBuf> {
    let dir = old.parent()?;
    fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|candidate| candidate != old && has_extension(candidate, extensions))
        .find(|candidate| path_inode(candidate) == Some(inode))
}

impl Inner {
    /// Writes tags under a lease and keeps the file's timestamps.
    fn write_file_tags(&self, track: &Track, title: &str, artist: &str) -> Result<(), LibraryError> {
        let path = Path::new(&track.path);
        if !path.is_file() {
            debug!("Track {} has no file; catalog-only edit", track.id);
            return Ok(());
        }
        let stat = fs::metadata(path)?;
        let accessed = stat.accessed()?;
        let modified = stat.modified()?;
        self.leases.acquire(path);
        self.media.write_tags(path, title, artist)?;
        restore_times(path, accessed, modified)
    }
}

impl JobHandler for Pipeline {
    fn bootstrap(&self, worker: usize) -> impl Future<Output = ()> + Send {
        let catalog = self.inner.catalog.clone();
        async move {
            match tokio::task::spawn_blocking(move || catalog.stats()).await {
                Ok(Ok(stats)) => debug!("Worker {} attached to catalog ({} tracks)", worker, stats.tracks),
                Ok(Err(err)) => warn!("Worker {} cannot read catalog: {}", worker, err),
                Err(err) => warn!("Worker {} bootstrap failed: {}", worker, err),
            }
        }
    }

    fn run(&self, job: Job) -> impl Future<Output = Result<(), LibraryError>> + Send {
        let pipeline = self.clone();
        async move { pipeline.run_job(job).await }
    }

    fn on_timeout(&self, job: Job, limit: Duration) -> impl Future<Output = ()> + Send {
        let pipeline = self.clone();
        async move { pipeline.handle_timeout(job, limit).await }
    }
}
