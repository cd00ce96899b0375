use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use common::TrackEvent;
use library::{
    Catalog, EventSink, HttpEventSink, ImageCovers, JobQueue, LocalMedia, Pipeline, PipelineConfig,
    PipelineParts, WriteLeases, DEFAULT_HISTORY_KEEP, DEFAULT_LEASE_TTL,
};
use parking_lot::Mutex;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Holds events until the run is over so none are lost when the process exits.
#[derive(Default)]
struct Outbox {
    events: Mutex<Vec<TrackEvent>>,
}

impl EventSink for Outbox {
    fn publish(&self, event: TrackEvent) {
        self.events.lock().push(event);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    let music_root = args
        .next()
        .or_else(|| env::var("MUSIC_ROOT").ok())
        .ok_or("MUSIC_ROOT not set and no path argument")?;
    let index_path = args
        .next()
        .or_else(|| env::var("INDEX_PATH").ok())
        .unwrap_or_else(|| "data/catalog.redb".to_string());
    let covers_path = env::var("COVERS_PATH").unwrap_or_else(|_| "data/covers".to_string());
    let enrich = matches!(env::var("ENRICH").as_deref(), Ok("1") | Ok("true"));

    let index_path = PathBuf::from(index_path);
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let covers_dir = library::absolute_path(&PathBuf::from(covers_path));

    let outbox = Arc::new(Outbox::default());
    let (queue, mut jobs) = JobQueue::new();
    let pipeline = Pipeline::new(PipelineParts {
        catalog: Catalog::open(&index_path, DEFAULT_HISTORY_KEEP)?,
        media: Arc::new(LocalMedia),
        covers: Arc::new(ImageCovers::new(covers_dir.clone(), 300)),
        leases: WriteLeases::in_memory(DEFAULT_LEASE_TTL),
        queue,
        events: outbox.clone(),
        config: PipelineConfig {
            roots: vec![PathBuf::from(&music_root)],
            covers_dir,
            ..PipelineConfig::default()
        },
    });

    let report = pipeline.scan(None).await?;
    println!(
        "Scanned {} files: {} new, {} updated, {} moved, {} unchanged, {} failed, {} missing, {} resumed",
        report.files,
        report.ingest.inserted,
        report.ingest.updated,
        report.ingest.moved,
        report.ingest.unchanged,
        report.ingest.failed,
        report.missing,
        report.resumed
    );

    // Without ENRICH only removals run here; new tracks stay PENDING for the server.
    while let Some(job) = jobs.try_next() {
        if !enrich && job.track_id().is_some() {
            continue;
        }
        if let Err(err) = pipeline.run_job(job.clone()).await {
            warn!("{} failed: {}", job.name(), err);
        }
    }

    let stats = pipeline.catalog().stats()?;
    println!(
        "Catalog: {} tracks ({} pending, {} complete, {} errored)",
        stats.tracks, stats.pending, stats.complete, stats.errored
    );

    let events = std::mem::take(&mut *outbox.events.lock());
    if let Ok(url) = env::var("EVENTS_URL") {
        let sink = HttpEventSink::new(url)?;
        for event in &events {
            if let Err(err) = sink.send(event).await {
                warn!("Failed to publish event: {}", err);
            }
        }
    }

    Ok(())
}
