use std::path::PathBuf;
use std::time::SystemTime;

use library::{PeriodicRescan, Pipeline};
use tracing::{info, warn};

use crate::state::AppState;
use crate::watch::configure_watcher;

/// Starts watching `root`, kicks off a full scan in the background and
/// returns the periodic rescan loop when one is configured.
pub fn start_index(state: &AppState, root: PathBuf) -> Option<PeriodicRescan> {
    configure_watcher(state, root);

    let started = SystemTime::now();
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        run_scan(pipeline, None, "Initial").await;
    });

    let interval = state.config.rescan_interval()?;
    let pipeline = state.pipeline.clone();
    Some(PeriodicRescan::start(interval, Some(started), move |floor| {
        let pipeline = pipeline.clone();
        async move {
            run_scan(pipeline, floor, "Periodic").await;
        }
    }))
}

pub async fn run_scan(pipeline: Pipeline, modified_since: Option<SystemTime>, label: &str) {
    info!("{} scan started", label);
    match pipeline.scan(modified_since).await {
        Ok(report) => info!(
            "{} scan complete: {} files, {} new, {} failed, {} pending requeued",
            label, report.files, report.ingest.inserted, report.ingest.failed, report.resumed
        ),
        Err(err) => warn!("{} scan failed: {}", label, err),
    }
}
