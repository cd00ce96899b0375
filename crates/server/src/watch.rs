use std::path::PathBuf;
use std::time::Duration;

use library::{FsChange, Pipeline};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::state::AppState;

pub fn configure_watcher(state: &AppState, root: PathBuf) {
    if !state.config.watch_music {
        info!("Watcher disabled (watch_music=false)");
        *state.watcher.write() = None;
        return;
    }

    let debounce = state.config.watch_debounce();
    match setup_watcher(state.pipeline.clone(), root.clone(), debounce) {
        Ok(watcher) => {
            info!(
                "Watching {} for changes (debounce {}ms)",
                root.display(),
                debounce.as_millis()
            );
            *state.watcher.write() = Some(watcher);
        }
        Err(err) => {
            warn!("Failed to start watcher: {}", err);
            *state.watcher.write() = None;
        }
    }
}

fn setup_watcher(
    pipeline: Pipeline,
    root: PathBuf,
    debounce: Duration,
) -> Result<RecommendedWatcher, notify::Error> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(err) => warn!("Watcher error: {}", err),
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(&root, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        watch_loop(pipeline, rx, debounce).await;
    });

    Ok(watcher)
}

/// Collects changes until the watcher has been quiet for `debounce`, then
/// hands the coalesced batch to the pipeline.
async fn watch_loop(pipeline: Pipeline, mut rx: UnboundedReceiver<Event>, debounce: Duration) {
    loop {
        let mut pending = match rx.recv().await {
            Some(event) => changes_from_event(&event),
            None => break,
        };

        let closed = loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => break false,
                maybe_event = rx.recv() => match maybe_event {
                    Some(event) => pending.extend(changes_from_event(&event)),
                    None => break true,
                }
            }
        };

        let changes = coalesce(pending);
        let forwarded = changes
            .into_iter()
            .filter(|change| pipeline.handle_fs_change(change.clone()))
            .count();
        if forwarded > 0 {
            debug!("Watcher queued {} jobs", forwarded);
        }
        if closed {
            break;
        }
    }
    debug!("Watcher loop finished");
}

fn changes_from_event(event: &Event) -> Vec<FsChange> {
    let paths = &event.paths;
    match &event.kind {
        EventKind::Create(_) => paths.iter().cloned().map(FsChange::Created).collect(),
        EventKind::Remove(_) => paths.iter().cloned().map(FsChange::Removed).collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(mode)) => match (mode, paths.as_slice()) {
            (RenameMode::Both, [from, to]) => vec![FsChange::Renamed {
                from: from.clone(),
                to: to.clone(),
            }],
            (RenameMode::From, _) => paths.iter().cloned().map(FsChange::Removed).collect(),
            (RenameMode::To, _) => paths.iter().cloned().map(FsChange::Created).collect(),
            // Platforms that cannot pair rename halves: decide by what is on disk now.
            _ => paths
                .iter()
                .map(|path| {
                    if path.exists() {
                        FsChange::Created(path.clone())
                    } else {
                        FsChange::Removed(path.clone())
                    }
                })
                .collect(),
        },
        EventKind::Modify(_) => paths.iter().cloned().map(FsChange::Modified).collect(),
        _ => Vec::new(),
    }
}

/// Folds one debounce window into the jobs worth running. A paired rename
/// absorbs the remove and create halves some backends also report, edits of
/// a file that just appeared are dropped, and removals go last so a move
/// that arrived as separate halves is seen by its create first.
fn coalesce(changes: Vec<FsChange>) -> Vec<FsChange> {
    let renames: Vec<(PathBuf, PathBuf)> = changes
        .iter()
        .filter_map(|change| match change {
            FsChange::Renamed { from, to } => Some((from.clone(), to.clone())),
            _ => None,
        })
        .collect();
    let appeared: Vec<PathBuf> = changes
        .iter()
        .filter_map(|change| match change {
            FsChange::Created(path) => Some(path.clone()),
            FsChange::Renamed { to, .. } => Some(to.clone()),
            _ => None,
        })
        .collect();

    let mut out: Vec<FsChange> = Vec::with_capacity(changes.len());
    for change in changes {
        let covered = match &change {
            FsChange::Removed(path) => renames.iter().any(|(from, _)| from == path),
            FsChange::Created(path) => renames.iter().any(|(_, to)| to == path),
            FsChange::Modified(path) => appeared.contains(path),
            FsChange::Renamed { .. } => false,
        };
        if !covered && !out.contains(&change) {
            out.push(change);
        }
    }
    out.sort_by_key(|change| matches!(change, FsChange::Removed(_)));
    out
}
