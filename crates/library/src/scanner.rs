use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::has_extension;

#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    /// Lower-case extensions without the dot; empty accepts every file.
    pub extensions: Vec<String>,
    /// Only files modified at or after this instant.
    pub modified_since: Option<SystemTime>,
}

/// Lazily walks every root. Missing roots and unreadable subtrees are
/// skipped; each call starts a fresh traversal.
pub fn scan_paths(roots: &[PathBuf], options: &ScanOptions) -> impl Iterator<Item = PathBuf> + Send {
    let roots: Vec<PathBuf> = roots.to_vec();
    let options = options.clone();

    roots
        .into_iter()
        .filter(|root| {
            if root.is_dir() {
                true
            } else {
                debug!("Scan root {:?} does not exist", root);
                false
            }
        })
        .flat_map(|root| WalkDir::new(root).follow_links(true).into_iter())
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("Skipping unreadable entry: {}", err);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(move |entry| {
            if !options.extensions.is_empty() && !has_extension(entry.path(), &options.extensions) {
                return false;
            }
            match options.modified_since {
                Some(floor) => entry
                    .metadata()
                    .ok()
                    .and_then(|meta| meta.modified().ok())
                    .map(|modified| modified >= floor)
                    .unwrap_or(false),
                None => true,
            }
        })
        .map(|entry| entry.into_path())
}

pub fn newest_first(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut stamped: Vec<(SystemTime, PathBuf)> = paths
        .into_iter()
        .map(|path| {
            let modified = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .collect();
    stamped.sort_by(|a, b| b.0.cmp(&a.0));
    stamped.into_iter().map(|(_, path)| path).collect()
}
