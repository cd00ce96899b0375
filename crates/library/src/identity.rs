use common::{FieldChange, Track, TrackChanges};

use crate::extract::ExtractedTrack;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Insert,
    Update(Track),
    /// Same content under a new path. `displaced` is a different row that
    /// still claims the destination path.
    Move {
        track: Track,
        displaced: Option<Track>,
    },
}

/// Decides what an incoming record means for the catalog.
///
/// The inode match wins over the path match, but only when the previous
/// path is gone: a second link to the same inode is a separate file.
pub fn resolve(
    by_inode: Option<Track>,
    by_path: Option<Track>,
    incoming_path: &str,
    still_exists: impl Fn(&str) -> bool,
) -> Resolution {
    if let Some(track) = by_inode {
        if track.path == incoming_path {
            return Resolution::Update(track);
        }
        if !still_exists(&track.path) {
            let displaced = by_path.filter(|other| other.id != track.id);
            return Resolution::Move { track, displaced };
        }
    }
    match by_path {
        Some(track) => Resolution::Update(track),
        None => Resolution::Insert,
    }
}

/// Field-level diff of tag data. Duration is compared against the last
/// scanned value so a probe refinement is not undone by the next rescan.
pub fn diff_fields(track: &Track, record: &ExtractedTrack) -> TrackChanges {
    let duration_secs = if record.duration_secs != track.scanned_duration_secs {
        FieldChange::between(track.duration_secs, record.duration_secs)
    } else {
        None
    };
    TrackChanges {
        title: FieldChange::between(track.title.clone(), record.title.clone()),
        artist: FieldChange::between(track.artist.clone(), record.artist.clone()),
        duration_secs,
        tag_version: None,
    }
}
