use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type TrackId = u64;

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const COVER_EXTENSIONS: &[&str] = &["jpg", "png", "webp", "gif"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackStatus {
    Pending,
    Complete,
    Error,
}

impl TrackStatus {
    /// Forward-only lifecycle; `Error -> Pending` is reserved for an explicit requeue.
    pub fn can_transition(self, to: TrackStatus) -> bool {
        matches!(
            (self, to),
            (TrackStatus::Pending, TrackStatus::Complete)
                | (TrackStatus::Pending, TrackStatus::Error)
                | (TrackStatus::Error, TrackStatus::Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackStatus::Pending => "PENDING",
            TrackStatus::Complete => "COMPLETE",
            TrackStatus::Error => "ERROR",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub at: u64,
    pub job: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub title: String,
    pub artist: String,
    pub duration_secs: u32,
    /// Duration last reported by the tag reader, before any probe refinement.
    #[serde(default)]
    pub scanned_duration_secs: u32,
    pub path: String,
    pub inode: Option<u64>,
    #[serde(default)]
    pub has_cover: bool,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub mtime: u64,
    pub status: TrackStatus,
    #[serde(default)]
    pub last_error: Option<LastError>,
}

impl Track {
    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            title: self.title.clone(),
            artist: self.artist.clone(),
            duration_secs: self.duration_secs,
            path: self.path.clone(),
        }
    }

    pub fn file_name(&self) -> String {
        Path::new(&self.path)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.clone())
    }
}

/// Public projection of a track, used for event payloads and HTTP responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackView {
    pub id: TrackId,
    pub title: String,
    pub artist: String,
    pub duration: u32,
    pub filename: String,
    pub has_cover: bool,
    pub status: TrackStatus,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
}

impl From<&Track> for TrackView {
    fn from(track: &Track) -> Self {
        Self {
            id: track.id,
            title: track.title.clone(),
            artist: track.artist.clone(),
            duration: track.duration_secs,
            filename: track.file_name(),
            has_cover: track.has_cover,
            status: track.status,
            updated_at: track.updated_at,
            last_error: track.last_error.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEvent {
    InitialScan,
    Edit,
    MetadataUpdate,
    MetadataFixup,
    Rollback,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange<T> {
    pub old: T,
    pub new: T,
}

impl<T: PartialEq> FieldChange<T> {
    pub fn between(old: T, new: T) -> Option<Self> {
        if old == new {
            None
        } else {
            Some(Self { old, new })
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<FieldChange<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<FieldChange<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<FieldChange<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_version: Option<FieldChange<String>>,
}

impl TrackChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.duration_secs.is_none()
            && self.tag_version.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub title: String,
    pub artist: String,
    pub duration_secs: u32,
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: u64,
    pub track_id: TrackId,
    pub event: HistoryEvent,
    pub filename: String,
    pub changes: Option<TrackChanges>,
    pub snapshot: TrackSnapshot,
    pub created_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    TrackAdded,
    TrackUpdated,
    TrackMoved,
    TrackDeleted,
    TrackError,
    LibraryScanned,
}

impl EventAction {
    pub fn as_str(self) -> &'static str {
        match self {
            EventAction::TrackAdded => "track_added",
            EventAction::TrackUpdated => "track_updated",
            EventAction::TrackMoved => "track_moved",
            EventAction::TrackDeleted => "track_deleted",
            EventAction::TrackError => "track_error",
            EventAction::LibraryScanned => "library_scanned",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackEvent {
    pub action: EventAction,
    pub message: String,
    pub level: EventLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl TrackEvent {
    pub fn new(action: EventAction, level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            action,
            message: message.into(),
            level,
            payload: None,
        }
    }

    pub fn for_track(action: EventAction, level: EventLevel, message: impl Into<String>, track: &Track) -> Self {
        let payload = serde_json::to_value(TrackView::from(track)).ok();
        Self {
            action,
            message: message.into(),
            level,
            payload,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoverSize {
    Original,
    Small,
}

impl CoverSize {
    pub fn suffix(self) -> &'static str {
        match self {
            CoverSize::Original => "original",
            CoverSize::Small => "small",
        }
    }
}

/// Readers rebuild cover paths from the track id alone, so this layout is fixed.
pub fn cover_file_name(track_id: TrackId, size: CoverSize, ext: &str) -> String {
    format!("{}_{}.{}", track_id, size.suffix(), ext)
}

pub fn find_cover(covers_dir: &Path, track_id: TrackId, size: CoverSize) -> Option<PathBuf> {
    COVER_EXTENSIONS
        .iter()
        .map(|ext| covers_dir.join(cover_file_name(track_id, size, ext)))
        .find(|path| path.is_file())
}

pub fn remove_covers(covers_dir: &Path, track_id: TrackId) -> usize {
    let mut removed = 0;
    for size in [CoverSize::Original, CoverSize::Small] {
        for ext in COVER_EXTENSIONS {
            let path = covers_dir.join(cover_file_name(track_id, size, ext));
            if fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
    }
    removed
}

pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown Track".to_string())
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

pub fn system_time_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_forward_only() {
        assert!(TrackStatus::Pending.can_transition(TrackStatus::Complete));
        assert!(TrackStatus::Pending.can_transition(TrackStatus::Error));
        assert!(TrackStatus::Error.can_transition(TrackStatus::Pending));
        assert!(!TrackStatus::Complete.can_transition(TrackStatus::Pending));
        assert!(!TrackStatus::Complete.can_transition(TrackStatus::Error));
        assert!(!TrackStatus::Error.can_transition(TrackStatus::Complete));
        assert!(!TrackStatus::Pending.can_transition(TrackStatus::Pending));
    }

    #[test]
    fn cover_names_follow_track_id() {
        assert_eq!(cover_file_name(42, CoverSize::Original, "jpg"), "42_original.jpg");
        assert_eq!(cover_file_name(42, CoverSize::Small, "png"), "42_small.png");
    }

    #[test]
    fn action_names_match_wire_format() {
        for action in [
            EventAction::TrackAdded,
            EventAction::TrackMoved,
            EventAction::TrackError,
            EventAction::LibraryScanned,
        ] {
            assert_eq!(serde_json::to_value(action).unwrap(), action.as_str());
        }
    }

    #[test]
    fn find_and_remove_covers() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("7_small.png"), b"x").unwrap();
        fs::write(dir.path().join("7_original.png"), b"x").unwrap();
        assert_eq!(
            find_cover(dir.path(), 7, CoverSize::Small),
            Some(dir.path().join("7_small.png"))
        );
        assert_eq!(find_cover(dir.path(), 8, CoverSize::Small), None);
        assert_eq!(remove_covers(dir.path(), 7), 2);
        assert_eq!(find_cover(dir.path(), 7, CoverSize::Original), None);
    }

    #[test]
    fn changes_skip_unchanged_fields() {
        let changes = TrackChanges {
            title: FieldChange::between("Old".to_string(), "New".to_string()),
            artist: FieldChange::between("Same".to_string(), "Same".to_string()),
            ..TrackChanges::default()
        };
        let value = serde_json::to_value(&changes).unwrap();
        assert_eq!(value["title"]["old"], "Old");
        assert_eq!(value["title"]["new"], "New");
        assert!(value.get("artist").is_none());
    }

    #[test]
    fn status_serializes_upper_case() {
        let value = serde_json::to_value(TrackStatus::Pending).unwrap();
        assert_eq!(value, "PENDING");
    }
}
