use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{
    now_secs, FieldChange, HistoryEntry, HistoryEvent, LastError, Track, TrackChanges, TrackId,
    TrackStatus,
};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::extract::ExtractedTrack;
use crate::history;
use crate::identity::{diff_fields, resolve, Resolution};
use crate::LibraryError;

pub(crate) const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");
const TRACKS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("tracks");
const TRACK_PATHS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("track_paths");
const TRACK_INODES_TABLE: TableDefinition<u64, u64> = TableDefinition::new("track_inodes");

const NEXT_TRACK_KEY: &str = "next_track_id";

pub const DEFAULT_HISTORY_KEEP: usize = 5;

#[derive(Clone, Debug)]
pub enum UpsertOutcome {
    Inserted(Track),
    Updated {
        track: Track,
        changes: TrackChanges,
    },
    Moved {
        track: Track,
        from: String,
        replaced: Option<Track>,
    },
    Unchanged(TrackId),
}

impl UpsertOutcome {
    pub fn track_id(&self) -> TrackId {
        match self {
            UpsertOutcome::Inserted(track) => track.id,
            UpsertOutcome::Updated { track, .. } => track.id,
            UpsertOutcome::Moved { track, .. } => track.id,
            UpsertOutcome::Unchanged(id) => *id,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BatchOutcome {
    pub outcomes: Vec<UpsertOutcome>,
}

impl BatchOutcome {
    /// Ids that became visible in this batch, in batch order.
    pub fn inserted_ids(&self) -> Vec<TrackId> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                UpsertOutcome::Inserted(track) => Some(track.id),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pick: fn(&UpsertOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|outcome| pick(outcome)).count()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub tracks: usize,
    pub pending: usize,
    pub complete: usize,
    pub errored: usize,
    pub history_entries: usize,
}

#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
    history_keep: usize,
}

impl Catalog {
    pub fn open(path: &Path, history_keep: usize) -> Result<Self, LibraryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let db = if path.exists() {
            Database::open(path)?
        } else {
            Database::create(path)?
        };

        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(META_TABLE)?;
            write_txn.open_table(TRACKS_TABLE)?;
            write_txn.open_table(TRACK_PATHS_TABLE)?;
            write_txn.open_table(TRACK_INODES_TABLE)?;
        }
        history::create_tables(&write_txn)?;
        write_txn.commit()?;

        info!("Opened catalog at {:?}", path);
        Ok(Self {
            db: Arc::new(db),
            history_keep: history_keep.max(1),
        })
    }

    pub fn history_keep(&self) -> usize {
        self.history_keep
    }

    pub fn get_track(&self, id: TrackId) -> Result<Option<Track>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let tracks = read_txn.open_table(TRACKS_TABLE)?;
        read_track(&tracks, id)
    }

    pub fn find_by_path(&self, path: &str) -> Result<Option<Track>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let paths = read_txn.open_table(TRACK_PATHS_TABLE)?;
        let tracks = read_txn.open_table(TRACKS_TABLE)?;
        let id = paths.get(path)?.map(|value| value.value());
        match id {
            Some(id) => read_track(&tracks, id),
            None => Ok(None),
        }
    }

    pub fn upsert(&self, record: &ExtractedTrack) -> Result<UpsertOutcome, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let outcome = upsert_in(&write_txn, record, self.history_keep)?;
        write_txn.commit()?;
        Ok(outcome)
    }

    /// All records land in one transaction: either every row is visible or none.
    pub fn upsert_batch(&self, records: &[ExtractedTrack]) -> Result<BatchOutcome, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(upsert_in(&write_txn, record, self.history_keep)?);
        }
        write_txn.commit()?;
        Ok(BatchOutcome { outcomes })
    }

    pub fn mark_complete(&self, id: TrackId) -> Result<Track, LibraryError> {
        self.transition(id, TrackStatus::Complete, |track| track.last_error = None)
    }

    pub fn mark_error(&self, id: TrackId, error: LastError) -> Result<Track, LibraryError> {
        self.transition(id, TrackStatus::Error, move |track| track.last_error = Some(error))
    }

    /// Operator retry: the only way out of ERROR.
    pub fn requeue(&self, id: TrackId) -> Result<Track, LibraryError> {
        self.transition(id, TrackStatus::Pending, |_| {})
    }

    pub fn set_cover(&self, id: TrackId, has_cover: bool) -> Result<Track, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let track = {
            let mut tracks = write_txn.open_table(TRACKS_TABLE)?;
            let mut track = read_track(&tracks, id)?.ok_or(LibraryError::TrackNotFound(id))?;
            if track.has_cover != has_cover {
                track.has_cover = has_cover;
                track.updated_at = now_secs();
                tracks.insert(id, encode_value(&track)?.as_slice())?;
            }
            track
        };
        write_txn.commit()?;
        Ok(track)
    }

    /// Replaces the fast duration estimate with a probed one and logs a fixup.
    pub fn refine_duration(&self, id: TrackId, duration_secs: u32) -> Result<Option<Track>, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut tracks = write_txn.open_table(TRACKS_TABLE)?;
            let mut track = read_track(&tracks, id)?.ok_or(LibraryError::TrackNotFound(id))?;
            match FieldChange::between(track.duration_secs, duration_secs) {
                Some(change) => {
                    track.duration_secs = duration_secs;
                    track.updated_at = now_secs();
                    tracks.insert(id, encode_value(&track)?.as_slice())?;
                    Some((track, change))
                }
                None => None,
            }
        };
        let track = match updated {
            Some((track, change)) => {
                let changes = TrackChanges {
                    duration_secs: Some(change),
                    ..TrackChanges::default()
                };
                history::append(&write_txn, &track, HistoryEvent::MetadataFixup, Some(changes))?;
                history::prune(&write_txn, id, self.history_keep)?;
                Some(track)
            }
            None => None,
        };
        write_txn.commit()?;
        Ok(track)
    }

    pub fn record_fixup(&self, id: TrackId, changes: TrackChanges) -> Result<HistoryEntry, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let track = {
            let tracks = write_txn.open_table(TRACKS_TABLE)?;
            read_track(&tracks, id)?.ok_or(LibraryError::TrackNotFound(id))?
        };
        let entry = history::append(&write_txn, &track, HistoryEvent::MetadataFixup, Some(changes))?;
        history::prune(&write_txn, id, self.history_keep)?;
        write_txn.commit()?;
        Ok(entry)
    }

    pub fn edit_track(
        &self,
        id: TrackId,
        title: Option<String>,
        artist: Option<String>,
    ) -> Result<(Track, TrackChanges), LibraryError> {
        let write_txn = self.db.begin_write()?;
        let (track, changes) = {
            let mut tracks = write_txn.open_table(TRACKS_TABLE)?;
            let mut track = read_track(&tracks, id)?.ok_or(LibraryError::TrackNotFound(id))?;
            let changes = TrackChanges {
                title: title.and_then(|title| FieldChange::between(track.title.clone(), title)),
                artist: artist.and_then(|artist| FieldChange::between(track.artist.clone(), artist)),
                ..TrackChanges::default()
            };
            if !changes.is_empty() {
                apply_changes(&mut track, &changes);
                track.updated_at = now_secs();
                tracks.insert(id, encode_value(&track)?.as_slice())?;
            }
            (track, changes)
        };
        if !changes.is_empty() {
            history::append(&write_txn, &track, HistoryEvent::Edit, Some(changes.clone()))?;
            history::prune(&write_txn, id, self.history_keep)?;
        }
        write_txn.commit()?;
        Ok((track, changes))
    }

    pub fn history_entry(&self, entry_id: u64) -> Result<Option<HistoryEntry>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        history::read_entry(&read_txn, entry_id)
    }

    /// Restores the snapshot of one history entry onto the live row.
    pub fn rollback(&self, entry_id: u64) -> Result<(Track, TrackChanges), LibraryError> {
        let write_txn = self.db.begin_write()?;
        let entry = history::read_entry_in(&write_txn, entry_id)?
            .ok_or(LibraryError::EntryNotFound(entry_id))?;
        let id = entry.track_id;
        let (track, changes) = {
            let mut tracks = write_txn.open_table(TRACKS_TABLE)?;
            let mut track = read_track(&tracks, id)?.ok_or(LibraryError::TrackNotFound(id))?;
            let snapshot = entry.snapshot;
            let changes = TrackChanges {
                title: FieldChange::between(track.title.clone(), snapshot.title),
                artist: FieldChange::between(track.artist.clone(), snapshot.artist),
                duration_secs: FieldChange::between(track.duration_secs, snapshot.duration_secs),
                tag_version: None,
            };
            if !changes.is_empty() {
                apply_changes(&mut track, &changes);
                track.updated_at = now_secs();
                tracks.insert(id, encode_value(&track)?.as_slice())?;
            }
            (track, changes)
        };
        history::append(&write_txn, &track, HistoryEvent::Rollback, Some(changes.clone()))?;
        history::prune(&write_txn, id, self.history_keep)?;
        write_txn.commit()?;
        Ok((track, changes))
    }

    /// Drops the row together with its indexes and history.
    pub fn delete_track(&self, id: TrackId) -> Result<Option<Track>, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let removed = remove_track_in(&write_txn, id)?;
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn delete_by_path(&self, path: &str) -> Result<Option<Track>, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let id = {
            let paths = write_txn.open_table(TRACK_PATHS_TABLE)?;
            let id = paths.get(path)?.map(|value| value.value());
            id
        };
        let removed = match id {
            Some(id) => remove_track_in(&write_txn, id)?,
            None => None,
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn list_tracks(&self) -> Result<Vec<Track>, LibraryError> {
        self.collect_tracks(|_| true)
    }

    pub fn list_errored(&self) -> Result<Vec<Track>, LibraryError> {
        self.collect_tracks(|track| track.status == TrackStatus::Error)
    }

    pub fn list_pending(&self) -> Result<Vec<Track>, LibraryError> {
        self.collect_tracks(|track| track.status == TrackStatus::Pending)
    }

    pub fn history_for(&self, id: TrackId) -> Result<Vec<HistoryEntry>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        history::list_for(&read_txn, id)
    }

    pub fn prune_history(&self, id: TrackId, keep: usize) -> Result<usize, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let removed = history::prune(&write_txn, id, keep)?;
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CatalogStats, LibraryError> {
        let mut stats = CatalogStats::default();
        for track in self.list_tracks()? {
            stats.tracks += 1;
            match track.status {
                TrackStatus::Pending => stats.pending += 1,
                TrackStatus::Complete => stats.complete += 1,
                TrackStatus::Error => stats.errored += 1,
            }
        }
        let read_txn = self.db.begin_read()?;
        stats.history_entries = history::count(&read_txn)?;
        Ok(stats)
    }

    fn collect_tracks(&self, keep: impl Fn(&Track) -> bool) -> Result<Vec<Track>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let tracks = read_txn.open_table(TRACKS_TABLE)?;
        let mut items = Vec::new();
        for entry in tracks.iter()? {
            let entry = entry?;
            let track: Track = decode_value(entry.1.value())?;
            if keep(&track) {
                items.push(track);
            }
        }
        Ok(items)
    }

    fn transition(
        &self,
        id: TrackId,
        to: TrackStatus,
        update: impl FnOnce(&mut Track),
    ) -> Result<Track, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let track = {
            let mut tracks = write_txn.open_table(TRACKS_TABLE)?;
            let mut track = read_track(&tracks, id)?.ok_or(LibraryError::TrackNotFound(id))?;
            if !track.status.can_transition(to) {
                return Err(LibraryError::InvalidTransition {
                    id,
                    current: track.status,
                    requested: to,
                });
            }
            track.status = to;
            update(&mut track);
            track.updated_at = now_secs();
            tracks.insert(id, encode_value(&track)?.as_slice())?;
            track
        };
        write_txn.commit()?;
        debug!("Track {} is now {}", id, to.as_str());
        Ok(track)
    }
}

fn upsert_in(
    txn: &WriteTransaction,
    record: &ExtractedTrack,
    history_keep: usize,
) -> Result<UpsertOutcome, LibraryError> {
    let (by_inode, by_path) = {
        let tracks = txn.open_table(TRACKS_TABLE)?;
        let paths = txn.open_table(TRACK_PATHS_TABLE)?;
        let inodes = txn.open_table(TRACK_INODES_TABLE)?;
        let inode_id = match record.inode {
            Some(inode) => inodes.get(inode)?.map(|value| value.value()),
            None => None,
        };
        let path_id = paths.get(record.path.as_str())?.map(|value| value.value());
        let by_inode = match inode_id {
            Some(id) => read_track(&tracks, id)?,
            None => None,
        };
        let by_path = match path_id {
            Some(id) => read_track(&tracks, id)?,
            None => None,
        };
        (by_inode, by_path)
    };

    match resolve(by_inode, by_path, &record.path, |path| Path::new(path).exists()) {
        Resolution::Move { track, displaced } => apply_move(txn, track, displaced, record),
        Resolution::Update(track) => apply_update(txn, track, record, history_keep),
        Resolution::Insert => apply_insert(txn, record),
    }
}

fn apply_move(
    txn: &WriteTransaction,
    mut track: Track,
    displaced: Option<Track>,
    record: &ExtractedTrack,
) -> Result<UpsertOutcome, LibraryError> {
    let replaced = match displaced {
        Some(stale) => {
            debug!("Dropping stale track {} at {}", stale.id, stale.path);
            remove_track_in(txn, stale.id)?
        }
        None => None,
    };

    let from = track.path.clone();
    {
        let mut tracks = txn.open_table(TRACKS_TABLE)?;
        let mut paths = txn.open_table(TRACK_PATHS_TABLE)?;
        paths.remove(from.as_str())?;
        track.path = record.path.clone();
        track.mtime = record.mtime;
        track.updated_at = now_secs();
        paths.insert(track.path.as_str(), track.id)?;
        tracks.insert(track.id, encode_value(&track)?.as_slice())?;
    }
    debug!("Track {} moved from {} to {}", track.id, from, track.path);
    Ok(UpsertOutcome::Moved {
        track,
        from,
        replaced,
    })
}

fn apply_update(
    txn: &WriteTransaction,
    mut track: Track,
    record: &ExtractedTrack,
    history_keep: usize,
) -> Result<UpsertOutcome, LibraryError> {
    let changes = diff_fields(&track, record);
    let claimed = match record.inode {
        Some(inode) => claimable_inode(txn, inode, Some(track.id))?,
        None => None,
    };
    let inode_changed = record.inode.is_some() && claimed != track.inode;
    if changes.is_empty() && !inode_changed && track.mtime == record.mtime {
        return Ok(UpsertOutcome::Unchanged(track.id));
    }

    {
        let mut tracks = txn.open_table(TRACKS_TABLE)?;
        if inode_changed {
            let mut inodes = txn.open_table(TRACK_INODES_TABLE)?;
            if let Some(old) = track.inode {
                let owner = inodes.get(old)?.map(|value| value.value());
                if owner == Some(track.id) {
                    inodes.remove(old)?;
                }
            }
            if let Some(new) = claimed {
                inodes.insert(new, track.id)?;
            }
            track.inode = claimed;
        }
        track.mtime = record.mtime;
        if !changes.is_empty() {
            apply_changes(&mut track, &changes);
            track.scanned_duration_secs = record.duration_secs;
            track.updated_at = now_secs();
        }
        tracks.insert(track.id, encode_value(&track)?.as_slice())?;
    }

    if changes.is_empty() {
        return Ok(UpsertOutcome::Unchanged(track.id));
    }
    history::append(txn, &track, HistoryEvent::MetadataUpdate, Some(changes.clone()))?;
    history::prune(txn, track.id, history_keep)?;
    Ok(UpsertOutcome::Updated { track, changes })
}

fn apply_insert(txn: &WriteTransaction, record: &ExtractedTrack) -> Result<UpsertOutcome, LibraryError> {
    let id = next_sequence(txn, NEXT_TRACK_KEY)?;
    let inode = match record.inode {
        Some(inode) => claimable_inode(txn, inode, None)?,
        None => None,
    };
    let now = now_secs();
    let track = Track {
        id,
        title: record.title.clone(),
        artist: record.artist.clone(),
        duration_secs: record.duration_secs,
        scanned_duration_secs: record.duration_secs,
        path: record.path.clone(),
        inode,
        has_cover: false,
        created_at: now,
        updated_at: now,
        mtime: record.mtime,
        status: TrackStatus::Pending,
        last_error: None,
    };
    {
        let mut tracks = txn.open_table(TRACKS_TABLE)?;
        let mut paths = txn.open_table(TRACK_PATHS_TABLE)?;
        let mut inodes = txn.open_table(TRACK_INODES_TABLE)?;
        tracks.insert(id, encode_value(&track)?.as_slice())?;
        paths.insert(track.path.as_str(), id)?;
        if let Some(inode) = track.inode {
            inodes.insert(inode, id)?;
        }
    }
    history::append(txn, &track, HistoryEvent::InitialScan, None)?;
    Ok(UpsertOutcome::Inserted(track))
}

/// `inode` if no other row owns it. A second link to an owned inode is
/// stored without one so rows never share an inode.
fn claimable_inode(
    txn: &WriteTransaction,
    inode: u64,
    claimant: Option<TrackId>,
) -> Result<Option<u64>, LibraryError> {
    let inodes = txn.open_table(TRACK_INODES_TABLE)?;
    let owner = inodes.get(inode)?.map(|value| value.value());
    Ok(match owner {
        Some(owner) if Some(owner) != claimant => None,
        _ => Some(inode),
    })
}

fn remove_track_in(txn: &WriteTransaction, id: TrackId) -> Result<Option<Track>, LibraryError> {
    let removed = {
        let mut tracks = txn.open_table(TRACKS_TABLE)?;
        let track = match read_track(&tracks, id)? {
            Some(track) => track,
            None => return Ok(None),
        };
        tracks.remove(id)?;
        let mut paths = txn.open_table(TRACK_PATHS_TABLE)?;
        let path_owner = paths.get(track.path.as_str())?.map(|value| value.value());
        if path_owner == Some(id) {
            paths.remove(track.path.as_str())?;
        }
        if let Some(inode) = track.inode {
            let mut inodes = txn.open_table(TRACK_INODES_TABLE)?;
            let inode_owner = inodes.get(inode)?.map(|value| value.value());
            if inode_owner == Some(id) {
                inodes.remove(inode)?;
            }
        }
        track
    };
    history::prune(txn, id, 0)?;
    Ok(Some(removed))
}

fn apply_changes(track: &mut Track, changes: &TrackChanges) {
    if let Some(change) = &changes.title {
        track.title = change.new.clone();
    }
    if let Some(change) = &changes.artist {
        track.artist = change.new.clone();
    }
    if let Some(change) = &changes.duration_secs {
        track.duration_secs = change.new;
    }
}

pub(crate) fn next_sequence(txn: &WriteTransaction, key: &str) -> Result<u64, LibraryError> {
    let mut meta = txn.open_table(META_TABLE)?;
    let next = meta.get(key)?.map(|value| value.value()).unwrap_or(1);
    meta.insert(key, next + 1)?;
    Ok(next)
}

fn read_track(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: TrackId,
) -> Result<Option<Track>, LibraryError> {
    match table.get(id)? {
        Some(value) => Ok(Some(decode_value(value.value())?)),
        None => Ok(None),
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::HistoryEvent;
    use tempfile::TempDir;

    fn open_catalog() -> (TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog.redb"), DEFAULT_HISTORY_KEEP).unwrap();
        (dir, catalog)
    }

    fn record(path: &str, title: &str, inode: u64) -> ExtractedTrack {
        ExtractedTrack {
            path: path.to_string(),
            title: title.to_string(),
            artist: "Test Artist".to_string(),
            duration_secs: 180,
            inode: Some(inode),
            mtime: 1_700_000_000,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let (_dir, catalog) = open_catalog();
        let first = catalog.upsert(&record("/music/a.mp3", "Song", 11)).unwrap();
        let second = catalog.upsert(&record("/music/a.mp3", "Song", 11)).unwrap();

        assert!(matches!(first, UpsertOutcome::Inserted(_)));
        assert!(matches!(second, UpsertOutcome::Unchanged(id) if id == first.track_id()));
        assert_eq!(catalog.list_tracks().unwrap().len(), 1);

        let history = catalog.history_for(first.track_id()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event, HistoryEvent::InitialScan);
        assert!(history[0].changes.is_none());
    }

    #[test]
    fn new_tracks_start_pending() {
        let (_dir, catalog) = open_catalog();
        let outcome = catalog.upsert(&record("/music/a.mp3", "Song", 11)).unwrap();
        let track = catalog.get_track(outcome.track_id()).unwrap().unwrap();
        assert_eq!(track.status, TrackStatus::Pending);
        assert_eq!(track.created_at, track.updated_at);
        assert!(track.last_error.is_none());
    }

    #[test]
    fn rename_keeps_metadata_and_history() {
        let (dir, catalog) = open_catalog();
        let old_path = dir.path().join("gone.mp3");
        let old = old_path.to_string_lossy().to_string();
        let inserted = catalog.upsert(&record(&old, "Song", 42)).unwrap();
        let id = inserted.track_id();

        let mut moved = record("/music/renamed.mp3", "Song", 42);
        moved.title = "Tag changed too".to_string();
        let outcome = catalog.upsert(&moved).unwrap();

        match outcome {
            UpsertOutcome::Moved { track, from, replaced } => {
                assert_eq!(track.id, id);
                assert_eq!(from, old);
                assert!(replaced.is_none());
                assert_eq!(track.title, "Song");
            }
            other => panic!("expected move, got {:?}", other),
        }
        assert!(catalog.find_by_path(&old).unwrap().is_none());
        let track = catalog.find_by_path("/music/renamed.mp3").unwrap().unwrap();
        assert_eq!(track.id, id);
        assert_eq!(track.artist, "Test Artist");
        assert_eq!(track.duration_secs, 180);
        assert_eq!(catalog.history_for(id).unwrap().len(), 1);
    }

    #[test]
    fn hardlink_is_not_a_move() {
        let (dir, catalog) = open_catalog();
        let existing = dir.path().join("still-here.mp3");
        std::fs::write(&existing, b"x").unwrap();
        let existing = existing.to_string_lossy().to_string();
        let first = catalog.upsert(&record(&existing, "Song", 7)).unwrap();

        let second = catalog.upsert(&record("/music/link.mp3", "Song", 7)).unwrap();
        assert!(matches!(second, UpsertOutcome::Inserted(_)));
        assert_ne!(first.track_id(), second.track_id());
        let linked = catalog.get_track(second.track_id()).unwrap().unwrap();
        assert_eq!(linked.inode, None);
        assert_eq!(catalog.list_tracks().unwrap().len(), 2);

        let again = catalog.upsert(&record("/music/link.mp3", "Song", 7)).unwrap();
        assert!(matches!(again, UpsertOutcome::Unchanged(_)));
    }

    #[test]
    fn rows_never_share_an_inode() {
        let (dir, catalog) = open_catalog();
        let kept = dir.path().join("kept.mp3");
        std::fs::write(&kept, b"x").unwrap();
        let kept = kept.to_string_lossy().to_string();
        let owner = catalog.upsert(&record(&kept, "Song", 7)).unwrap().track_id();
        let other = catalog.upsert(&record("/music/other.mp3", "Other", 8)).unwrap().track_id();

        // An in-place save that lands on the owned inode must not steal it.
        catalog.upsert(&record("/music/other.mp3", "Other", 7)).unwrap();
        let inodes: Vec<_> = catalog
            .list_tracks()
            .unwrap()
            .into_iter()
            .filter_map(|track| track.inode)
            .collect();
        assert_eq!(inodes, vec![7]);
        assert_eq!(catalog.get_track(owner).unwrap().unwrap().inode, Some(7));
        assert_eq!(catalog.get_track(other).unwrap().unwrap().inode, None);

        // Once the owner is gone the inode is free to claim.
        catalog.delete_track(owner).unwrap();
        catalog.upsert(&record("/music/other.mp3", "Other", 7)).unwrap();
        assert_eq!(catalog.get_track(other).unwrap().unwrap().inode, Some(7));
    }

    #[test]
    fn move_over_existing_row_drops_stale_occupant() {
        let (dir, catalog) = open_catalog();
        let source = dir.path().join("source.mp3").to_string_lossy().to_string();
        let target = "/music/target.mp3";
        let moving = catalog.upsert(&record(&source, "Moving", 1)).unwrap();
        let stale = catalog.upsert(&record(target, "Stale", 2)).unwrap();

        let outcome = catalog.upsert(&record(target, "Moving", 1)).unwrap();
        match outcome {
            UpsertOutcome::Moved { track, replaced, .. } => {
                assert_eq!(track.id, moving.track_id());
                assert_eq!(replaced.map(|track| track.id), Some(stale.track_id()));
            }
            other => panic!("expected move, got {:?}", other),
        }
        assert!(catalog.get_track(stale.track_id()).unwrap().is_none());
        assert!(catalog.history_for(stale.track_id()).unwrap().is_empty());
        assert_eq!(catalog.list_tracks().unwrap().len(), 1);
    }

    #[test]
    fn content_change_records_only_changed_fields() {
        let (_dir, catalog) = open_catalog();
        let id = catalog.upsert(&record("/music/a.mp3", "Old Title", 5)).unwrap().track_id();

        let outcome = catalog.upsert(&record("/music/a.mp3", "New Title", 5)).unwrap();
        let changes = match outcome {
            UpsertOutcome::Updated { changes, .. } => changes,
            other => panic!("expected update, got {:?}", other),
        };
        assert_eq!(changes.title.as_ref().map(|c| c.old.as_str()), Some("Old Title"));
        assert_eq!(changes.title.as_ref().map(|c| c.new.as_str()), Some("New Title"));
        assert!(changes.artist.is_none());
        assert!(changes.duration_secs.is_none());

        let history = catalog.history_for(id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event, HistoryEvent::MetadataUpdate);
        assert_eq!(history[0].snapshot.title, "New Title");
        let json = serde_json::to_value(&history[0].changes).unwrap();
        assert!(json.get("artist").is_none());
        assert_eq!(json["title"]["old"], "Old Title");
    }

    #[test]
    fn atomic_save_refreshes_inode_silently() {
        let (_dir, catalog) = open_catalog();
        let id = catalog.upsert(&record("/music/a.mp3", "Song", 5)).unwrap().track_id();
        let outcome = catalog.upsert(&record("/music/a.mp3", "Song", 6)).unwrap();
        assert!(matches!(outcome, UpsertOutcome::Unchanged(_)));

        let track = catalog.get_track(id).unwrap().unwrap();
        assert_eq!(track.inode, Some(6));
        assert_eq!(catalog.history_for(id).unwrap().len(), 1);

        let again = catalog.upsert(&record("/music/b.mp3", "Song", 6)).unwrap();
        assert!(matches!(again, UpsertOutcome::Moved { .. }));
    }

    #[test]
    fn history_is_pruned_to_newest_entries() {
        let (_dir, catalog) = open_catalog();
        let id = catalog.upsert(&record("/music/a.mp3", "Title 0", 9)).unwrap().track_id();
        for n in 1..=7 {
            catalog
                .upsert(&record("/music/a.mp3", &format!("Title {}", n), 9))
                .unwrap();
        }

        let history = catalog.history_for(id).unwrap();
        assert_eq!(history.len(), DEFAULT_HISTORY_KEEP);
        let titles: Vec<_> = history.iter().map(|entry| entry.snapshot.title.as_str()).collect();
        assert_eq!(titles, vec!["Title 7", "Title 6", "Title 5", "Title 4", "Title 3"]);
        assert!(history.windows(2).all(|pair| pair[0].id > pair[1].id));
    }

    #[test]
    fn batch_reports_newly_visible_ids() {
        let (_dir, catalog) = open_catalog();
        catalog.upsert(&record("/music/known.mp3", "Known", 1)).unwrap();

        let batch = vec![
            record("/music/known.mp3", "Known", 1),
            record("/music/new-1.mp3", "New 1", 2),
            record("/music/new-2.mp3", "New 2", 3),
        ];
        let outcome = catalog.upsert_batch(&batch).unwrap();
        assert_eq!(outcome.inserted_ids().len(), 2);
        assert_eq!(outcome.count(|o| matches!(o, UpsertOutcome::Unchanged(_))), 1);
        assert_eq!(catalog.list_tracks().unwrap().len(), 3);
    }

    #[test]
    fn status_only_moves_forward() {
        let (_dir, catalog) = open_catalog();
        let id = catalog.upsert(&record("/music/a.mp3", "Song", 1)).unwrap().track_id();

        let error = LastError {
            at: 1,
            job: "enrich_track".to_string(),
            message: "probe failed".to_string(),
        };
        let track = catalog.mark_error(id, error).unwrap();
        assert_eq!(track.status, TrackStatus::Error);
        assert_eq!(catalog.list_errored().unwrap().len(), 1);

        assert!(matches!(
            catalog.mark_complete(id),
            Err(LibraryError::InvalidTransition { .. })
        ));

        let track = catalog.requeue(id).unwrap();
        assert_eq!(track.status, TrackStatus::Pending);
        let track = catalog.mark_complete(id).unwrap();
        assert_eq!(track.status, TrackStatus::Complete);
        assert!(track.last_error.is_none());

        assert!(catalog.requeue(id).is_err());
        assert!(catalog.mark_error(id, LastError {
            at: 2,
            job: "enrich_track".to_string(),
            message: "late".to_string(),
        })
        .is_err());
    }

    #[test]
    fn edit_and_rollback_are_recorded() {
        let (_dir, catalog) = open_catalog();
        let id = catalog.upsert(&record("/music/a.mp3", "Original", 1)).unwrap().track_id();
        let initial = catalog.history_for(id).unwrap()[0].id;

        let (track, changes) = catalog
            .edit_track(id, Some("Edited".to_string()), Some("Test Artist".to_string()))
            .unwrap();
        assert_eq!(track.title, "Edited");
        assert!(changes.artist.is_none());

        let (track, changes) = catalog.rollback(initial).unwrap();
        assert_eq!(track.title, "Original");
        assert_eq!(changes.title.map(|c| c.old), Some("Edited".to_string()));

        let events: Vec<_> = catalog.history_for(id).unwrap().iter().map(|e| e.event).collect();
        assert_eq!(
            events,
            vec![HistoryEvent::Rollback, HistoryEvent::Edit, HistoryEvent::InitialScan]
        );
        assert!(matches!(catalog.rollback(9999), Err(LibraryError::EntryNotFound(9999))));
    }

    #[test]
    fn delete_cascades_to_history() {
        let (_dir, catalog) = open_catalog();
        let id = catalog.upsert(&record("/music/a.mp3", "Song", 1)).unwrap().track_id();
        let entry = catalog.history_for(id).unwrap()[0].id;

        let removed = catalog.delete_by_path("/music/a.mp3").unwrap();
        assert_eq!(removed.map(|track| track.id), Some(id));
        assert!(catalog.get_track(id).unwrap().is_none());
        assert!(catalog.history_entry(entry).unwrap().is_none());
        assert!(catalog.delete_track(id).unwrap().is_none());

        let reinserted = catalog.upsert(&record("/music/a.mp3", "Song", 1)).unwrap();
        assert!(matches!(reinserted, UpsertOutcome::Inserted(_)));
        assert_ne!(reinserted.track_id(), id);
    }

    #[test]
    fn refine_duration_logs_fixup() {
        let (_dir, catalog) = open_catalog();
        let id = catalog.upsert(&record("/music/a.mp3", "Song", 1)).unwrap().track_id();
        assert!(catalog.refine_duration(id, 180).unwrap().is_none());

        let track = catalog.refine_duration(id, 184).unwrap().unwrap();
        assert_eq!(track.duration_secs, 184);
        assert_eq!(track.scanned_duration_secs, 180);
        let history = catalog.history_for(id).unwrap();
        assert_eq!(history[0].event, HistoryEvent::MetadataFixup);

        let rescanned = catalog.upsert(&record("/music/a.mp3", "Song", 1)).unwrap();
        assert!(matches!(rescanned, UpsertOutcome::Unchanged(_)));
    }

    #[test]
    fn stats_count_statuses() {
        let (_dir, catalog) = open_catalog();
        let a = catalog.upsert(&record("/music/a.mp3", "A", 1)).unwrap().track_id();
        catalog.upsert(&record("/music/b.mp3", "B", 2)).unwrap();
        catalog.mark_complete(a).unwrap();

        let stats = catalog.stats().unwrap();
        assert_eq!(stats.tracks, 2);
        assert_eq!(stats.complete, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.history_entries, 2);
    }
}
