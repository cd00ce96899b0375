use common::{now_secs, HistoryEntry, HistoryEvent, Track, TrackChanges, TrackId};
use redb::{ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};

use crate::catalog::next_sequence;
use crate::LibraryError;

// Keyed by (track id, entry id) so a range scan yields one track's log in order.
const HISTORY_TABLE: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("history");
const HISTORY_OWNERS_TABLE: TableDefinition<u64, u64> = TableDefinition::new("history_owners");

const NEXT_ENTRY_KEY: &str = "next_history_id";

pub(crate) fn create_tables(txn: &WriteTransaction) -> Result<(), LibraryError> {
    txn.open_table(HISTORY_TABLE)?;
    txn.open_table(HISTORY_OWNERS_TABLE)?;
    Ok(())
}

pub(crate) fn append(
    txn: &WriteTransaction,
    track: &Track,
    event: HistoryEvent,
    changes: Option<TrackChanges>,
) -> Result<HistoryEntry, LibraryError> {
    let id = next_sequence(txn, NEXT_ENTRY_KEY)?;
    let entry = HistoryEntry {
        id,
        track_id: track.id,
        event,
        filename: track.file_name(),
        changes,
        snapshot: track.snapshot(),
        created_at: now_secs(),
    };
    // JSON rather than bincode: `TrackChanges` omits unchanged fields.
    let bytes = serde_json::to_vec(&entry)?;

    let mut history = txn.open_table(HISTORY_TABLE)?;
    let mut owners = txn.open_table(HISTORY_OWNERS_TABLE)?;
    history.insert((track.id, id), bytes.as_slice())?;
    owners.insert(id, track.id)?;
    Ok(entry)
}

/// Newest first.
pub(crate) fn list_for(txn: &ReadTransaction, track_id: TrackId) -> Result<Vec<HistoryEntry>, LibraryError> {
    let history = txn.open_table(HISTORY_TABLE)?;
    let mut entries = Vec::new();
    for item in history.range((track_id, 0)..=(track_id, u64::MAX))?.rev() {
        let item = item?;
        entries.push(serde_json::from_slice(item.1.value())?);
    }
    Ok(entries)
}

/// Keeps the `keep` newest entries of a track; `keep == 0` drops them all.
pub(crate) fn prune(txn: &WriteTransaction, track_id: TrackId, keep: usize) -> Result<usize, LibraryError> {
    let mut history = txn.open_table(HISTORY_TABLE)?;
    let mut owners = txn.open_table(HISTORY_OWNERS_TABLE)?;

    let mut stale = Vec::new();
    for item in history.range((track_id, 0)..=(track_id, u64::MAX))?.rev().skip(keep) {
        let item = item?;
        stale.push(item.0.value());
    }
    for key in &stale {
        history.remove(*key)?;
        owners.remove(key.1)?;
    }
    Ok(stale.len())
}

pub(crate) fn read_entry(txn: &ReadTransaction, entry_id: u64) -> Result<Option<HistoryEntry>, LibraryError> {
    let history = txn.open_table(HISTORY_TABLE)?;
    let owners = txn.open_table(HISTORY_OWNERS_TABLE)?;
    lookup(&history, &owners, entry_id)
}

pub(crate) fn read_entry_in(txn: &WriteTransaction, entry_id: u64) -> Result<Option<HistoryEntry>, LibraryError> {
    let history = txn.open_table(HISTORY_TABLE)?;
    let owners = txn.open_table(HISTORY_OWNERS_TABLE)?;
    lookup(&history, &owners, entry_id)
}

pub(crate) fn count(txn: &ReadTransaction) -> Result<usize, LibraryError> {
    let owners = txn.open_table(HISTORY_OWNERS_TABLE)?;
    Ok(owners.len()? as usize)
}

fn lookup(
    history: &impl ReadableTable<(u64, u64), &'static [u8]>,
    owners: &impl ReadableTable<u64, u64>,
    entry_id: u64,
) -> Result<Option<HistoryEntry>, LibraryError> {
    let track_id = match owners.get(entry_id)? {
        Some(value) => value.value(),
        None => return Ok(None),
    };
    match history.get((track_id, entry_id))? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}
