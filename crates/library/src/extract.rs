use std::fs;
use std::path::Path;

use common::{file_stem, system_time_secs, UNKNOWN_ARTIST};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::absolute_path;
use crate::media::MediaTools;

/// Cheap per-file record: embedded tags plus stat data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedTrack {
    pub path: String,
    pub title: String,
    pub artist: String,
    pub duration_secs: u32,
    pub inode: Option<u64>,
    pub mtime: u64,
}

/// Returns `None` for unreadable or unrecognised files; nothing is written.
pub fn extract<M: MediaTools + ?Sized>(media: &M, path: &Path) -> Option<ExtractedTrack> {
    let path = absolute_path(path);
    let stat = match fs::metadata(&path) {
        Ok(stat) if stat.is_file() => stat,
        Ok(_) => return None,
        Err(err) => {
            debug!("Skipping {:?}: {}", path, err);
            return None;
        }
    };
    let tags = match media.read_tags(&path) {
        Ok(tags) => tags,
        Err(err) => {
            debug!("Skipping {:?}: {}", path, err);
            return None;
        }
    };

    Some(ExtractedTrack {
        path: path.to_string_lossy().to_string(),
        title: tags.title.unwrap_or_else(|| file_stem(&path)),
        artist: tags.artist.unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
        duration_secs: tags.duration_secs.unwrap_or(0),
        inode: inode_of(&stat),
        mtime: stat.modified().map(system_time_secs).unwrap_or(0),
    })
}

/// Inode of whatever currently sits at `path`.
pub(crate) fn path_inode(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().as_ref().and_then(inode_of)
}

#[cfg(unix)]
fn inode_of(stat: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(stat.ino())
}

#[cfg(not(unix))]
fn inode_of(_stat: &fs::Metadata) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_fake_track, FakeMedia};

    #[test]
    fn reads_tags_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fake_track(dir.path(), "song.mp3", "title=Test Song\nartist=Test Artist\nduration=180\n");

        let record = extract(&FakeMedia::default(), &path).unwrap();
        assert_eq!(record.title, "Test Song");
        assert_eq!(record.artist, "Test Artist");
        assert_eq!(record.duration_secs, 180);
        assert!(record.mtime > 0);
        assert!(Path::new(&record.path).is_absolute());
        #[cfg(unix)]
        assert!(record.inode.is_some());
    }

    #[test]
    fn falls_back_to_stem_and_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fake_track(dir.path(), "Untitled Demo.mp3", "");

        let record = extract(&FakeMedia::default(), &path).unwrap();
        assert_eq!(record.title, "Untitled Demo");
        assert_eq!(record.artist, UNKNOWN_ARTIST);
        assert_eq!(record.duration_secs, 0);
    }

    #[test]
    fn unreadable_files_yield_none() {
        let dir = tempfile::tempdir().unwrap();
        let broken = write_fake_track(dir.path(), "broken.mp3", "title=Broken\nduration=abc\n");
        assert!(extract(&FakeMedia::default(), &broken).is_none());
        assert!(extract(&FakeMedia::default(), &dir.path().join("missing.mp3")).is_none());
        assert!(extract(&FakeMedia::default(), dir.path()).is_none());
    }
}
