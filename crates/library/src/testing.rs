use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use common::{EventAction, TrackEvent, TrackId};
use metadata::{CoverFiles, MetadataError, TagVersion};
use parking_lot::Mutex;

use crate::events::EventSink;
use crate::media::{CoverRenderer, FileTags, MediaTools};

/// Plain-text stand-in for audio files: one `key=value` per line.
#[derive(Default)]
pub struct FakeMedia;

pub fn write_fake_track(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, body).unwrap();
    path
}

fn fields(path: &Path) -> Result<HashMap<String, String>, MetadataError> {
    let body = fs::read_to_string(path)?;
    Ok(body
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect())
}

fn invalid(message: &str) -> MetadataError {
    MetadataError::Io(io::Error::new(io::ErrorKind::InvalidData, message.to_string()))
}

fn number(fields: &HashMap<String, String>, key: &str) -> Result<Option<u32>, MetadataError> {
    match fields.get(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| invalid(&format!("malformed {}", key))),
        None => Ok(None),
    }
}

fn rewrite(path: &Path, update: impl FnOnce(&mut HashMap<String, String>)) -> Result<(), MetadataError> {
    let mut fields = fields(path)?;
    update(&mut fields);
    let mut keys: Vec<_> = fields.keys().cloned().collect();
    keys.sort();
    let body: String = keys
        .iter()
        .map(|key| format!("{}={}\n", key, fields[key]))
        .collect();
    fs::write(path, body)?;
    Ok(())
}

impl MediaTools for FakeMedia {
    fn read_tags(&self, path: &Path) -> Result<FileTags, MetadataError> {
        let fields = fields(path)?;
        Ok(FileTags {
            title: fields.get("title").cloned(),
            artist: fields.get("artist").cloned(),
            duration_secs: number(&fields, "duration")?,
        })
    }

    fn probe_duration(&self, path: &Path) -> Result<Option<u32>, MetadataError> {
        let fields = fields(path)?;
        if fields.contains_key("probe_error") {
            return Err(invalid("probe failed"));
        }
        if fields.contains_key("opaque") {
            return Ok(None);
        }
        match number(&fields, "probe")? {
            Some(value) => Ok(Some(value)),
            None => number(&fields, "duration"),
        }
    }

    fn read_cover(&self, path: &Path) -> Result<Option<Vec<u8>>, MetadataError> {
        Ok(fields(path)?.get("cover").map(|value| value.clone().into_bytes()))
    }

    fn tag_version(&self, path: &Path) -> Result<Option<TagVersion>, MetadataError> {
        Ok(match fields(path)?.get("tag").map(String::as_str) {
            Some("v1") => Some(TagVersion::Id3v1),
            Some("v22") => Some(TagVersion::Id3v2(2)),
            Some("v23") => Some(TagVersion::Id3v2(3)),
            Some("v24") => Some(TagVersion::Id3v2(4)),
            _ => None,
        })
    }

    fn normalize_tags(&self, path: &Path) -> Result<(), MetadataError> {
        rewrite(path, |fields| {
            fields.insert("tag".to_string(), "v24".to_string());
        })
    }

    fn write_tags(&self, path: &Path, title: &str, artist: &str) -> Result<(), MetadataError> {
        rewrite(path, |fields| {
            fields.insert("title".to_string(), title.to_string());
            fields.insert("artist".to_string(), artist.to_string());
        })
    }
}

/// Records rendered covers instead of decoding images.
#[derive(Default)]
pub struct FakeCovers {
    pub rendered: Mutex<Vec<TrackId>>,
    pub dir: PathBuf,
}

impl FakeCovers {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            rendered: Mutex::new(Vec::new()),
            dir,
        }
    }
}

impl CoverRenderer for FakeCovers {
    fn render(&self, data: &[u8], track_id: TrackId) -> Result<CoverFiles, MetadataError> {
        if data == b"broken" {
            return Err(invalid("cannot decode cover"));
        }
        fs::create_dir_all(&self.dir)?;
        let original = self.dir.join(format!("{}_original.jpg", track_id));
        let small = self.dir.join(format!("{}_small.jpg", track_id));
        fs::write(&original, data)?;
        fs::write(&small, data)?;
        self.rendered.lock().push(track_id);
        Ok(CoverFiles { original, small })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<TrackEvent>>,
}

impl RecordingSink {
    pub fn actions(&self) -> Vec<EventAction> {
        self.events.lock().iter().map(|event| event.action).collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: TrackEvent) {
        self.events.lock().push(event);
    }
}
