use std::path::{Path, PathBuf};

use common::TrackId;
use metadata::{CoverFiles, MetadataError, TagVersion};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FileTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_secs: Option<u32>,
}

/// Tag library and media probe, as seen by the pipeline.
pub trait MediaTools: Send + Sync + 'static {
    fn read_tags(&self, path: &Path) -> Result<FileTags, MetadataError>;
    fn probe_duration(&self, path: &Path) -> Result<Option<u32>, MetadataError>;
    fn read_cover(&self, path: &Path) -> Result<Option<Vec<u8>>, MetadataError>;
    fn tag_version(&self, path: &Path) -> Result<Option<TagVersion>, MetadataError>;
    fn normalize_tags(&self, path: &Path) -> Result<(), MetadataError>;
    fn write_tags(&self, path: &Path, title: &str, artist: &str) -> Result<(), MetadataError>;
}

pub trait CoverRenderer: Send + Sync + 'static {
    fn render(&self, data: &[u8], track_id: TrackId) -> Result<CoverFiles, MetadataError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalMedia;

impl MediaTools for LocalMedia {
    fn read_tags(&self, path: &Path) -> Result<FileTags, MetadataError> {
        let info = metadata::read_tags(path)?;
        Ok(FileTags {
            title: info.title,
            artist: info.artist,
            duration_secs: info.duration_ms.map(|ms| ms.saturating_add(500) / 1000),
        })
    }

    fn probe_duration(&self, path: &Path) -> Result<Option<u32>, MetadataError> {
        metadata::probe_duration(path)
    }

    fn read_cover(&self, path: &Path) -> Result<Option<Vec<u8>>, MetadataError> {
        metadata::read_cover(path)
    }

    fn tag_version(&self, path: &Path) -> Result<Option<TagVersion>, MetadataError> {
        metadata::tag_version(path)
    }

    fn normalize_tags(&self, path: &Path) -> Result<(), MetadataError> {
        metadata::normalize_tags(path)
    }

    fn write_tags(&self, path: &Path, title: &str, artist: &str) -> Result<(), MetadataError> {
        metadata::write_tags(path, title, artist)
    }
}

#[derive(Debug, Clone)]
pub struct ImageCovers {
    dir: PathBuf,
    small_size: u32,
}

impl ImageCovers {
    pub fn new(dir: PathBuf, small_size: u32) -> Self {
        Self {
            dir,
            small_size: small_size.max(16),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CoverRenderer for ImageCovers {
    fn render(&self, data: &[u8], track_id: TrackId) -> Result<CoverFiles, MetadataError> {
        metadata::write_cover_renditions(data, &self.dir, track_id, self.small_size)
    }
}
