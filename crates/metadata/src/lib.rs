use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use lofty::config::WriteOptions;
use lofty::error::LoftyError;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::{Accessor, AudioFile, ItemKey, TaggedFileExt};
use lofty::tag::Tag;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

pub mod cover;

pub use cover::{write_cover_renditions, CoverFiles};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TagInfo {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_ms: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagVersion {
    Id3v1,
    Id3v2(u8),
}

impl TagVersion {
    /// ID3v1-only files and ID3v2 revisions before 2.4 get rewritten.
    pub fn is_legacy(self) -> bool {
        match self {
            TagVersion::Id3v1 => true,
            TagVersion::Id3v2(major) => major < 4,
        }
    }
}

impl fmt::Display for TagVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagVersion::Id3v1 => write!(f, "ID3v1"),
            TagVersion::Id3v2(major) => write!(f, "ID3v2.{}", major),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tag error: {0}")]
    Lofty(#[from] LoftyError),
    #[error("probe error: {0}")]
    Probe(#[from] SymphoniaError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("no tag to write in {0}")]
    NoTag(PathBuf),
}

pub fn read_tags(path: &Path) -> Result<TagInfo, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut info = TagInfo::default();

    let duration_ms = properties.duration().as_millis();
    if duration_ms > 0 {
        let clamped = duration_ms.min(u128::from(u32::MAX)) as u32;
        info.duration_ms = Some(clamped);
    }

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.title = tag
            .get_string(&ItemKey::TrackTitle)
            .and_then(non_empty);
        let album_artist = tag
            .get_string(&ItemKey::AlbumArtist)
            .and_then(non_empty);
        let track_artist = tag
            .get_string(&ItemKey::TrackArtist)
            .and_then(non_empty);
        info.artist = track_artist.or(album_artist);
    }

    Ok(info)
}

/// Raw bytes of the front cover, or of the first picture when there is none.
pub fn read_cover(path: &Path) -> Result<Option<Vec<u8>>, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let tag = match tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        Some(tag) => tag,
        None => return Ok(None),
    };

    let picture = match pick_picture(tag.pictures()) {
        Some(picture) => picture,
        None => return Ok(None),
    };

    Ok(Some(picture.data().to_vec()))
}

/// Sniffs the tag container revision from the raw header/trailer bytes.
pub fn tag_version(path: &Path) -> Result<Option<TagVersion>, MetadataError> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 10];
    let read = read_up_to(&mut file, &mut header)?;
    if read >= 4 && &header[..3] == b"ID3" {
        return Ok(Some(TagVersion::Id3v2(header[3])));
    }

    let len = file.metadata()?.len();
    if len >= 128 {
        file.seek(SeekFrom::Start(len - 128))?;
        let mut trailer = [0u8; 3];
        if read_up_to(&mut file, &mut trailer)? == 3 && &trailer == b"TAG" {
            return Ok(Some(TagVersion::Id3v1));
        }
    }
    Ok(None)
}

/// Rewrites the primary tag in the current container revision.
pub fn normalize_tags(path: &Path) -> Result<(), MetadataError> {
    let mut tagged_file = lofty::read_from_path(path)?;
    if tagged_file.primary_tag().is_none() {
        let legacy = match tagged_file.first_tag() {
            Some(tag) => tag.clone(),
            None => return Err(MetadataError::NoTag(path.to_path_buf())),
        };
        let mut primary = Tag::new(tagged_file.primary_tag_type());
        if let Some(title) = legacy.title() {
            primary.set_title(title.to_string());
        }
        if let Some(artist) = legacy.artist() {
            primary.set_artist(artist.to_string());
        }
        if let Some(album) = legacy.album() {
            primary.set_album(album.to_string());
        }
        tagged_file.insert_tag(primary);
    }
    tagged_file.save_to_path(path, WriteOptions::default())?;
    Ok(())
}

pub fn write_tags(path: &Path, title: &str, artist: &str) -> Result<(), MetadataError> {
    let mut tagged_file = lofty::read_from_path(path)?;
    if tagged_file.primary_tag().is_none() {
        let tag_type = tagged_file.primary_tag_type();
        tagged_file.insert_tag(Tag::new(tag_type));
    }
    let tag = tagged_file
        .primary_tag_mut()
        .ok_or_else(|| MetadataError::NoTag(path.to_path_buf()))?;
    tag.set_title(title.to_string());
    tag.set_artist(artist.to_string());
    tagged_file.save_to_path(path, WriteOptions::default())?;
    Ok(())
}

/// Accurate duration by walking every packet of the default track.
pub fn probe_duration(path: &Path) -> Result<Option<u32>, MetadataError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(probed) => probed,
        // No reader for this container; callers keep the tag duration.
        Err(SymphoniaError::Unsupported(_)) => return Ok(None),
        Err(SymphoniaError::IoError(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None)
        }
        Err(err) => return Err(err.into()),
    };
    let mut format = probed.format;

    let (track_id, time_base, sample_rate, n_frames) = match format.default_track() {
        Some(track) => (
            track.id,
            track.codec_params.time_base,
            track.codec_params.sample_rate,
            track.codec_params.n_frames,
        ),
        None => return Ok(None),
    };

    let mut total: u64 = 0;
    loop {
        match format.next_packet() {
            Ok(packet) => {
                if packet.track_id() == track_id {
                    total = total.saturating_add(packet.dur);
                }
            }
            Err(SymphoniaError::IoError(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) => return Err(err.into()),
        }
    }
    if total == 0 {
        total = n_frames.unwrap_or(0);
    }
    if total == 0 {
        return Ok(None);
    }

    let secs = match (time_base, sample_rate) {
        (Some(time_base), _) => {
            let time = time_base.calc_time(total);
            time.seconds + u64::from(time.frac >= 0.5)
        }
        (None, Some(rate)) if rate > 0 => (total + u64::from(rate) / 2) / u64::from(rate),
        _ => return Ok(None),
    };
    Ok(Some(secs.min(u64::from(u32::MAX)) as u32))
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize, std::io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn pick_picture(pictures: &[Picture]) -> Option<&Picture> {
    for picture in pictures {
        if picture.pic_type() == PictureType::CoverFront {
            return Some(picture);
        }
    }
    pictures.first()
}
