use std::fs;
use std::path::{Path, PathBuf};

use common::{cover_file_name, CoverSize};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};

use crate::MetadataError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverFiles {
    pub original: PathBuf,
    pub small: PathBuf,
}

/// Writes `{id}_original.<ext>` and a square `{id}_small.<ext>` thumbnail.
/// JPEG, PNG, GIF and WebP originals are kept byte for byte; anything else
/// the decoder understands is re-encoded as JPEG.
pub fn write_cover_renditions(
    data: &[u8],
    covers_dir: &Path,
    track_id: u64,
    small_size: u32,
) -> Result<CoverFiles, MetadataError> {
    let detected = image::guess_format(data)?;
    let (format, ext) = match detected {
        ImageFormat::Png => (ImageFormat::Png, "png"),
        ImageFormat::Gif => (ImageFormat::Gif, "gif"),
        ImageFormat::WebP => (ImageFormat::WebP, "webp"),
        _ => (ImageFormat::Jpeg, "jpg"),
    };
    let decoded = image::load_from_memory(data)?;

    fs::create_dir_all(covers_dir)?;
    let original = covers_dir.join(cover_file_name(track_id, CoverSize::Original, ext));
    let small = covers_dir.join(cover_file_name(track_id, CoverSize::Small, ext));

    if detected == format {
        fs::write(&original, data)?;
    } else {
        encodable(decoded.clone(), format).save_with_format(&original, format)?;
    }
    let thumb = decoded.resize_to_fill(small_size, small_size, FilterType::Lanczos3);
    encodable(thumb, format).save_with_format(&small, format)?;

    Ok(CoverFiles { original, small })
}

/// The JPEG encoder takes no alpha channel.
fn encodable(image: DynamicImage, format: ImageFormat) -> DynamicImage {
    match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
        _ => image,
    }
}
