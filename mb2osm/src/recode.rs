use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder as _, ImageFormat, load_from_memory_with_format};
use mb2osm_tile_utils::Format;

use crate::errors::TileError;

/// Re-encode a tile image as JPEG.
///
/// `quality == 0` disables re-encoding and hands `data` back untouched, without looking at it.
/// Otherwise `quality` (1..=100) is the JPEG quality. The source must be PNG or JPEG, which is
/// established from its header before anything is decoded. Transparency is dropped because
/// JPEG has no alpha channel.
pub fn recode(data: Vec<u8>, quality: u8) -> Result<Vec<u8>, TileError> {
    if quality == 0 {
        return Ok(data);
    }

    let (format, image_format) = match Format::detect(&data) {
        Some(f @ Format::Png) => (f, ImageFormat::Png),
        Some(f @ Format::Jpeg) => (f, ImageFormat::Jpeg),
        other => return Err(TileError::UnsupportedFormat(other)),
    };

    let image = load_from_memory_with_format(&data, image_format)
        .map_err(|e| TileError::DecodeFailed(format, e))?
        .into_rgb8();

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(TileError::EncodeFailed)?;

    Ok(buffer)
}
