//! Image shaping: adaptively recompress outgoing images to fit the
//! transport size budget.

use std::io::Cursor;

use image::{
    codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage, ExtendedColorType,
    GenericImageView, ImageEncoder,
};
use shared::protocol::encode_data_uri;
use thiserror::Error;

/// Longer side of a shaped image, aspect ratio preserved.
pub const MAX_EDGE: u32 = 300;
pub const JPEG_QUALITY: u8 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("could not decode image: {0}")]
    DecodeFailed(String),
    #[error("could not re-encode image: {0}")]
    EncodeFailed(String),
}

#[derive(Debug, Clone)]
pub struct RawImage {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// Transport-ready payload: a `data:<mime>;base64,...` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub data_uri: String,
    pub mime: String,
}

/// Shapes `raw` to fit `budget_bytes` (measured on the data-URI text).
///
/// Already-fitting input passes through byte-identical. Oversized input is
/// decoded, downsampled to [`MAX_EDGE`] and re-encoded as JPEG at
/// [`JPEG_QUALITY`]; if that still misses the budget the identical step runs
/// once more on its own output and the result is returned regardless of
/// size. Two passes, never a loop.
pub fn prepare(raw: &RawImage, budget_bytes: usize) -> Result<EncodedImage, ImageError> {
    let direct = encode_data_uri(&raw.mime, &raw.bytes);
    if direct.len() <= budget_bytes {
        return Ok(EncodedImage {
            data_uri: direct,
            mime: raw.mime.clone(),
        });
    }

    let decoded = image::load_from_memory(&raw.bytes)
        .map_err(|err| ImageError::DecodeFailed(err.to_string()))?;
    let first = shape_pass(&decoded)?;
    let first_uri = encode_data_uri("image/jpeg", &first);
    if first_uri.len() <= budget_bytes {
        return Ok(EncodedImage {
            data_uri: first_uri,
            mime: "image/jpeg".into(),
        });
    }

    // Failing to re-read our own JPEG output means the first encode was
    // broken, not the caller's input.
    let redecoded = image::load_from_memory(&first)
        .map_err(|err| ImageError::EncodeFailed(err.to_string()))?;
    let second = shape_pass(&redecoded)?;
    Ok(EncodedImage {
        data_uri: encode_data_uri("image/jpeg", &second),
        mime: "image/jpeg".into(),
    })
}

/// Preview decode for a candidate selection; nothing is transmitted.
pub fn decode_dimensions(bytes: &[u8]) -> Result<(u32, u32), ImageError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|err| ImageError::DecodeFailed(err.to_string()))?;
    Ok(decoded.dimensions())
}

fn shape_pass(source: &DynamicImage) -> Result<Vec<u8>, ImageError> {
    // Shrink only: an image already inside the cap keeps its dimensions.
    let resized = if source.width() > MAX_EDGE || source.height() > MAX_EDGE {
        source.resize(MAX_EDGE, MAX_EDGE, FilterType::Triangle)
    } else {
        source.clone()
    };

    let rgb = resized.to_rgb8();
    let mut out = Vec::new();
    let mut cursor = Cursor::new(&mut out);
    let encoder = JpegEncoder::new_with_quality(&mut cursor, JPEG_QUALITY);
    encoder
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|err| ImageError::EncodeFailed(err.to_string()))?;
    if out.is_empty() {
        return Err(ImageError::EncodeFailed("encoder produced no output".into()));
    }
    Ok(out)
}

#[cfg(test)]
#[path = "tests/image_tests.rs"]
mod tests;
