//! Image payload decoding: data-URL stripping, base64, format sniffing and
//! size normalization.
//!
//! Everything that enters the pipeline passes through here, so this is where
//! payload size and pixel dimensions are bounded before any comparison work.

use base64::Engine;
use image::{imageops::FilterType, DynamicImage, ImageFormat, ImageReader, Limits};
use std::io::Cursor;
use thiserror::Error;

/// Largest accepted decoded payload (10 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;
/// Minimum width and height for a registration image.
pub const MIN_REGISTRATION_EDGE: u32 = 100;
/// Images with either side above this are downsampled after decoding.
const OVERSIZE_EDGE: u32 = 2000;
/// Long-edge target when downsampling an oversized image.
const DOWNSAMPLE_EDGE: u32 = 1000;
/// Hard decoder ceiling; protects against decompression bombs.
const DECODER_MAX_EDGE: u32 = 16_384;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("empty image payload")]
    EmptyPayload,
    #[error("image payload too large: {len} bytes (maximum {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unrecognized image data: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image is too small ({width}x{height}, minimum {min}px per side)")]
    TooSmall { width: u32, height: u32, min: u32 },
}

/// An inbound encoded image, as text or as raw bytes.
#[derive(Debug, Clone, Copy)]
pub enum ImagePayload<'a> {
    /// Base64, optionally prefixed with `data:<mime>;base64,`.
    Base64(&'a str),
    Bytes(&'a [u8]),
}

impl ImagePayload<'_> {
    /// True when there is no image data at all, prefix aside.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Base64(s) => strip_data_url(s.trim()).is_empty(),
            Self::Bytes(b) => b.is_empty(),
        }
    }

    pub fn decode(&self) -> Result<DynamicImage, CodecError> {
        match self {
            Self::Base64(s) => decode_base64(s),
            Self::Bytes(b) => decode_bytes(b),
        }
    }
}

/// Strip an optional `data:<mime>;base64,` prefix.
///
/// Base64 never contains a comma, so everything up to the first comma is
/// treated as the media-type marker.
pub fn strip_data_url(payload: &str) -> &str {
    match payload.split_once(',') {
        Some((_, data)) => data,
        None => payload,
    }
}

/// Decode a base64 payload (optionally a data URL) into an image.
pub fn decode_base64(payload: &str) -> Result<DynamicImage, CodecError> {
    let data = strip_data_url(payload.trim());
    if data.is_empty() {
        return Err(CodecError::EmptyPayload);
    }

    // 4 base64 chars carry 3 bytes; reject before allocating the decode buffer.
    let max_encoded = MAX_PAYLOAD_BYTES.div_ceil(3) * 4;
    if data.len() > max_encoded {
        return Err(CodecError::PayloadTooLarge {
            len: data.len() / 4 * 3,
            max: MAX_PAYLOAD_BYTES,
        });
    }

    let bytes = base64::engine::general_purpose::STANDARD.decode(data)?;
    decode_bytes(&bytes)
}

/// Decode raw encoded image bytes (PNG, JPEG, ...) into an image.
///
/// Oversized images are downsampled so the long edge is at most 1000 px.
pub fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::EmptyPayload);
    }
    if bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(CodecError::PayloadTooLarge {
            len: bytes.len(),
            max: MAX_PAYLOAD_BYTES,
        });
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(DECODER_MAX_EDGE);
    limits.max_image_height = Some(DECODER_MAX_EDGE);

    let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    reader.limits(limits);
    let image = reader.decode()?;

    Ok(bound_size(image))
}

/// Downsample proportionally when either side exceeds the oversize limit.
pub fn bound_size(image: DynamicImage) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    if width <= OVERSIZE_EDGE && height <= OVERSIZE_EDGE {
        return image;
    }

    let resized = image.resize(DOWNSAMPLE_EDGE, DOWNSAMPLE_EDGE, FilterType::Triangle);
    tracing::debug!(
        from_width = width,
        from_height = height,
        to_width = resized.width(),
        to_height = resized.height(),
        "downsampled oversized image"
    );
    resized
}

/// Reject images with either side below `min` pixels.
pub fn require_min_size(image: &DynamicImage, min: u32) -> Result<(), CodecError> {
    if image.width() < min || image.height() < min {
        return Err(CodecError::TooSmall {
            width: image.width(),
            height: image.height(),
            min,
        });
    }
    Ok(())
}

/// Encode an image as PNG bytes.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, CodecError> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}
