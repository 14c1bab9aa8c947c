//! Perceptual fingerprint of an image.
//!
//! A fingerprint is the mean-threshold bit pattern of a blurred 32×32
//! luminance thumbnail, hex-packed, followed by a SHA-256 digest of the same
//! thumbnail. Two fingerprints are compared by the fraction of equal
//! characters at equal positions. This is a string-level similarity, not a
//! Hamming distance over bits.

use image::{imageops, imageops::FilterType, DynamicImage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const GRID: u32 = 32;
const BLUR_SIGMA: f32 = 1.0;
/// Hex characters produced by the perceptual bit pattern (GRID² bits / 4).
const PERCEPTUAL_HEX_LEN: usize = (GRID * GRID / 4) as usize;
/// Hex characters of the SHA-256 content digest.
const DIGEST_HEX_LEN: usize = 64;
/// Total fingerprint length in characters.
pub const FINGERPRINT_LEN: usize = PERCEPTUAL_HEX_LEN + DIGEST_HEX_LEN;

/// Fixed-length fingerprint derived deterministically from an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of an image.
    pub fn of(image: &DynamicImage) -> Self {
        let luma = image.to_luma8();
        let small = imageops::resize(&luma, GRID, GRID, FilterType::Triangle);
        let blurred = imageops::blur(&small, BLUR_SIGMA);
        let pixels = blurred.as_raw();

        let mean = pixels.iter().map(|&p| p as f64).sum::<f64>() / pixels.len() as f64;

        let mut hex = String::with_capacity(FINGERPRINT_LEN);
        for nibble in pixels.chunks(4) {
            let value = nibble
                .iter()
                .fold(0u8, |acc, &p| (acc << 1) | u8::from(p as f64 > mean));
            hex.push(char::from_digit(value as u32, 16).unwrap_or('0'));
        }

        let digest = Sha256::digest(pixels);
        hex.push_str(&format!("{digest:x}"));

        Self(hex)
    }

    /// Wrap a previously stored fingerprint string.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Character-equality similarity in [0, 1].
    ///
    /// Exact equality short-circuits to 1.0. Otherwise counts positions where
    /// both strings hold the same character and divides by the length of
    /// `self` (the sample).
    pub fn similarity(&self, stored: &Fingerprint) -> f64 {
        if self.0 == stored.0 {
            return 1.0;
        }
        if self.0.is_empty() {
            return 0.0;
        }
        let matching = self
            .0
            .chars()
            .zip(stored.0.chars())
            .filter(|(a, b)| a == b)
            .count();
        matching as f64 / self.0.chars().count() as f64
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, _| {
            Luma([(x * 255 / width.max(1)) as u8])
        }))
    }

    #[test]
    fn test_fixed_length() {
        let fp = Fingerprint::of(&gradient(200, 150));
        assert_eq!(fp.as_str().len(), FINGERPRINT_LEN);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_deterministic() {
        let img = gradient(320, 240);
        assert_eq!(Fingerprint::of(&img), Fingerprint::of(&img));
    }

    #[test]
    fn test_character_equality_fraction() {
        let sample = Fingerprint::from_stored("abcd");
        let stored = Fingerprint::from_stored("abzz");
        assert!((sample.similarity(&stored) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_exact_equality_is_one() {
        let a = Fingerprint::from_stored("0f0f");
        assert_eq!(a.similarity(&a.clone()), 1.0);
    }

    #[test]
    fn test_normalized_by_sample_length() {
        let sample = Fingerprint::from_stored("aaaa");
        let stored = Fingerprint::from_stored("aa");
        assert!((sample.similarity(&stored) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_different_images_score_lower() {
        let a = Fingerprint::of(&gradient(200, 200));
        let flipped = DynamicImage::ImageLuma8(image::imageops::flip_horizontal(
            &gradient(200, 200).to_luma8(),
        ));
        let b = Fingerprint::of(&flipped);
        assert!(a.similarity(&b) < 0.5);
    }
}
