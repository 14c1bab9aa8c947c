//! Full-feature mode: an external face detection and embedding capability.
//!
//! No model backend ships in this workspace. A deployment that has one
//! implements [`FaceAnalyzer`] and hands it to the verification service, which
//! then gates registration and verification on exactly one detected face and
//! switches to [`EmbeddingComparator`] for scoring.

use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::similarity::SimilarityEngine;

/// Acceptance threshold used when scoring with embeddings.
pub const EMBEDDING_THRESHOLD: f64 = 0.6;

#[derive(Error, Debug)]
#[error("face analyzer failed: {0}")]
pub struct AnalyzerError(pub String);

/// Bounding box of a detected face, in source pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

pub trait FaceAnalyzer: Send + Sync {
    /// Short identifier of the backing model, reported in status output.
    fn name(&self) -> &str;

    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceRegion>, AnalyzerError>;

    /// Embedding of the most prominent face in `image`.
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>, AnalyzerError>;
}

/// Cosine similarity in [-1, 1]; zero when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        dot / denom
    } else {
        0.0
    }
}

/// Scores two images by the cosine similarity of their face embeddings,
/// clamped to [0, 1]. An image the analyzer cannot embed scores 0.
pub struct EmbeddingComparator {
    analyzer: Arc<dyn FaceAnalyzer>,
}

impl EmbeddingComparator {
    pub fn new(analyzer: Arc<dyn FaceAnalyzer>) -> Self {
        Self { analyzer }
    }
}

impl SimilarityEngine for EmbeddingComparator {
    fn name(&self) -> &'static str {
        "embedding"
    }

    fn compare(&self, a: &DynamicImage, b: &DynamicImage) -> f64 {
        let (ea, eb) = match (self.analyzer.embed(a), self.analyzer.embed(b)) {
            (Ok(ea), Ok(eb)) => (ea, eb),
            (Err(e), _) | (_, Err(e)) => {
                tracing::debug!(error = %e, "embedding failed, scoring 0");
                return 0.0;
            }
        };
        (cosine_similarity(&ea, &eb) as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::GenericImageView;

    /// Deterministic stand-in: the face count is the top-left pixel value
    /// mod 4, the embedding is the centered mean intensity of each quadrant.
    pub(crate) struct PixelCodedAnalyzer;

    impl FaceAnalyzer for PixelCodedAnalyzer {
        fn name(&self) -> &str {
            "pixel-coded"
        }

        fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceRegion>, AnalyzerError> {
            let count = image.get_pixel(0, 0)[0] as usize % 4;
            Ok((0..count)
                .map(|i| FaceRegion {
                    x: i as f32 * 10.0,
                    y: 0.0,
                    width: 10.0,
                    height: 10.0,
                    confidence: 0.9,
                })
                .collect())
        }

        fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>, AnalyzerError> {
            let gray = image.to_luma8();
            let (w, h) = gray.dimensions();
            if w < 2 || h < 2 {
                return Err(AnalyzerError("image too small to embed".into()));
            }
            let mut sums = [0.0f32; 4];
            let mut counts = [0.0f32; 4];
            for (x, y, p) in gray.enumerate_pixels() {
                let q = usize::from(x >= w / 2) + 2 * usize::from(y >= h / 2);
                sums[q] += p[0] as f32 - 127.5;
                counts[q] += 1.0;
            }
            Ok(sums.iter().zip(counts.iter()).map(|(s, c)| s / c).collect())
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_embedding_comparator_clamps_negative() {
        let comparator = EmbeddingComparator::new(Arc::new(PixelCodedAnalyzer));
        let bright = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(8, 8, image::Luma([250])));
        let dark = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(8, 8, image::Luma([5])));
        assert_eq!(comparator.compare(&bright, &dark), 0.0);
        assert!((comparator.compare(&bright, &bright) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_embed_failure_scores_zero() {
        let comparator = EmbeddingComparator::new(Arc::new(PixelCodedAnalyzer));
        let tiny = DynamicImage::ImageLuma8(image::GrayImage::new(1, 1));
        let ok = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(8, 8, image::Luma([200])));
        assert_eq!(comparator.compare(&tiny, &ok), 0.0);
    }
}
