//! Image similarity strategies.
//!
//! All strategies implement [`SimilarityEngine`] and return a score in
//! [0, 1]: 1.0 for identical input, decreasing as the images diverge.
//! Both statistical strategies work on a blurred, per-image normalized
//! luminance grid so that global brightness and contrast changes are ignored.
//!
//! Normalization has a cost: any two images related by an affine brightness
//! change score as identical. Two flat images of different gray levels both
//! normalize to an all-zero grid, so the region-tiled strategy scores them
//! 1.0. The SSIM term of the blend compares raw means and still separates
//! them. Callers that need absolute exposure to matter should pick the blend
//! or gate on a face detector.

use image::{imageops, imageops::FilterType, DynamicImage};
use std::str::FromStr;
use std::sync::Arc;

/// Guards the standard-deviation divide for flat images.
const NORMALIZE_EPSILON: f64 = 1e-5;
const GRID_SIZE: u32 = 64;
const BLUR_SIGMA: f32 = 1.0;

/// Strategy for scoring how alike two images are.
pub trait SimilarityEngine: Send + Sync {
    /// Short identifier used in logs and status output.
    fn name(&self) -> &'static str;

    /// Similarity in [0, 1]; 1.0 only for identical input.
    fn compare(&self, a: &DynamicImage, b: &DynamicImage) -> f64;
}

/// Selectable statistical strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComparatorKind {
    /// Best-K tiled mean-absolute-difference blended with the whole image.
    #[default]
    RegionTiled,
    /// Mean-squared-error similarity blended with a global SSIM index.
    SsimBlend,
}

impl ComparatorKind {
    pub fn build(self) -> Arc<dyn SimilarityEngine> {
        match self {
            Self::RegionTiled => Arc::new(RegionTiledComparator::default()),
            Self::SsimBlend => Arc::new(SsimBlendComparator::default()),
        }
    }
}

impl FromStr for ComparatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "region" | "region-tiled" | "mad" => Ok(Self::RegionTiled),
            "ssim" | "ssim-blend" => Ok(Self::SsimBlend),
            other => Err(format!("unknown comparator '{other}' (expected 'region' or 'ssim')")),
        }
    }
}

/// Resize to a `size`×`size` luminance grid and apply a light Gaussian blur.
fn luminance_grid(image: &DynamicImage, size: u32) -> Vec<f64> {
    let luma = image.to_luma8();
    let resized = imageops::resize(&luma, size, size, FilterType::Triangle);
    let blurred = imageops::blur(&resized, BLUR_SIGMA);
    blurred.as_raw().iter().map(|&p| p as f64).collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Subtract the mean and divide by the standard deviation.
fn normalize(mut values: Vec<f64>) -> Vec<f64> {
    let mu = mean(&values);
    let variance = values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len().max(1) as f64;
    let denom = variance.sqrt() + NORMALIZE_EPSILON;
    for v in values.iter_mut() {
        *v = (*v - mu) / denom;
    }
    values
}

/// Tiled mean-absolute-difference comparator.
///
/// Splits the normalized grid into `tiles`×`tiles` regions, converts each
/// region's MAD to a similarity with `exp(-mad)`, averages the best `top_k`
/// regions and blends that with the whole-image similarity. Localized change
/// (expression, a hand over the chin) only costs the worst regions.
#[derive(Debug, Clone)]
pub struct RegionTiledComparator {
    pub grid_size: u32,
    pub tiles: u32,
    pub top_k: usize,
    /// Weight of the best-K region score; the rest goes to the whole image.
    pub region_weight: f64,
}

impl Default for RegionTiledComparator {
    fn default() -> Self {
        Self {
            grid_size: GRID_SIZE,
            tiles: 4,
            top_k: 10,
            region_weight: 0.7,
        }
    }
}

impl RegionTiledComparator {
    fn region_similarities(&self, diff: &[f64]) -> Vec<f64> {
        let size = self.grid_size as usize;
        let tiles = self.tiles.max(1) as usize;
        let tile = (size / tiles).max(1);

        let mut regions = Vec::with_capacity(tiles * tiles);
        for row in 0..tiles {
            for col in 0..tiles {
                let (y0, x0) = (row * tile, col * tile);
                let mut sum = 0.0;
                let mut count = 0usize;
                for y in y0..(y0 + tile).min(size) {
                    for x in x0..(x0 + tile).min(size) {
                        sum += diff[y * size + x];
                        count += 1;
                    }
                }
                let mad = if count > 0 { sum / count as f64 } else { 0.0 };
                regions.push((-mad).exp());
            }
        }
        regions
    }
}

impl SimilarityEngine for RegionTiledComparator {
    fn name(&self) -> &'static str {
        "region-tiled"
    }

    fn compare(&self, a: &DynamicImage, b: &DynamicImage) -> f64 {
        let ga = normalize(luminance_grid(a, self.grid_size));
        let gb = normalize(luminance_grid(b, self.grid_size));

        let diff: Vec<f64> = ga.iter().zip(gb.iter()).map(|(x, y)| (x - y).abs()).collect();
        let whole = (-mean(&diff)).exp();

        let mut regions = self.region_similarities(&diff);
        regions.sort_by(|x, y| y.partial_cmp(x).unwrap_or(std::cmp::Ordering::Equal));
        let k = self.top_k.clamp(1, regions.len().max(1));
        let region_score = mean(&regions[..k.min(regions.len())]);

        let score = self.region_weight * region_score + (1.0 - self.region_weight) * whole;
        score.clamp(0.0, 1.0)
    }
}

/// MSE / SSIM blend comparator.
///
/// The MSE term is computed on the normalized grids (`1 / (1 + mse)`); the
/// SSIM term is a single global structural-similarity index over the blurred
/// luminance grids, clamped to [0, 1].
#[derive(Debug, Clone)]
pub struct SsimBlendComparator {
    pub grid_size: u32,
    /// Weight of the MSE term; the rest goes to SSIM.
    pub mse_weight: f64,
}

impl Default for SsimBlendComparator {
    fn default() -> Self {
        Self {
            grid_size: GRID_SIZE,
            mse_weight: 0.5,
        }
    }
}

/// Single-window SSIM over two equal-length luminance buffers.
fn global_ssim(a: &[f64], b: &[f64]) -> f64 {
    const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
    const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

    let n = a.len().max(1) as f64;
    let mu_a = mean(a);
    let mu_b = mean(b);

    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut cov = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let da = x - mu_a;
        let db = y - mu_b;
        var_a += da * da;
        var_b += db * db;
        cov += da * db;
    }
    var_a /= n;
    var_b /= n;
    cov /= n;

    let numerator = (2.0 * mu_a * mu_b + C1) * (2.0 * cov + C2);
    let denominator = (mu_a * mu_a + mu_b * mu_b + C1) * (var_a + var_b + C2);
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

impl SimilarityEngine for SsimBlendComparator {
    fn name(&self) -> &'static str {
        "ssim-blend"
    }

    fn compare(&self, a: &DynamicImage, b: &DynamicImage) -> f64 {
        let raw_a = luminance_grid(a, self.grid_size);
        let raw_b = luminance_grid(b, self.grid_size);

        let ssim = global_ssim(&raw_a, &raw_b).clamp(0.0, 1.0);

        let na = normalize(raw_a);
        let nb = normalize(raw_b);
        let mse = na
            .iter()
            .zip(nb.iter())
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            / na.len().max(1) as f64;
        let mse_similarity = 1.0 / (1.0 + mse);

        let score = self.mse_weight * mse_similarity + (1.0 - self.mse_weight) * ssim;
        score.clamp(0.0, 1.0)
    }
}
