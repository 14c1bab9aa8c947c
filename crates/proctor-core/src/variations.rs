//! Synthetic pose and lighting variations of a registration image.
//!
//! Each registered reference is accompanied by a handful of perturbed copies
//! (small shifts, small rotations, brightness scaling). Verification takes
//! the best score across the reference and all variations, which absorbs a
//! little of the drift between registration and exam conditions.

use image::{imageops::FilterType, DynamicImage, GrayImage, Luma};

use crate::types::{Variation, VariationKind};

/// Long edge of the working copy kept for the reference and its variations.
pub const WORKING_EDGE: u32 = 256;

const SHIFT_PX: i32 = 5;
const ROTATE_DEGREES: f32 = 5.0;
const BRIGHTNESS_FACTORS: [f32; 2] = [0.8, 1.2];

/// Reduce an image to the single-channel working copy stored for comparison.
pub fn working_copy(image: &DynamicImage) -> DynamicImage {
    let resized = if image.width() > WORKING_EDGE || image.height() > WORKING_EDGE {
        image.resize(WORKING_EDGE, WORKING_EDGE, FilterType::Triangle)
    } else {
        image.clone()
    };
    DynamicImage::ImageLuma8(resized.to_luma8())
}

/// Generate the standard variation set from a working copy.
///
/// Order is fixed: four shifts (right, left, down, up), two rotations
/// (+5°, -5°), two brightness factors (0.8, 1.2). Indices start at 0.
pub fn generate(reference: &DynamicImage) -> Vec<Variation> {
    let gray = reference.to_luma8();

    let mut kinds = vec![
        VariationKind::Shift { dx: SHIFT_PX, dy: 0 },
        VariationKind::Shift { dx: -SHIFT_PX, dy: 0 },
        VariationKind::Shift { dx: 0, dy: SHIFT_PX },
        VariationKind::Shift { dx: 0, dy: -SHIFT_PX },
        VariationKind::Rotate { degrees: ROTATE_DEGREES },
        VariationKind::Rotate { degrees: -ROTATE_DEGREES },
    ];
    kinds.extend(
        BRIGHTNESS_FACTORS
            .iter()
            .map(|&factor| VariationKind::Brightness { factor }),
    );

    kinds
        .into_iter()
        .enumerate()
        .map(|(i, kind)| Variation {
            index: i as u32,
            kind,
            image: DynamicImage::ImageLuma8(apply(&gray, kind)),
        })
        .collect()
}

/// Apply one perturbation to a grayscale image.
pub fn apply(gray: &GrayImage, kind: VariationKind) -> GrayImage {
    match kind {
        VariationKind::Shift { dx, dy } => shift(gray, dx, dy),
        VariationKind::Rotate { degrees } => rotate(gray, degrees),
        VariationKind::Brightness { factor } => scale_brightness(gray, factor),
    }
}

/// Translate by `(dx, dy)` pixels, repeating the edge row/column into the gap.
fn shift(gray: &GrayImage, dx: i32, dy: i32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let max_x = w as i32 - 1;
    let max_y = h as i32 - 1;
    GrayImage::from_fn(w, h, |x, y| {
        let sx = (x as i32 - dx).clamp(0, max_x) as u32;
        let sy = (y as i32 - dy).clamp(0, max_y) as u32;
        *gray.get_pixel(sx, sy)
    })
}

/// Rotate about the image center with bilinear sampling.
///
/// Each output pixel is mapped back through the inverse rotation; samples
/// that fall outside the source are clamped to the nearest edge pixel.
fn rotate(gray: &GrayImage, degrees: f32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;

    let sample = |x: i32, y: i32| -> f32 {
        let x = x.clamp(0, w as i32 - 1) as u32;
        let y = y.clamp(0, h as i32 - 1) as u32;
        gray.get_pixel(x, y)[0] as f32
    };

    GrayImage::from_fn(w, h, |ox, oy| {
        let dx = ox as f32 - cx;
        let dy = oy as f32 - cy;
        let sx = cos * dx + sin * dy + cx;
        let sy = -sin * dx + cos * dy + cy;

        let x0 = sx.floor() as i32;
        let y0 = sy.floor() as i32;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + sample(x0 + 1, y0) * fx * (1.0 - fy)
            + sample(x0, y0 + 1) * (1.0 - fx) * fy
            + sample(x0 + 1, y0 + 1) * fx * fy;

        Luma([val.round().clamp(0.0, 255.0) as u8])
    })
}

fn scale_brightness(gray: &GrayImage, factor: f32) -> GrayImage {
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        p[0] = (p[0] as f32 * factor).round().clamp(0.0, 255.0) as u8;
    }
    out
}
