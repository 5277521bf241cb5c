//! Page image steps behind the engines' document options.
//!
//! `use_doc_preprocessor` maps to [`enhance`] and
//! `use_doc_orientation_classify` to [`deskew`].

use crate::engine::{bool_option, EngineOptions};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::filter::filter3x3;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};

/// Laplacian sharpening kernel
const SHARPEN_KERNEL: [f32; 9] = [0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0];

/// Coarse search range and step for skew detection, in degrees
const SKEW_RANGE_DEG: f32 = 5.0;
const SKEW_COARSE_STEP_DEG: f32 = 0.5;
const SKEW_FINE_STEP_DEG: f32 = 0.1;

/// Apply the steps enabled in `options`; absent options count as enabled
pub fn prepare(image: &DynamicImage, options: &EngineOptions) -> DynamicImage {
    let mut page = image.clone();
    if bool_option(options, "use_doc_orientation_classify", true) {
        page = deskew(&page);
    }
    if bool_option(options, "use_doc_preprocessor", true) {
        page = enhance(&page);
    }
    page
}

/// Grayscale, stretch contrast to the full range, then sharpen
pub fn enhance(image: &DynamicImage) -> DynamicImage {
    let gray = stretch_contrast(&image.to_luma8());
    DynamicImage::ImageLuma8(filter3x3(&gray, &SHARPEN_KERNEL))
}

/// Rotate the page so text rows are horizontal
pub fn deskew(image: &DynamicImage) -> DynamicImage {
    let gray = image.to_luma8();
    let angle = skew_angle(&gray);
    if angle.abs() < 0.1_f32.to_radians() {
        return image.clone();
    }

    tracing::debug!("Deskewing page by {:.2} degrees", angle.to_degrees());
    DynamicImage::ImageLuma8(rotate_about_center(
        &gray,
        angle,
        Interpolation::Bilinear,
        Luma([255u8]),
    ))
}

fn stretch_contrast(gray: &GrayImage) -> GrayImage {
    let (lo, hi) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    if hi <= lo {
        return gray.clone();
    }

    let scale = 255.0 / (hi - lo) as f32;
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let value = gray.get_pixel(x, y).0[0];
        Luma([((value - lo) as f32 * scale).round() as u8])
    })
}

/// Angle in radians that maximizes the row-profile variance of dark pixels
fn skew_angle(gray: &GrayImage) -> f32 {
    let coarse_steps = (2.0 * SKEW_RANGE_DEG / SKEW_COARSE_STEP_DEG) as i32;
    let coarse = best_angle(
        gray,
        (0..=coarse_steps).map(|step| -SKEW_RANGE_DEG + step as f32 * SKEW_COARSE_STEP_DEG),
        (0.0, row_profile_variance(gray, 0.0)),
    );

    let fine_steps = (2.0 * SKEW_COARSE_STEP_DEG / SKEW_FINE_STEP_DEG) as i32;
    let center = coarse.0;
    let (degrees, _) = best_angle(
        gray,
        (0..=fine_steps)
            .map(|step| center - SKEW_COARSE_STEP_DEG + step as f32 * SKEW_FINE_STEP_DEG),
        coarse,
    );

    degrees.to_radians()
}

/// Keep the (degrees, variance) pair with the highest variance
fn best_angle(
    gray: &GrayImage,
    candidates: impl Iterator<Item = f32>,
    start: (f32, f32),
) -> (f32, f32) {
    candidates.fold(start, |best, degrees| {
        let variance = row_profile_variance(gray, degrees.to_radians());
        if variance > best.1 {
            (degrees, variance)
        } else {
            best
        }
    })
}

fn row_profile_variance(gray: &GrayImage, angle: f32) -> f32 {
    let (width, height) = gray.dimensions();
    if height == 0 {
        return 0.0;
    }

    let (sin, cos) = angle.sin_cos();
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let mut rows = vec![0u32; height as usize];

    for (x, y, pixel) in gray.enumerate_pixels() {
        if pixel.0[0] >= 128 {
            continue;
        }
        let (dx, dy) = (x as f32 - cx, y as f32 - cy);
        let row = (dy * cos - dx * sin + cy) as i32;
        if (0..height as i32).contains(&row) {
            rows[row as usize] += 1;
        }
    }

    let mean = rows.iter().sum::<u32>() as f32 / rows.len() as f32;
    rows.iter()
        .map(|&count| (count as f32 - mean).powi(2))
        .sum::<f32>()
        / rows.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_enhance_stretches_and_grays() {
        let img = RgbImage::from_fn(10, 10, |x, _| {
            let v = 60 + x as u8 * 10;
            Rgb([v, v, v])
        });

        let out = enhance(&DynamicImage::ImageRgb8(img)).to_luma8();

        assert_eq!(out.dimensions(), (10, 10));
        let max = out.pixels().map(|p| p.0[0]).max().unwrap();
        let min = out.pixels().map(|p| p.0[0]).min().unwrap();
        assert_eq!((min, max), (0, 255));
    }

    #[test]
    fn test_stretch_contrast_leaves_uniform_image() {
        let img = GrayImage::from_pixel(4, 4, Luma([128]));
        assert_eq!(stretch_contrast(&img), img);
    }

    #[test]
    fn test_straight_line_has_no_skew() {
        let mut img = GrayImage::from_pixel(100, 50, Luma([255]));
        for x in 10..90 {
            img.put_pixel(x, 25, Luma([0]));
        }

        assert!(skew_angle(&img).abs() < 0.5_f32.to_radians());
    }

    #[test]
    fn test_deskew_preserves_dimensions() {
        let img = DynamicImage::ImageLuma8(GrayImage::new(100, 50));
        let out = deskew(&img);
        assert_eq!((out.width(), out.height()), (100, 50));
    }

    #[test]
    fn test_prepare_respects_disabled_options() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 3, Rgb([10, 200, 30])));
        let mut options = EngineOptions::new();
        options.insert("use_doc_preprocessor".to_string(), false.into());
        options.insert("use_doc_orientation_classify".to_string(), false.into());

        assert_eq!(prepare(&img, &options), img);
    }
}
