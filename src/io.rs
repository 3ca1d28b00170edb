//! Image file loading and saving
//!
//! Files go through the `image` crate as 8-bit gray or RGB and come back as
//! [`Image`] buffers normalized to `[0, 1]`. Also holds the helpers used to
//! prepare inputs: resizing an initial guess and adding synthetic noise.

use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::noise::gaussian_noise;
use tracing::info;

use crate::buffer::Image;

/// Load an image file, converting to gray when `gray` is set or the file has no color
pub fn load_image(path: &Path, gray: bool) -> Result<Image> {
    let dynamic = image::open(path)
        .with_context(|| format!("Failed to load image from {:?}", path))?;

    let image = from_dynamic(&dynamic, gray || !dynamic.color().has_color())?;
    info!(
        "Loaded {:?}: {}x{} ({} ch)",
        path,
        image.width(),
        image.height(),
        image.channels()
    );
    Ok(image)
}

/// Save an image as 8-bit, clamping samples into `[0, 1]` first
pub fn save_image(path: &Path, image: &Image) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output directory {:?}", parent))?;
        }
    }

    to_dynamic(image)?
        .save(path)
        .with_context(|| format!("Failed to save image to {:?}", path))?;

    info!("Saved {}x{} image to {:?}", image.width(), image.height(), path);
    Ok(())
}

/// Resample to `width x height` with a triangle filter
pub fn resize(image: &Image, width: usize, height: usize) -> Result<Image> {
    if image.dimensions() == (width, height) {
        return Ok(image.clone());
    }

    let (w, h) = (image.width() as u32, image.height() as u32);
    let data = image.data().to_vec();
    let resized = match image.channels() {
        1 => {
            let buf: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_raw(w, h, data)
                .context("Image buffer does not match its dimensions")?;
            imageops::resize(&buf, width as u32, height as u32, FilterType::Triangle).into_raw()
        }
        _ => {
            let buf: ImageBuffer<Rgb<f32>, Vec<f32>> = ImageBuffer::from_raw(w, h, data)
                .context("Image buffer does not match its dimensions")?;
            imageops::resize(&buf, width as u32, height as u32, FilterType::Triangle).into_raw()
        }
    };

    Ok(Image::from_data(width, height, image.channels(), resized)?)
}

/// Add zero-mean Gaussian noise with standard deviation `sigma` (in `[0, 1]` units).
///
/// The result is quantized to 8 bits, like a saved observation would be.
pub fn add_gaussian_noise(image: &Image, sigma: f32, seed: u64) -> Result<Image> {
    let stddev = sigma as f64 * 255.0;
    let noisy = match to_dynamic(image)? {
        DynamicImage::ImageLuma8(gray) => {
            DynamicImage::ImageLuma8(gaussian_noise(&gray, 0.0, stddev, seed))
        }
        DynamicImage::ImageRgb8(rgb) => {
            DynamicImage::ImageRgb8(gaussian_noise(&rgb, 0.0, stddev, seed))
        }
        other => other,
    };
    from_dynamic(&noisy, image.channels() == 1)
}

fn from_dynamic(dynamic: &DynamicImage, gray: bool) -> Result<Image> {
    let (w, h) = (dynamic.width() as usize, dynamic.height() as usize);
    let (channels, raw) = if gray {
        (1, dynamic.to_luma8().into_raw())
    } else {
        (3, dynamic.to_rgb8().into_raw())
    };
    let data = raw.into_iter().map(|v| v as f32 / 255.0).collect();
    Ok(Image::from_data(w, h, channels, data)?)
}

fn to_dynamic(image: &Image) -> Result<DynamicImage> {
    let (w, h) = (image.width() as u32, image.height() as u32);
    let raw: Vec<u8> = image
        .data()
        .iter()
        .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();

    let dynamic = match image.channels() {
        1 => DynamicImage::ImageLuma8(
            GrayImage::from_raw(w, h, raw).context("Failed to create gray image buffer")?,
        ),
        _ => DynamicImage::ImageRgb8(
            RgbImage::from_raw(w, h, raw).context("Failed to create RGB image buffer")?,
        ),
    };
    Ok(dynamic)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(channels: usize) -> Image {
        let mut img = Image::new(6, 4, channels).unwrap();
        for y in 0..4 {
            for x in 0..6 {
                for c in 0..channels {
                    img.set(x, y, c, if (x + y) % 2 == 0 { 0.8 } else { 0.2 });
                }
            }
        }
        img
    }

    #[test]
    fn test_save_and_load_png() {
        let dir = std::env::temp_dir().join(format!("projective-deblur-io-{}", std::process::id()));
        let path = dir.join("checker.png");
        let img = checker(3);

        save_image(&path, &img).unwrap();
        let loaded = load_image(&path, false).unwrap();
        let gray = load_image(&path, true).unwrap();
        let _ = std::fs::remove_dir_all(&dir);

        assert_eq!(loaded.channels(), 3);
        assert_eq!(gray.channels(), 1);
        for (a, b) in loaded.data().iter().zip(img.data()) {
            assert!((a - b).abs() <= 0.5 / 255.0 + 1e-6);
        }
    }

    #[test]
    fn test_resize_dimensions() {
        let img = checker(1);
        let bigger = resize(&img, 12, 9).unwrap();
        assert_eq!(bigger.dimensions(), (12, 9));
        assert_eq!(bigger.channels(), 1);

        let rgb = resize(&checker(3), 3, 2).unwrap();
        assert_eq!(rgb.data().len(), 3 * 2 * 3);
    }

    #[test]
    fn test_gaussian_noise() {
        let img = Image::filled(16, 16, 1, 0.5).unwrap();
        let clean = add_gaussian_noise(&img, 0.0, 7).unwrap();
        assert!(clean.data().iter().all(|v| (v - 0.5).abs() <= 0.5 / 255.0 + 1e-6));

        let noisy = add_gaussian_noise(&img, 0.1, 7).unwrap();
        assert_eq!(noisy.dimensions(), (16, 16));
        assert!(noisy.data().iter().any(|v| (v - 0.5).abs() > 2.0 / 255.0));
    }
}
