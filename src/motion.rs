//! Projective motion blur model
//!
//! Camera motion during one exposure is approximated by `N` sampled
//! homographies `H₀..H_{N-1}` with `H₀ = I`. A blurred observation is the
//! weighted average of the latent image warped through every sample, and the
//! same machinery run through the forward transforms backprojects a residual
//! onto the latent grid.
//!
//! Both frames use coordinates centered on their own midpoint, so the latent
//! image may be larger than the observed one.

use rayon::prelude::*;
use tracing::debug;

use crate::buffer::Image;
use crate::error::{Error, Result};
use crate::homography::{Homography, MotionParameters};

/// Default number of motion samples per exposure
pub const DEFAULT_SAMPLES: usize = 30;

/// Validity weight given to pixels that map outside the source image
pub const MIN_WEIGHT: f32 = 0.01;

const MAX_CHANNELS: usize = 3;

/// Which way a warp or blur runs through the motion samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Latent → observed: sample `i` is looked up through `H_i⁻¹`
    Forward,
    /// Observed → latent (adjoint): sample `i` is looked up through `H_i`
    Backward,
}

/// Sequence of sampled homographies describing one exposure
#[derive(Debug, Clone)]
pub struct MotionBlurModel {
    homographies: Vec<Homography>,
}

impl Default for MotionBlurModel {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLES)
    }
}

impl MotionBlurModel {
    /// Create a model of `samples` identity homographies (at least one)
    pub fn new(samples: usize) -> Self {
        Self {
            homographies: vec![Homography::identity(); samples.max(1)],
        }
    }

    /// Build `N` poses interpolated linearly from identity to `params`.
    ///
    /// Sample `i` uses fraction `i / (N - 1)`, so the first sample is the
    /// identity and the last is the full motion.
    pub fn set_global_parameters(&mut self, params: &MotionParameters) -> Result<()> {
        let homographies = self
            .fractions()
            .map(|t| Homography::from_parameters(&params.lerp_from_identity(t)))
            .collect::<Result<Vec<_>>>()?;
        self.homographies = homographies;
        debug!(
            "Motion model: {} samples, rotation {:.3} deg, scale {:.4}, shift ({:.2}, {:.2})",
            self.homographies.len(),
            params.rotation_deg,
            params.scale,
            params.dx,
            params.dy
        );
        Ok(())
    }

    /// Interpolate the matrix entries linearly from identity to `end`
    pub fn set_end_homography(&mut self, end: &Homography) -> Result<()> {
        let homographies = self
            .fractions()
            .map(|t| end.interpolate_from_identity(t))
            .collect::<Result<Vec<_>>>()?;
        self.homographies = homographies;
        Ok(())
    }

    /// Motion fraction `i / (N - 1)` of every sample
    fn fractions(&self) -> impl Iterator<Item = f64> {
        let n = self.homographies.len();
        (0..n).map(move |i| if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 })
    }

    /// Replace the samples with an explicit sequence
    pub fn set_homographies(&mut self, homographies: Vec<Homography>) -> Result<()> {
        if homographies.is_empty() {
            return Err(Error::EmptyMotion);
        }
        self.homographies = homographies;
        Ok(())
    }

    #[inline]
    pub fn samples(&self) -> usize {
        self.homographies.len()
    }

    pub fn homography(&self, index: usize) -> Option<&Homography> {
        self.homographies.get(index)
    }

    /// Warp `input` through a single motion sample.
    ///
    /// `output` must already have the target dimensions and the input's
    /// channel count; `output_weight` holds one validity weight per output
    /// pixel. Every weight written is at least [`MIN_WEIGHT`].
    pub fn warp(
        &self,
        sample: usize,
        direction: Direction,
        input: &Image,
        input_weight: &[f32],
        output: &mut Image,
        output_weight: &mut [f32],
    ) -> Result<()> {
        let h = self
            .homographies
            .get(sample)
            .ok_or(Error::SampleOutOfRange {
                index: sample,
                samples: self.homographies.len(),
            })?;
        check_buffers(input, input_weight, output, output_weight)?;

        let h = oriented(h, direction);
        let sampler = Sampler::new(input, input_weight, output);
        let ch = input.channels();
        let out_w = output.width();

        output
            .data_mut()
            .par_chunks_mut(out_w * ch)
            .zip(output_weight.par_chunks_mut(out_w))
            .enumerate()
            .for_each(|(y, (row, wrow))| {
                for x in 0..out_w {
                    let px = &mut row[x * ch..(x + 1) * ch];
                    wrow[x] = sampler.sample(&h, x, y, px);
                }
            });

        Ok(())
    }

    /// Accumulate `input` warped through every sample into `output`.
    ///
    /// Each output pixel becomes `Σ wᵢ·vᵢ / Σ wᵢ` over the samples, summed in
    /// sample order; `output_weight` receives `Σ wᵢ`. The validity weight is
    /// computed once per pixel and shared by all channels.
    pub fn blur(
        &self,
        input: &Image,
        input_weight: &[f32],
        output: &mut Image,
        output_weight: &mut [f32],
        direction: Direction,
    ) -> Result<()> {
        check_buffers(input, input_weight, output, output_weight)?;

        let samples: Vec<Homography> = self
            .homographies
            .iter()
            .map(|h| oriented(h, direction))
            .collect();
        let sampler = Sampler::new(input, input_weight, output);
        let ch = input.channels();
        let out_w = output.width();

        output
            .data_mut()
            .par_chunks_mut(out_w * ch)
            .zip(output_weight.par_chunks_mut(out_w))
            .enumerate()
            .for_each(|(y, (row, wrow))| {
                row.fill(0.0);
                wrow.fill(0.0);

                let mut px = [0.0f32; MAX_CHANNELS];
                for h in &samples {
                    for x in 0..out_w {
                        let w = sampler.sample(h, x, y, &mut px[..ch]);
                        wrow[x] += w;
                        for c in 0..ch {
                            row[x * ch + c] += px[c] * w;
                        }
                    }
                }

                for x in 0..out_w {
                    let w = wrow[x];
                    for v in &mut row[x * ch..(x + 1) * ch] {
                        *v /= w;
                    }
                }
            });

        Ok(())
    }

    /// [`blur`](Self::blur) with a unit validity weight on every input pixel
    pub fn blur_unit_weight(
        &self,
        input: &Image,
        output: &mut Image,
        output_weight: &mut [f32],
        direction: Direction,
    ) -> Result<()> {
        let ones = vec![1.0f32; input.pixel_count()];
        self.blur(input, &ones, output, output_weight, direction)
    }
}

fn oriented(h: &Homography, direction: Direction) -> Homography {
    match direction {
        Direction::Forward => h.invert(),
        Direction::Backward => h.clone(),
    }
}

fn check_buffers(
    input: &Image,
    input_weight: &[f32],
    output: &Image,
    output_weight: &[f32],
) -> Result<()> {
    for img in [input, output] {
        if img.pixel_count() == 0 {
            return Err(Error::EmptyImage {
                width: img.width(),
                height: img.height(),
            });
        }
    }
    if input.channels() != output.channels() {
        return Err(Error::ChannelMismatch {
            expected: input.channels(),
            got: output.channels(),
        });
    }
    if input_weight.len() != input.pixel_count() {
        return Err(Error::BufferSize {
            expected: input.pixel_count(),
            got: input_weight.len(),
        });
    }
    if output_weight.len() != output.pixel_count() {
        return Err(Error::BufferSize {
            expected: output.pixel_count(),
            got: output_weight.len(),
        });
    }
    Ok(())
}

/// Per-pixel lookup of a source image through a homography
struct Sampler<'a> {
    src: &'a [f32],
    src_weight: &'a [f32],
    width: usize,
    height: usize,
    channels: usize,
    src_cx: f64,
    src_cy: f64,
    dst_cx: f64,
    dst_cy: f64,
}

impl<'a> Sampler<'a> {
    fn new(input: &'a Image, input_weight: &'a [f32], output: &Image) -> Self {
        Self {
            src: input.data(),
            src_weight: input_weight,
            width: input.width(),
            height: input.height(),
            channels: input.channels(),
            src_cx: input.width() as f64 / 2.0,
            src_cy: input.height() as f64 / 2.0,
            dst_cx: output.width() as f64 / 2.0,
            dst_cy: output.height() as f64 / 2.0,
        }
    }

    /// Write the interpolated source value for destination pixel `(x, y)`
    /// into `out` and return its validity weight
    #[inline]
    fn sample(&self, h: &Homography, x: usize, y: usize, out: &mut [f32]) -> f32 {
        let (sx, sy) = h.transform(x as f64 - self.dst_cx, y as f64 - self.dst_cy);
        let sx = sx + self.src_cx;
        let sy = sy + self.src_cy;

        let max_x = (self.width - 1) as f64;
        let max_y = (self.height - 1) as f64;
        let inside = sx >= 0.0 && sx <= max_x && sy >= 0.0 && sy <= max_y;

        let sx = clamp_coord(sx, max_x);
        let sy = clamp_coord(sy, max_y);

        let stride = self.width * self.channels;
        bilinear_sample(
            self.src,
            stride,
            self.width,
            self.height,
            self.channels,
            sx,
            sy,
            out,
        );

        if inside {
            let mut w = [0.0f32; 1];
            bilinear_sample(
                self.src_weight,
                self.width,
                self.width,
                self.height,
                1,
                sx,
                sy,
                &mut w,
            );
            w[0].max(MIN_WEIGHT)
        } else {
            MIN_WEIGHT
        }
    }
}

#[inline]
fn clamp_coord(v: f64, max: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, max)
    }
}

/// Bilinear interpolation of an interleaved buffer at an in-range coordinate
#[inline]
#[allow(clippy::too_many_arguments)]
fn bilinear_sample(
    src: &[f32],
    stride: usize,
    width: usize,
    height: usize,
    channels: usize,
    x: f64,
    y: f64,
    out: &mut [f32],
) {
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = (x - x0 as f64) as f32;
    let fy = (y - y0 as f64) as f32;

    for (c, o) in out.iter_mut().enumerate().take(channels) {
        let p00 = src[y0 * stride + x0 * channels + c];
        let p10 = src[y0 * stride + x1 * channels + c];
        let p01 = src[y1 * stride + x0 * channels + c];
        let p11 = src[y1 * stride + x1 * channels + c];

        *o = p00 * (1.0 - fx) * (1.0 - fy)
            + p10 * fx * (1.0 - fy)
            + p01 * (1.0 - fx) * fy
            + p11 * fx * fy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: usize, height: usize) -> Image {
        let mut img = Image::new(width, height, 1).unwrap();
        for y in 0..height {
            for x in 0..width {
                img.set(x, y, 0, (x + y) as f32 / (width + height - 2) as f32);
            }
        }
        img
    }

    #[test]
    fn test_identity_blur_is_noop() {
        let model = MotionBlurModel::new(1);
        let input = gradient(16, 12);
        let mut output = Image::new(16, 12, 1).unwrap();
        let mut weight = vec![0.0; 16 * 12];

        model
            .blur_unit_weight(&input, &mut output, &mut weight, Direction::Forward)
            .unwrap();

        for (a, b) in input.data().iter().zip(output.data()) {
            assert!((a - b).abs() < 1e-6, "expected {}, got {}", a, b);
        }
        assert!(weight.iter().all(|&w| (w - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_global_parameters_endpoints() {
        let mut model = MotionBlurModel::new(5);
        let params = MotionParameters {
            rotation_deg: 4.0,
            scale: 1.2,
            dx: 3.0,
            ..Default::default()
        };
        model.set_global_parameters(&params).unwrap();

        assert_eq!(model.samples(), 5);
        assert_eq!(model.homography(0), Some(&Homography::identity()));
        let last = Homography::from_parameters(&params).unwrap();
        let fitted_last = model.homography(4).unwrap();
        for &(x, y) in &[(10.0, -5.0), (-7.0, 3.0)] {
            let (a, b) = fitted_last.transform(x, y);
            let (c, d) = last.transform(x, y);
            assert!((a - c).abs() < 1e-9 && (b - d).abs() < 1e-9);
        }

        let mid = model.homography(2).unwrap();
        let (x, y) = mid.transform(0.0, 0.0);
        assert!((x - 1.5).abs() < 1e-12 && y.abs() < 1e-12);
    }

    #[test]
    fn test_failed_update_keeps_previous_samples() {
        let mut model = MotionBlurModel::new(5);
        model
            .set_global_parameters(&MotionParameters {
                rotation_deg: 4.0,
                ..Default::default()
            })
            .unwrap();
        let before = model.clone();

        // the final pose has scale 0
        let result = model.set_global_parameters(&MotionParameters {
            scale: 0.0,
            dx: 3.0,
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::SingularHomography { .. })));
        for i in 0..5 {
            assert_eq!(model.homography(i), before.homography(i));
        }

        // half of a 180 degree flip collapses to a singular matrix
        let flip = Homography::from_matrix(nalgebra::Matrix3::new(
            -1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0,
        ))
        .unwrap();
        assert!(model.set_end_homography(&flip).is_err());
        for i in 0..5 {
            assert_eq!(model.homography(i), before.homography(i));
        }
    }

    #[test]
    fn test_perspective_only_motion_is_linear() {
        let mut model = MotionBlurModel::new(5);
        model
            .set_global_parameters(&MotionParameters {
                perspective_x: 2e-3,
                perspective_y: -1e-3,
                ..Default::default()
            })
            .unwrap();

        for i in 0..5 {
            let t = i as f64 / 4.0;
            let m = model.homography(i).unwrap().matrix();
            assert!((m[(2, 0)] - 2e-3 * t).abs() < 1e-15, "sample {}", i);
            assert!((m[(2, 1)] + 1e-3 * t).abs() < 1e-15, "sample {}", i);
            assert!((m[(0, 0)] - 1.0).abs() < 1e-15 && m[(0, 2)].abs() < 1e-15);
            assert_eq!(m[(2, 2)], 1.0);
        }
    }

    #[test]
    fn test_warp_forward_shifts_content() {
        let mut model = MotionBlurModel::new(1);
        model
            .set_homographies(vec![Homography::translation(2.0, 0.0).unwrap()])
            .unwrap();

        let mut input = Image::new(8, 4, 1).unwrap();
        input.set(3, 1, 0, 1.0);
        let ones = vec![1.0; 32];
        let mut output = Image::new(8, 4, 1).unwrap();
        let mut weight = vec![0.0; 32];

        model
            .warp(0, Direction::Forward, &input, &ones, &mut output, &mut weight)
            .unwrap();
        assert_eq!(output.get(5, 1, 0), 1.0);
        assert_eq!(output.get(3, 1, 0), 0.0);

        model
            .warp(0, Direction::Backward, &input, &ones, &mut output, &mut weight)
            .unwrap();
        assert_eq!(output.get(1, 1, 0), 1.0);
    }

    #[test]
    fn test_warp_weight_floor() {
        let mut model = MotionBlurModel::new(1);
        model
            .set_homographies(vec![Homography::translation(5.0, 0.0).unwrap()])
            .unwrap();

        let input = gradient(10, 6);
        let zeros = vec![0.0; 60];
        let mut output = Image::new(10, 6, 1).unwrap();
        let mut weight = vec![0.0; 60];

        model
            .warp(0, Direction::Forward, &input, &zeros, &mut output, &mut weight)
            .unwrap();

        assert!(weight.iter().all(|&w| w >= MIN_WEIGHT));
        // x < 5 maps left of the source and falls back to the floor
        assert_eq!(weight[0], MIN_WEIGHT);
        // out-of-range coordinates sample the clamped border
        assert_eq!(output.get(0, 2, 0), input.get(0, 2, 0));
    }

    #[test]
    fn test_constant_image_stays_constant() {
        let mut model = MotionBlurModel::new(12);
        model
            .set_global_parameters(&MotionParameters {
                rotation_deg: 6.0,
                scale: 1.1,
                perspective_x: 1e-3,
                ..Default::default()
            })
            .unwrap();

        let input = Image::filled(20, 14, 3, 0.4).unwrap();
        let mut output = Image::new(24, 18, 3).unwrap();
        let mut weight = vec![0.0; 24 * 18];
        model
            .blur_unit_weight(&input, &mut output, &mut weight, Direction::Forward)
            .unwrap();

        assert!(output.data().iter().all(|v| (v - 0.4).abs() < 1e-5));
        // f32 sums of twelve floors land just under 12 * MIN_WEIGHT
        assert!(weight.iter().all(|&w| w >= 12.0 * MIN_WEIGHT - 1e-6));
    }

    #[test]
    fn test_rgb_blur_matches_gray_per_channel() {
        let mut model = MotionBlurModel::new(8);
        model
            .set_global_parameters(&MotionParameters {
                rotation_deg: 5.0,
                dx: 1.5,
                ..Default::default()
            })
            .unwrap();

        let gray = gradient(12, 10);
        let mut rgb = Image::new(12, 10, 3).unwrap();
        for y in 0..10 {
            for x in 0..12 {
                let v = gray.get(x, y, 0);
                rgb.set(x, y, 0, v);
                rgb.set(x, y, 1, 1.0 - v);
                rgb.set(x, y, 2, v);
            }
        }

        let mut gray_out = Image::new(12, 10, 1).unwrap();
        let mut gray_w = vec![0.0; 120];
        model
            .blur_unit_weight(&gray, &mut gray_out, &mut gray_w, Direction::Forward)
            .unwrap();
        let mut rgb_out = Image::new(12, 10, 3).unwrap();
        let mut rgb_w = vec![0.0; 120];
        model
            .blur_unit_weight(&rgb, &mut rgb_out, &mut rgb_w, Direction::Forward)
            .unwrap();

        assert_eq!(gray_w, rgb_w);
        for y in 0..10 {
            for x in 0..12 {
                assert_eq!(rgb_out.get(x, y, 0), gray_out.get(x, y, 0));
                assert_eq!(rgb_out.get(x, y, 2), gray_out.get(x, y, 0));
            }
        }
    }

    #[test]
    fn test_buffer_validation() {
        let model = MotionBlurModel::new(3);
        let input = Image::new(4, 4, 1).unwrap();
        let mut output = Image::new(4, 4, 3).unwrap();
        let mut weight = vec![0.0; 16];
        assert!(matches!(
            model.blur_unit_weight(&input, &mut output, &mut weight, Direction::Forward),
            Err(Error::ChannelMismatch { expected: 1, got: 3 })
        ));

        let mut output = Image::new(4, 4, 1).unwrap();
        let ones = vec![1.0; 16];
        assert!(matches!(
            model.warp(3, Direction::Forward, &input, &ones, &mut output, &mut weight),
            Err(Error::SampleOutOfRange { index: 3, samples: 3 })
        ));
        assert!(model.clone().set_homographies(Vec::new()).is_err());
    }
}
