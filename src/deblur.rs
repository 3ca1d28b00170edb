//! Richardson-Lucy deconvolution under a projective motion blur model
//!
//! One iteration:
//! 1. blur the estimate `U` forward to predict the observation `Ŝ`
//! 2. residual `Δ = B / max(Ŝ, 0.001)` (Poisson) or `Δ = B - Ŝ` (Gaussian)
//! 3. backproject `Δ` through the backward blur to get `E`
//! 4. compute the regularizer correction `R` from `U` before the update
//! 5. `U *= E / (1 + λR)` (Poisson) or `U += E - λR` (Gaussian), then clamp to `[0, 1]`
//!
//! The backward blur reuses the forward weights; it is only approximately
//! the adjoint, so convergence is empirical.

use std::time::{Duration, Instant};

use clap::ValueEnum;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::buffer::Image;
use crate::error::{Error, Result};
use crate::metrics::ErrorCalculator;
use crate::motion::{Direction, MotionBlurModel};
use crate::regularizer::{Regularizer, DENOMINATOR_FLOOR};

/// Floor on the predicted blur in the Poisson ratio
pub const RESIDUAL_FLOOR: f32 = 0.001;

/// Sensor noise model selecting the update rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NoiseModel {
    /// Multiplicative Richardson-Lucy update
    #[default]
    Poisson,
    /// Additive residual update
    Gaussian,
}

/// Per-run parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeblurParams {
    pub iterations: usize,
    pub noise: NoiseModel,
    /// Regularization strength λ
    pub lambda: f32,
}

impl Default for DeblurParams {
    fn default() -> Self {
        Self {
            iterations: 100,
            noise: NoiseModel::Poisson,
            lambda: 0.5,
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, Default)]
pub struct DeblurReport {
    /// Error of the initial estimate, when an error calculator was supplied
    pub initial_error: Option<f32>,
    /// Error after each iteration, when an error calculator was supplied
    pub errors: Vec<f32>,
    pub elapsed: Duration,
}

impl DeblurReport {
    pub fn final_error(&self) -> Option<f32> {
        self.errors.last().copied().or(self.initial_error)
    }
}

/// Iteration driver holding its working buffers between calls.
///
/// Buffers are resized to the exact request at the start of every call.
pub struct RlDeblurrer<'a> {
    model: &'a MotionBlurModel,
    unit_weight: Vec<f32>,
    predicted: Image,
    predicted_weight: Vec<f32>,
    residual: Image,
    correction: Image,
    correction_weight: Vec<f32>,
    prior: Image,
}

impl<'a> RlDeblurrer<'a> {
    pub fn new(model: &'a MotionBlurModel) -> Self {
        Self {
            model,
            unit_weight: Vec::new(),
            predicted: Image::default(),
            predicted_weight: Vec::new(),
            residual: Image::default(),
            correction: Image::default(),
            correction_weight: Vec::new(),
            prior: Image::default(),
        }
    }

    /// Run `params.iterations` updates of `estimate` against the observed `blurred` image.
    ///
    /// `estimate` is the latent image and may be larger than `blurred`; both
    /// must have the same channel count. `error`, when given, is evaluated on
    /// the initial estimate and after every iteration. A calculator that
    /// fails is dropped with a warning; it never changes the result.
    pub fn deblur(
        &mut self,
        blurred: &Image,
        estimate: &mut Image,
        params: &DeblurParams,
        regularizer: &Regularizer,
        error: Option<&dyn ErrorCalculator>,
    ) -> Result<DeblurReport> {
        if blurred.channels() != estimate.channels() {
            return Err(Error::ChannelMismatch {
                expected: blurred.channels(),
                got: estimate.channels(),
            });
        }
        for img in [blurred, &*estimate] {
            if img.pixel_count() == 0 {
                return Err(Error::EmptyImage {
                    width: img.width(),
                    height: img.height(),
                });
            }
        }

        self.prepare(blurred, estimate)?;

        info!(
            "Deblurring {}x{} -> {}x{} ({} ch), {} iterations, {:?} noise, {} regularizer, lambda {}",
            blurred.width(),
            blurred.height(),
            estimate.width(),
            estimate.height(),
            estimate.channels(),
            params.iterations,
            params.noise,
            regularizer.kind().as_str(),
            params.lambda
        );

        let start = Instant::now();
        let mut report = DeblurReport::default();
        let mut error = error;

        if let Some(calc) = error {
            match calc.calculate_error(estimate) {
                Ok(e) => {
                    debug!("Initial error: {:.6}", e);
                    report.initial_error = Some(e);
                }
                Err(e) => {
                    warn!("Error calculator failed, disabling it: {}", e);
                    error = None;
                }
            }
        }

        for iteration in 0..params.iterations {
            self.iterate(blurred, estimate, params, regularizer)?;

            if let Some(calc) = error {
                match calc.calculate_error(estimate) {
                    Ok(e) => {
                        debug!("Iteration {}: error {:.6}", iteration + 1, e);
                        report.errors.push(e);
                    }
                    Err(e) => {
                        warn!("Error calculator failed, disabling it: {}", e);
                        error = None;
                    }
                }
            }
        }

        report.elapsed = start.elapsed();
        info!(
            "Finished {} iterations in {:.2?}",
            params.iterations, report.elapsed
        );

        Ok(report)
    }

    fn prepare(&mut self, blurred: &Image, estimate: &Image) -> Result<()> {
        let ch = estimate.channels();
        let (bw, bh) = blurred.dimensions();
        let (w, h) = estimate.dimensions();

        self.unit_weight.clear();
        self.unit_weight.resize(w * h, 1.0);
        self.predicted.resize(bw, bh, ch)?;
        self.predicted_weight.resize(bw * bh, 0.0);
        self.residual.resize(bw, bh, ch)?;
        self.correction.resize(w, h, ch)?;
        self.correction_weight.resize(w * h, 0.0);
        self.prior.resize(w, h, ch)?;
        Ok(())
    }

    fn iterate(
        &mut self,
        blurred: &Image,
        estimate: &mut Image,
        params: &DeblurParams,
        regularizer: &Regularizer,
    ) -> Result<()> {
        let model = self.model;

        model.blur(
            estimate,
            &self.unit_weight,
            &mut self.predicted,
            &mut self.predicted_weight,
            Direction::Forward,
        )?;

        let noise = params.noise;
        self.residual
            .data_mut()
            .par_iter_mut()
            .zip(blurred.data().par_iter())
            .zip(self.predicted.data().par_iter())
            .for_each(|((d, &b), &s)| {
                *d = match noise {
                    NoiseModel::Poisson => b / s.max(RESIDUAL_FLOOR),
                    NoiseModel::Gaussian => b - s,
                };
            });

        model.blur(
            &self.residual,
            &self.predicted_weight,
            &mut self.correction,
            &mut self.correction_weight,
            Direction::Backward,
        )?;

        let lambda = params.lambda;
        if regularizer.is_none() {
            estimate
                .data_mut()
                .par_iter_mut()
                .zip(self.correction.data().par_iter())
                .for_each(|(u, &e)| {
                    let v = match noise {
                        NoiseModel::Poisson => *u * e,
                        NoiseModel::Gaussian => *u + e,
                    };
                    *u = v.clamp(0.0, 1.0);
                });
        } else {
            regularizer.correction(estimate, &mut self.prior)?;
            estimate
                .data_mut()
                .par_iter_mut()
                .zip(self.correction.data().par_iter())
                .zip(self.prior.data().par_iter())
                .for_each(|((u, &e), &r)| {
                    let v = match noise {
                        NoiseModel::Poisson => {
                            *u * e / (1.0 + lambda * r).max(DENOMINATOR_FLOOR)
                        }
                        NoiseModel::Gaussian => *u + e - lambda * r,
                    };
                    *u = v.clamp(0.0, 1.0);
                });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::homography::MotionParameters;
    use crate::metrics::RmsError;
    use crate::regularizer::{PriorConfig, RegularizerKind};

    fn gradient(width: usize, height: usize) -> Image {
        let mut img = Image::new(width, height, 1).unwrap();
        for y in 0..height {
            for x in 0..width {
                img.set(x, y, 0, (x + y) as f32 / (width + height - 2) as f32);
            }
        }
        img
    }

    fn rotating_model(samples: usize) -> MotionBlurModel {
        let mut model = MotionBlurModel::new(samples);
        model
            .set_global_parameters(&MotionParameters {
                rotation_deg: 5.0,
                scale: 1.1,
                ..Default::default()
            })
            .unwrap();
        model
    }

    fn blur(model: &MotionBlurModel, sharp: &Image) -> Image {
        let mut out = Image::new(sharp.width(), sharp.height(), sharp.channels()).unwrap();
        let mut weight = vec![0.0; sharp.pixel_count()];
        model
            .blur_unit_weight(sharp, &mut out, &mut weight, Direction::Forward)
            .unwrap();
        out
    }

    #[test]
    fn test_basic_rl_reduces_error() {
        let truth = gradient(64, 64);
        let model = rotating_model(30);
        let blurred = blur(&model, &truth);

        let mut estimate = Image::filled(64, 64, 1, 0.5).unwrap();
        let rms = RmsError::new(truth);
        let params = DeblurParams {
            iterations: 50,
            noise: NoiseModel::Poisson,
            lambda: 0.0,
        };

        let report = RlDeblurrer::new(&model)
            .deblur(&blurred, &mut estimate, &params, &Regularizer::None, Some(&rms))
            .unwrap();

        let initial = report.initial_error.unwrap();
        let last = report.final_error().unwrap();
        assert_eq!(report.errors.len(), 50);
        assert!(
            last < initial,
            "final error {} should be below initial error {}",
            last,
            initial
        );
    }

    #[test]
    fn test_estimate_stays_clamped() {
        let truth = gradient(24, 20);
        let model = rotating_model(10);
        let mut blurred = blur(&model, &truth);
        // push some observations to the extremes
        blurred.set(3, 3, 0, 1.0);
        blurred.set(10, 12, 0, 0.0);

        let in_range = Cell::new(true);
        let check_range = |img: &Image| -> Result<f32> {
            if !img.data().iter().all(|v| (0.0..=1.0).contains(v)) {
                in_range.set(false);
            }
            Ok(0.0)
        };

        let prior = PriorConfig::default();
        for kind in [
            RegularizerKind::None,
            RegularizerKind::TotalVariation,
            RegularizerKind::SparseGradient,
            RegularizerKind::Bilateral,
            RegularizerKind::BilateralLaplacian,
        ] {
            for noise in [NoiseModel::Poisson, NoiseModel::Gaussian] {
                let mut estimate = blurred.clone();
                let params = DeblurParams {
                    iterations: 8,
                    noise,
                    lambda: 5.0,
                };
                RlDeblurrer::new(&model)
                    .deblur(
                        &blurred,
                        &mut estimate,
                        &params,
                        &Regularizer::new(kind, &prior),
                        Some(&check_range),
                    )
                    .unwrap();
            }
        }
        assert!(in_range.get());
    }

    #[test]
    fn test_error_calculator_has_no_side_effect() {
        let truth = gradient(20, 16);
        let model = rotating_model(6);
        let blurred = blur(&model, &truth);
        let reg = Regularizer::new(RegularizerKind::TotalVariation, &PriorConfig::default());
        let params = DeblurParams {
            iterations: 5,
            ..Default::default()
        };

        let mut with = blurred.clone();
        let mut without = blurred.clone();
        let rms = RmsError::new(truth);
        let mut deblurrer = RlDeblurrer::new(&model);
        deblurrer
            .deblur(&blurred, &mut with, &params, &reg, Some(&rms))
            .unwrap();
        let report = deblurrer
            .deblur(&blurred, &mut without, &params, &reg, None)
            .unwrap();

        assert_eq!(with, without);
        assert!(report.errors.is_empty());
        assert!(report.initial_error.is_none());
    }

    #[test]
    fn test_failing_error_calculator_is_dropped() {
        let model = rotating_model(4);
        let blurred = blur(&model, &gradient(16, 16));
        // ground truth at the observed size, estimate at a larger latent size
        let rms = RmsError::new(gradient(16, 16));
        let params = DeblurParams {
            iterations: 4,
            ..Default::default()
        };

        let mut with = Image::filled(20, 20, 1, 0.5).unwrap();
        let mut without = with.clone();
        let mut deblurrer = RlDeblurrer::new(&model);
        let report = deblurrer
            .deblur(&blurred, &mut with, &params, &Regularizer::None, Some(&rms))
            .unwrap();
        deblurrer
            .deblur(&blurred, &mut without, &params, &Regularizer::None, None)
            .unwrap();

        assert_eq!(with, without);
        assert!(report.initial_error.is_none());
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_sharp_image_is_fixed_point_of_identity_model() {
        let mut truth = gradient(16, 16);
        for v in truth.data_mut() {
            *v = 0.2 + 0.6 * *v;
        }
        let model = MotionBlurModel::new(1);
        let mut estimate = truth.clone();

        RlDeblurrer::new(&model)
            .deblur(
                &truth,
                &mut estimate,
                &DeblurParams {
                    iterations: 10,
                    ..Default::default()
                },
                &Regularizer::None,
                None,
            )
            .unwrap();

        for (a, b) in estimate.data().iter().zip(truth.data()) {
            assert!((a - b).abs() < 1e-5, "expected {}, got {}", b, a);
        }
    }

    #[test]
    fn test_larger_latent_and_rgb() {
        let model = rotating_model(5);
        let blurred = Image::filled(16, 12, 3, 0.3).unwrap();
        let mut estimate = Image::filled(20, 16, 3, 0.5).unwrap();
        let reg = Regularizer::new(RegularizerKind::Bilateral, &PriorConfig::default());

        RlDeblurrer::new(&model)
            .deblur(
                &blurred,
                &mut estimate,
                &DeblurParams {
                    iterations: 3,
                    noise: NoiseModel::Gaussian,
                    lambda: 0.1,
                },
                &reg,
                None,
            )
            .unwrap();

        assert_eq!(estimate.dimensions(), (20, 16));
        assert!(estimate.data().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let model = MotionBlurModel::new(2);
        let blurred = Image::new(8, 8, 1).unwrap();
        let mut estimate = Image::new(8, 8, 3).unwrap();
        let result = RlDeblurrer::new(&model).deblur(
            &blurred,
            &mut estimate,
            &DeblurParams::default(),
            &Regularizer::None,
            None,
        );
        assert!(matches!(
            result,
            Err(Error::ChannelMismatch { expected: 1, got: 3 })
        ));
    }
}
