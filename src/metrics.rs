//! Per-iteration error reporting against a known ground truth

use crate::buffer::Image;
use crate::error::{Error, Result};

/// Diagnostic hook invoked once per iteration; must not touch the estimate
pub trait ErrorCalculator {
    fn calculate_error(&self, image: &Image) -> Result<f32>;
}

impl<F> ErrorCalculator for F
where
    F: Fn(&Image) -> Result<f32>,
{
    fn calculate_error(&self, image: &Image) -> Result<f32> {
        self(image)
    }
}

/// Root-mean-square difference over every sample
#[derive(Debug, Clone)]
pub struct RmsError {
    ground_truth: Image,
}

impl RmsError {
    pub fn new(ground_truth: Image) -> Self {
        Self { ground_truth }
    }
}

impl ErrorCalculator for RmsError {
    fn calculate_error(&self, image: &Image) -> Result<f32> {
        let truth = &self.ground_truth;
        if image.dimensions() != truth.dimensions() {
            return Err(Error::DimensionMismatch {
                expected: truth.dimensions(),
                got: image.dimensions(),
            });
        }
        if image.channels() != truth.channels() {
            return Err(Error::ChannelMismatch {
                expected: truth.channels(),
                got: image.channels(),
            });
        }
        if image.data().is_empty() {
            return Ok(0.0);
        }

        let sum: f64 = image
            .data()
            .iter()
            .zip(truth.data())
            .map(|(&a, &b)| {
                let d = (a - b) as f64;
                d * d
            })
            .sum();
        Ok((sum / image.data().len() as f64).sqrt() as f32)
    }
}
