//! Floating-point image buffers
//!
//! Samples are stored row-major and interleaved (`(y * width + x) * channels + c`),
//! the same layout the warping code walks with a row stride. Values are
//! expected to lie in `[0, 1]`; the deblurrer clamps after every update.

use crate::error::{Error, Result};

/// A dense grayscale or RGB image with `f32` samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<f32>,
}

impl Default for Image {
    /// An empty single-channel image
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            channels: 1,
            data: Vec::new(),
        }
    }
}

impl Image {
    /// Create a zero-filled image
    pub fn new(width: usize, height: usize, channels: usize) -> Result<Self> {
        Self::filled(width, height, channels, 0.0)
    }

    /// Create an image with every sample set to `value`
    pub fn filled(width: usize, height: usize, channels: usize, value: f32) -> Result<Self> {
        check_channels(channels)?;
        Ok(Self {
            width,
            height,
            channels,
            data: vec![value; width * height * channels],
        })
    }

    /// Wrap an existing interleaved sample vector
    pub fn from_data(width: usize, height: usize, channels: usize, data: Vec<f32>) -> Result<Self> {
        check_channels(channels)?;
        let expected = width * height * channels;
        if data.len() != expected {
            return Err(Error::BufferSize {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// `(width, height)`
    #[inline]
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Number of pixels (not samples)
    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Samples per row
    #[inline]
    pub fn stride(&self) -> usize {
        self.width * self.channels
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, c: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + c]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, c: usize, value: f32) {
        self.data[(y * self.width + x) * self.channels + c] = value;
    }

    /// Reshape to the requested size, reusing the allocation.
    ///
    /// The buffer always ends up exactly `width * height * channels` long;
    /// sample contents are unspecified afterwards.
    pub fn resize(&mut self, width: usize, height: usize, channels: usize) -> Result<()> {
        check_channels(channels)?;
        self.width = width;
        self.height = height;
        self.channels = channels;
        self.data.resize(width * height * channels, 0.0);
        Ok(())
    }

    /// Clamp every sample into `[0, 1]`
    pub fn clamp_unit(&mut self) {
        for v in &mut self.data {
            *v = v.clamp(0.0, 1.0);
        }
    }
}

fn check_channels(channels: usize) -> Result<()> {
    match channels {
        1 | 3 => Ok(()),
        n => Err(Error::UnsupportedChannels(n)),
    }
}
