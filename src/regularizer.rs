//! Edge-preserving regularization for the Richardson-Lucy update
//!
//! Every variant turns the current estimate `U` into a per-sample correction
//! `R`, the gradient of its prior energy: positive on local maxima, negative
//! on local minima, zero on flat regions. The deblurrer folds it in as
//! `U *= E / (1 + λR)` (Poisson) or `U += E - λR` (Gaussian).
//!
//! Lookup tables are indexed by `|Δ|·255` and built once per regularizer;
//! the two bilateral variants own separate range tables.

use clap::ValueEnum;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::buffer::Image;
use crate::deblur::NoiseModel;
use crate::error::Result;

/// Number of entries in the intensity-difference lookup tables
pub const TABLE_SIZE: usize = 256;

/// Magnitude of the normalized gradient used by the TV subgradient
const GRADIENT_STEP: f32 = 1.0 / 255.0;

/// Bilateral window radius (5x5 window)
const RADIUS: isize = 2;
const WINDOW: usize = (2 * RADIUS + 1) as usize;

/// Smallest denominator allowed in the multiplicative update
pub(crate) const DENOMINATOR_FLOOR: f32 = 0.001;

/// Which prior to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RegularizerKind {
    #[default]
    None,
    TotalVariation,
    SparseGradient,
    Bilateral,
    BilateralLaplacian,
}

impl RegularizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegularizerKind::None => "none",
            RegularizerKind::TotalVariation => "total-variation",
            RegularizerKind::SparseGradient => "sparse-gradient",
            RegularizerKind::Bilateral => "bilateral",
            RegularizerKind::BilateralLaplacian => "bilateral-laplacian",
        }
    }
}

/// Shape parameters of the priors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorConfig {
    /// Hyper-Laplacian exponent α in `exp(-|g|^α / σ²)`
    #[serde(default = "default_sparse_exponent")]
    pub sparse_exponent: f32,

    /// Variance of the sparse-gradient prior
    #[serde(default = "default_sparse_variance")]
    pub sparse_variance: f32,

    /// Range variance of the standard bilateral table
    #[serde(default = "default_bilateral_variance")]
    pub bilateral_variance: f32,

    /// Range variance of the Laplacian-reweighted bilateral table
    #[serde(default = "default_bilateral_laplacian_variance")]
    pub bilateral_laplacian_variance: f32,

    /// Spatial sigma of the 5x5 bilateral window
    #[serde(default = "default_spatial_sigma")]
    pub spatial_sigma: f32,
}

fn default_sparse_exponent() -> f32 { 0.8 }
fn default_sparse_variance() -> f32 { 0.05 }
fn default_bilateral_variance() -> f32 { 0.005 }
fn default_bilateral_laplacian_variance() -> f32 { 0.0005 }
fn default_spatial_sigma() -> f32 { 1.0 }

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            sparse_exponent: default_sparse_exponent(),
            sparse_variance: default_sparse_variance(),
            bilateral_variance: default_bilateral_variance(),
            bilateral_laplacian_variance: default_bilateral_laplacian_variance(),
            spatial_sigma: default_spatial_sigma(),
        }
    }
}

/// Range and spatial weights of a 5x5 bilateral window
#[derive(Debug, Clone, PartialEq)]
pub struct BilateralKernel {
    range: Vec<f32>,
    spatial: Vec<f32>,
}

impl BilateralKernel {
    fn new(range: Vec<f32>, sigma: f32) -> Self {
        let mut spatial = Vec::with_capacity(WINDOW * WINDOW);
        for yy in -RADIUS..=RADIUS {
            for xx in -RADIUS..=RADIUS {
                let d2 = (xx * xx + yy * yy) as f32;
                spatial.push((-d2 / (2.0 * sigma * sigma)).exp());
            }
        }
        Self { range, spatial }
    }

    pub fn range_table(&self) -> &[f32] {
        &self.range
    }
}

/// A prior and the tables it needs
#[derive(Debug, Clone, PartialEq)]
pub enum Regularizer {
    None,
    TotalVariation,
    SparseGradient { weights: Vec<f32> },
    Bilateral(BilateralKernel),
    BilateralLaplacian(BilateralKernel),
}

impl Regularizer {
    pub fn new(kind: RegularizerKind, prior: &PriorConfig) -> Self {
        match kind {
            RegularizerKind::None => Regularizer::None,
            RegularizerKind::TotalVariation => Regularizer::TotalVariation,
            RegularizerKind::SparseGradient => Regularizer::SparseGradient {
                weights: sparse_gradient_table(prior.sparse_exponent, prior.sparse_variance),
            },
            RegularizerKind::Bilateral => Regularizer::Bilateral(BilateralKernel::new(
                bilateral_table(prior.bilateral_variance),
                prior.spatial_sigma,
            )),
            RegularizerKind::BilateralLaplacian => {
                Regularizer::BilateralLaplacian(BilateralKernel::new(
                    reweighted_bilateral_table(
                        prior.bilateral_laplacian_variance,
                        prior.sparse_exponent,
                    ),
                    prior.spatial_sigma,
                ))
            }
        }
    }

    pub fn kind(&self) -> RegularizerKind {
        match self {
            Regularizer::None => RegularizerKind::None,
            Regularizer::TotalVariation => RegularizerKind::TotalVariation,
            Regularizer::SparseGradient { .. } => RegularizerKind::SparseGradient,
            Regularizer::Bilateral(_) => RegularizerKind::Bilateral,
            Regularizer::BilateralLaplacian(_) => RegularizerKind::BilateralLaplacian,
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Regularizer::None)
    }

    /// Compute the correction `R` for every sample of `image` into `out`.
    ///
    /// `out` is reshaped to match `image`. Channels are processed independently.
    pub fn correction(&self, image: &Image, out: &mut Image) -> Result<()> {
        out.resize(image.width(), image.height(), image.channels())?;

        let src = image.data();
        let (w, h, ch) = (image.width(), image.height(), image.channels());
        let stride = image.stride();
        if stride == 0 {
            return Ok(());
        }

        out.data_mut()
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(y, row)| match self {
                Regularizer::None => row.fill(0.0),
                Regularizer::TotalVariation => {
                    gradient_row(src, w, h, ch, y, None, row);
                }
                Regularizer::SparseGradient { weights } => {
                    gradient_row(src, w, h, ch, y, Some(weights.as_slice()), row);
                }
                Regularizer::Bilateral(kernel) | Regularizer::BilateralLaplacian(kernel) => {
                    bilateral_row(src, w, h, ch, y, kernel, row);
                }
            });

        Ok(())
    }

    /// Compute `R` from `image` and fold it straight into `image`:
    /// `U *= 1 / (1 + λR)` for Poisson noise, `U -= λR` for Gaussian noise,
    /// followed by a clamp to `[0, 1]`.
    pub fn apply(&self, image: &mut Image, noise: NoiseModel, lambda: f32) -> Result<()> {
        if self.is_none() {
            return Ok(());
        }

        let mut r = Image::new(image.width(), image.height(), image.channels())?;
        self.correction(image, &mut r)?;

        image
            .data_mut()
            .par_iter_mut()
            .zip(r.data().par_iter())
            .for_each(|(u, &r)| {
                let v = match noise {
                    NoiseModel::Poisson => *u / (1.0 + lambda * r).max(DENOMINATOR_FLOOR),
                    NoiseModel::Gaussian => *u - lambda * r,
                };
                *u = v.clamp(0.0, 1.0);
            });

        Ok(())
    }
}

#[inline]
fn table_index(delta: f32) -> usize {
    ((delta.abs() * 255.0) as usize).min(TABLE_SIZE - 1)
}

#[inline]
fn unit_sign(d: f32) -> f32 {
    if d > 0.0 {
        GRADIENT_STEP
    } else if d < 0.0 {
        -GRADIENT_STEP
    } else {
        0.0
    }
}

/// TV / sparse-gradient correction for one row.
///
/// Forward differences are reduced to `±1/255`, then the backward difference
/// of that field gives the divergence; `R = -(Wx·∂x nx + Wy·∂y ny)`, with
/// `W ≡ 1` for plain TV and `W = weights[|∇u|·255]` for the sparse prior.
fn gradient_row(
    src: &[f32],
    w: usize,
    h: usize,
    ch: usize,
    y: usize,
    weights: Option<&[f32]>,
    row: &mut [f32],
) {
    let at = |x: usize, y: usize, c: usize| src[(y * w + x) * ch + c];
    let nx = |x: usize, y: usize, c: usize| {
        if x + 1 < w {
            unit_sign(at(x + 1, y, c) - at(x, y, c))
        } else {
            0.0
        }
    };
    let ny = |x: usize, y: usize, c: usize| {
        if y + 1 < h {
            unit_sign(at(x, y + 1, c) - at(x, y, c))
        } else {
            0.0
        }
    };

    for x in 0..w {
        for c in 0..ch {
            let dxx = nx(x, y, c) - if x > 0 { nx(x - 1, y, c) } else { 0.0 };
            let dyy = ny(x, y, c) - if y > 0 { ny(x, y - 1, c) } else { 0.0 };

            let r = match weights {
                None => -(dxx + dyy),
                Some(table) => {
                    let gx = if x + 1 < w { at(x + 1, y, c) - at(x, y, c) } else { 0.0 };
                    let gy = if y + 1 < h { at(x, y + 1, c) - at(x, y, c) } else { 0.0 };
                    let wx = table[table_index(gx)];
                    let wy = table[table_index(gy)];
                    let r = -(wx * dxx + wy * dyy);
                    if r.is_nan() {
                        0.0
                    } else {
                        r
                    }
                }
            };
            row[x * ch + c] = r;
        }
    }
}

/// Bilateral second-difference correction for one row
fn bilateral_row(
    src: &[f32],
    w: usize,
    h: usize,
    ch: usize,
    y: usize,
    kernel: &BilateralKernel,
    row: &mut [f32],
) {
    let (wi, hi) = (w as isize, h as isize);
    let yi = y as isize;

    for x in 0..w {
        let xi = x as isize;
        for c in 0..ch {
            let center = src[(y * w + x) * ch + c];
            let mut acc = 0.0f32;
            let mut k = 0;

            for yy in -RADIUS..=RADIUS {
                for xx in -RADIUS..=RADIUS {
                    let spatial = kernel.spatial[k];
                    k += 1;

                    let (x1, y1) = (xi + xx, yi + yy);
                    let (x2, y2) = (xi - xx, yi - yy);
                    if x1 < 0 || x1 >= wi || y1 < 0 || y1 >= hi {
                        continue;
                    }
                    if x2 < 0 || x2 >= wi || y2 < 0 || y2 >= hi {
                        continue;
                    }

                    let a = src[(y1 as usize * w + x1 as usize) * ch + c];
                    let b = src[(y2 as usize * w + x2 as usize) * ch + c];
                    let range = 0.5
                        * (kernel.range[table_index(a - center)]
                            + kernel.range[table_index(b - center)]);
                    acc += spatial * range * (2.0 * center - a - b);
                }
            }

            row[x * ch + c] = acc;
        }
    }
}

/// `exp(-g^α/σ²)·g^(α-1)`, scaled so entries 0 and 1 are both 1
fn sparse_gradient_table(exponent: f32, variance: f32) -> Vec<f32> {
    let raw = |i: usize| {
        let g = i as f32 / 255.0;
        (-g.powf(exponent) / variance).exp() * g.powf(exponent - 1.0)
    };
    normalized_table(raw)
}

/// Gaussian range weights `exp(-Δ²/σ²)`
fn bilateral_table(variance: f32) -> Vec<f32> {
    (0..TABLE_SIZE)
        .map(|i| {
            let d = i as f32 / 255.0;
            (-d * d / variance).exp()
        })
        .collect()
}

/// Gaussian range weights with a hyper-Laplacian falloff, entries 0 and 1 pinned to 1
fn reweighted_bilateral_table(variance: f32, exponent: f32) -> Vec<f32> {
    let raw = |i: usize| {
        let d = i as f32 / 255.0;
        (-d * d / variance).exp() * d.powf(exponent - 1.0)
    };
    normalized_table(raw)
}

fn normalized_table(raw: impl Fn(usize) -> f32) -> Vec<f32> {
    let base = raw(1);
    let mut table = Vec::with_capacity(TABLE_SIZE);
    table.push(1.0);
    for i in 1..TABLE_SIZE {
        let v = raw(i) / base;
        table.push(if v.is_finite() { v } else { 0.0 });
    }
    table
}
