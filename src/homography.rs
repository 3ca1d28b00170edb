//! Planar projective transforms
//!
//! A [`Homography`] maps `(x, y, 1)ᵗ ∝ H·(x, y, 1)ᵗ` in a coordinate frame
//! centered on the image midpoint. The inverse is computed once and cached,
//! so warping in either direction costs the same.

use nalgebra::{DMatrix, Matrix3, Point2};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Determinant magnitude below which a transform is treated as singular
const SINGULAR_EPSILON: f64 = 1e-12;

/// Camera pose parameters for one homography, all relative to the image center
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionParameters {
    /// In-plane rotation in degrees
    pub rotation_deg: f64,
    /// Uniform scale factor (1.0 = no zoom)
    pub scale: f64,
    /// Perspective skew along x (bottom row, first entry)
    pub perspective_x: f64,
    /// Perspective skew along y (bottom row, second entry)
    pub perspective_y: f64,
    /// Translation in pixels
    pub dx: f64,
    pub dy: f64,
}

impl Default for MotionParameters {
    fn default() -> Self {
        Self {
            rotation_deg: 0.0,
            scale: 1.0,
            perspective_x: 0.0,
            perspective_y: 0.0,
            dx: 0.0,
            dy: 0.0,
        }
    }
}

impl MotionParameters {
    /// Linearly interpolate every parameter between identity (`t = 0`) and `self` (`t = 1`)
    pub fn lerp_from_identity(&self, t: f64) -> Self {
        Self {
            rotation_deg: self.rotation_deg * t,
            scale: 1.0 + (self.scale - 1.0) * t,
            perspective_x: self.perspective_x * t,
            perspective_y: self.perspective_y * t,
            dx: self.dx * t,
            dy: self.dy * t,
        }
    }
}

/// Which family of transforms a correspondence fit is restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FitModel {
    /// Full 8-DOF projective transform (9 homogeneous unknowns)
    #[default]
    Projective,
    /// No perspective row (7 homogeneous unknowns)
    Affine,
    /// Rotation, uniform scale and translation (5 homogeneous unknowns)
    Rigid,
}

impl FitModel {
    /// Minimum number of correspondences that determine the model
    pub fn min_correspondences(&self) -> usize {
        match self {
            FitModel::Projective => 4,
            FitModel::Affine => 3,
            FitModel::Rigid => 2,
        }
    }
}

/// 3x3 homography with its cached inverse
#[derive(Debug, Clone, PartialEq)]
pub struct Homography {
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl Default for Homography {
    fn default() -> Self {
        Self::identity()
    }
}

impl Homography {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
            inverse: Matrix3::identity(),
        }
    }

    /// Wrap a matrix, computing its inverse.
    ///
    /// Fails with [`Error::SingularHomography`] when the determinant is ~0.
    pub fn from_matrix(matrix: Matrix3<f64>) -> Result<Self> {
        let inverse = invert_matrix(&matrix)?;
        Ok(Self { matrix, inverse })
    }

    /// Rotation about the center by `degrees`. Fails for a non-finite angle.
    pub fn rotation(degrees: f64) -> Result<Self> {
        Self::from_parameters(&MotionParameters {
            rotation_deg: degrees,
            ..Default::default()
        })
    }

    /// Uniform scaling about the center. Fails for a zero factor.
    pub fn scale(factor: f64) -> Result<Self> {
        Self::from_parameters(&MotionParameters {
            scale: factor,
            ..Default::default()
        })
    }

    pub fn translation(dx: f64, dy: f64) -> Result<Self> {
        Self::from_parameters(&MotionParameters {
            dx,
            dy,
            ..Default::default()
        })
    }

    /// Pure perspective skew: bottom row `[px, py, 1]`
    pub fn perspective(px: f64, py: f64) -> Result<Self> {
        Self::from_parameters(&MotionParameters {
            perspective_x: px,
            perspective_y: py,
            ..Default::default()
        })
    }

    /// Build the pose homography for a combination of parameters.
    ///
    /// ```text
    /// | s·cosθ  -s·sinθ  dx |
    /// | s·sinθ   s·cosθ  dy |
    /// |   px       py     1 |
    /// ```
    pub fn from_parameters(params: &MotionParameters) -> Result<Self> {
        let theta = params.rotation_deg.to_radians();
        let (sin, cos) = theta.sin_cos();
        let s = params.scale;

        let matrix = Matrix3::new(
            s * cos,
            -s * sin,
            params.dx,
            s * sin,
            s * cos,
            params.dy,
            params.perspective_x,
            params.perspective_y,
            1.0,
        );
        Self::from_matrix(matrix)
    }

    /// `other ∘ self`: apply `self` first, then `other`
    pub fn then(&self, other: &Homography) -> Homography {
        Homography {
            matrix: other.matrix * self.matrix,
            inverse: self.inverse * other.inverse,
        }
    }

    /// Matrix interpolated linearly between identity (`t = 0`) and `self` (`t = 1`).
    ///
    /// `self` is first scaled so its bottom-right entry is 1.
    pub fn interpolate_from_identity(&self, t: f64) -> Result<Self> {
        let end = normalize_scale(self.matrix);
        let matrix = Matrix3::identity() * (1.0 - t) + end * t;
        Self::from_matrix(matrix)
    }

    /// The transform going the other way
    pub fn invert(&self) -> Homography {
        Homography {
            matrix: self.inverse,
            inverse: self.matrix,
        }
    }

    #[inline]
    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Map a point through `H`
    #[inline]
    pub fn transform(&self, x: f64, y: f64) -> (f64, f64) {
        apply_homography(&self.matrix, x, y)
    }

    /// Map a point through `H⁻¹`
    #[inline]
    pub fn inverse_transform(&self, x: f64, y: f64) -> (f64, f64) {
        apply_homography(&self.inverse, x, y)
    }

    /// Fit a full projective transform mapping `from[i]` to `to[i]`
    pub fn fit(from: &[Point2<f64>], to: &[Point2<f64>]) -> Result<Self> {
        Self::fit_model(from, to, FitModel::Projective)
    }

    /// Fit a transform without perspective terms
    pub fn fit_affine(from: &[Point2<f64>], to: &[Point2<f64>]) -> Result<Self> {
        Self::fit_model(from, to, FitModel::Affine)
    }

    /// Fit rotation + uniform scale + translation
    pub fn fit_rigid(from: &[Point2<f64>], to: &[Point2<f64>]) -> Result<Self> {
        Self::fit_model(from, to, FitModel::Rigid)
    }

    /// Direct Linear Transform restricted to `model`.
    ///
    /// Points are Hartley-normalized (zero mean, mean distance √2), the
    /// homogeneous system `A h = 0` is solved by SVD taking the right singular
    /// vector of the smallest singular value, and the result is de-normalized.
    pub fn fit_model(from: &[Point2<f64>], to: &[Point2<f64>], model: FitModel) -> Result<Self> {
        if from.len() != to.len() {
            return Err(Error::CorrespondenceMismatch {
                left: from.len(),
                right: to.len(),
            });
        }
        let required = model.min_correspondences();
        if from.len() < required {
            return Err(Error::TooFewCorrespondences {
                required,
                got: from.len(),
            });
        }

        let (from_n, t_from) = normalize_points(from).ok_or(Error::DegenerateCorrespondences)?;
        let (to_n, t_to) = normalize_points(to).ok_or(Error::DegenerateCorrespondences)?;

        let a = design_matrix(&from_n, &to_n, model);
        let h = smallest_singular_vector(a)?;
        let h_norm = unpack(&h, model);

        let t_to_inv = t_to
            .try_inverse()
            .ok_or(Error::DegenerateCorrespondences)?;
        let matrix = normalize_scale(t_to_inv * h_norm * t_from);

        Self::from_matrix(matrix)
    }
}

fn invert_matrix(m: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let determinant = m.determinant();
    if !determinant.is_finite() || determinant.abs() < SINGULAR_EPSILON {
        return Err(Error::SingularHomography { determinant });
    }
    m.try_inverse()
        .ok_or(Error::SingularHomography { determinant })
}

/// Scale so that `H[2,2] == 1` when possible
fn normalize_scale(m: Matrix3<f64>) -> Matrix3<f64> {
    let scale = m[(2, 2)];
    if scale.abs() > f64::EPSILON {
        m / scale
    } else {
        m
    }
}

/// Apply a homography matrix to a point
#[inline]
fn apply_homography(h: &Matrix3<f64>, x: f64, y: f64) -> (f64, f64) {
    let z = h[(2, 0)] * x + h[(2, 1)] * y + h[(2, 2)];
    let xp = (h[(0, 0)] * x + h[(0, 1)] * y + h[(0, 2)]) / z;
    let yp = (h[(1, 0)] * x + h[(1, 1)] * y + h[(1, 2)]) / z;
    (xp, yp)
}

/// Hartley normalization. Returns `None` when all points coincide.
fn normalize_points(points: &[Point2<f64>]) -> Option<(Vec<Point2<f64>>, Matrix3<f64>)> {
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (sx / n, sy / n);

    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-12 {
        return None;
    }

    let s = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = points
        .iter()
        .map(|p| Point2::new(s * (p.x - cx), s * (p.y - cy)))
        .collect();
    Some((normalized, t))
}

fn design_matrix(from: &[Point2<f64>], to: &[Point2<f64>], model: FitModel) -> DMatrix<f64> {
    let cols = match model {
        FitModel::Projective => 9,
        FitModel::Affine => 7,
        FitModel::Rigid => 5,
    };
    let mut a = DMatrix::<f64>::zeros(2 * from.len(), cols);

    for (i, (p, q)) in from.iter().zip(to.iter()).enumerate() {
        let (x, y, u, v) = (p.x, p.y, q.x, q.y);
        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        match model {
            FitModel::Projective => {
                a[(r0, 0)] = -x;
                a[(r0, 1)] = -y;
                a[(r0, 2)] = -1.0;
                a[(r0, 6)] = u * x;
                a[(r0, 7)] = u * y;
                a[(r0, 8)] = u;

                a[(r1, 3)] = -x;
                a[(r1, 4)] = -y;
                a[(r1, 5)] = -1.0;
                a[(r1, 6)] = v * x;
                a[(r1, 7)] = v * y;
                a[(r1, 8)] = v;
            }
            // unknowns [h00, h01, h02, h10, h11, h12, h22]
            FitModel::Affine => {
                a[(r0, 0)] = -x;
                a[(r0, 1)] = -y;
                a[(r0, 2)] = -1.0;
                a[(r0, 6)] = u;

                a[(r1, 3)] = -x;
                a[(r1, 4)] = -y;
                a[(r1, 5)] = -1.0;
                a[(r1, 6)] = v;
            }
            // unknowns [a, b, tx, ty, w] for [[a, -b, tx], [b, a, ty], [0, 0, w]]
            FitModel::Rigid => {
                a[(r0, 0)] = -x;
                a[(r0, 1)] = y;
                a[(r0, 2)] = -1.0;
                a[(r0, 4)] = u;

                a[(r1, 0)] = -y;
                a[(r1, 1)] = -x;
                a[(r1, 3)] = -1.0;
                a[(r1, 4)] = v;
            }
        }
    }

    a
}

fn smallest_singular_vector(a: DMatrix<f64>) -> Result<Vec<f64>> {
    // pad underdetermined systems to square so V spans the full space
    let mut a_work = a;
    if a_work.nrows() < a_work.ncols() {
        let rows = a_work.nrows();
        let cols = a_work.ncols();
        let mut a_pad = DMatrix::<f64>::zeros(cols, cols);
        a_pad.view_mut((0, 0), (rows, cols)).copy_from(&a_work);
        a_work = a_pad;
    }

    let svd = a_work.svd(false, true);
    let v_t = svd.v_t.ok_or(Error::SvdFailed)?;
    let idx = svd.singular_values.imin();
    Ok(v_t.row(idx).iter().copied().collect())
}

fn unpack(h: &[f64], model: FitModel) -> Matrix3<f64> {
    match model {
        FitModel::Projective => Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]),
        FitModel::Affine => Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], 0.0, 0.0, h[6]),
        FitModel::Rigid => Matrix3::new(h[0], -h[1], h[2], h[1], h[0], h[3], 0.0, 0.0, h[4]),
    }
}
