//! Configuration management for projective-deblur

use anyhow::{Context, Result};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::deblur::{DeblurParams, NoiseModel};
use crate::homography::{FitModel, Homography, MotionParameters};
use crate::motion::{MotionBlurModel, DEFAULT_SAMPLES};
use crate::regularizer::{PriorConfig, RegularizerKind};

/// Camera motion during the exposure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MotionConfig {
    /// Number of homography samples per exposure
    #[serde(default = "default_samples")]
    pub samples: usize,

    /// Final in-plane rotation in degrees
    #[serde(default)]
    pub rotation_deg: f64,

    /// Final uniform scale factor
    #[serde(default = "default_scale")]
    pub scale: f64,

    #[serde(default)]
    pub perspective_x: f64,

    #[serde(default)]
    pub perspective_y: f64,

    /// Final translation in pixels
    #[serde(default)]
    pub dx: f64,

    #[serde(default)]
    pub dy: f64,

    /// Optional point pairs `[x, y, x', y']` (center-relative) defining the
    /// final pose; overrides the parameters above when present
    #[serde(default)]
    pub correspondences: Vec<[f64; 4]>,

    /// Transform family used when fitting the correspondences
    #[serde(default)]
    pub fit: FitModel,
}

fn default_samples() -> usize {
    DEFAULT_SAMPLES
}

fn default_scale() -> f64 {
    1.0
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            samples: DEFAULT_SAMPLES,
            rotation_deg: 0.0,
            scale: 1.0,
            perspective_x: 0.0,
            perspective_y: 0.0,
            dx: 0.0,
            dy: 0.0,
            correspondences: Vec::new(),
            fit: FitModel::default(),
        }
    }
}

impl MotionConfig {
    pub fn parameters(&self) -> MotionParameters {
        MotionParameters {
            rotation_deg: self.rotation_deg,
            scale: self.scale,
            perspective_x: self.perspective_x,
            perspective_y: self.perspective_y,
            dx: self.dx,
            dy: self.dy,
        }
    }

    /// Fit the final-pose homography from the configured correspondences
    pub fn fit_homography(&self) -> crate::error::Result<Homography> {
        let (from, to): (Vec<_>, Vec<_>) = self
            .correspondences
            .iter()
            .map(|&[x, y, u, v]| (Point2::new(x, y), Point2::new(u, v)))
            .unzip();
        Homography::fit_model(&from, &to, self.fit)
    }

    /// Build the sampled motion model described by this section
    pub fn build_model(&self) -> crate::error::Result<MotionBlurModel> {
        let mut model = MotionBlurModel::new(self.samples);
        if self.correspondences.is_empty() {
            model.set_global_parameters(&self.parameters())?;
        } else {
            let end = self.fit_homography()?;
            model.set_end_homography(&end)?;
        }
        Ok(model)
    }
}

/// Deconvolution settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeblurConfig {
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    #[serde(default)]
    pub noise_model: NoiseModel,

    /// Regularization strength λ
    #[serde(default = "default_lambda")]
    pub lambda: f32,

    #[serde(default)]
    pub regularizer: RegularizerKind,

    /// Latent image width (defaults to the blurred image width)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,

    /// Latent image height (defaults to the blurred image height)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<usize>,
}

fn default_iterations() -> usize {
    100
}

fn default_lambda() -> f32 {
    0.5
}

impl Default for DeblurConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            noise_model: NoiseModel::default(),
            lambda: default_lambda(),
            regularizer: RegularizerKind::default(),
            width: None,
            height: None,
        }
    }
}

impl DeblurConfig {
    pub fn params(&self) -> DeblurParams {
        DeblurParams {
            iterations: self.iterations,
            noise: self.noise_model,
            lambda: self.lambda,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub motion: MotionConfig,

    #[serde(default)]
    pub deblur: DeblurConfig,

    #[serde(default)]
    pub prior: PriorConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.motion.samples, 30);
        assert_eq!(config.motion.scale, 1.0);
        assert_eq!(config.deblur.noise_model, NoiseModel::Poisson);
        assert_eq!(config.deblur.regularizer, RegularizerKind::None);
        assert_eq!(config.prior.bilateral_variance, 0.005);
    }

    #[test]
    fn test_parse_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [motion]
            rotation_deg = 5.0
            scale = 1.1

            [deblur]
            noise_model = "gaussian"
            regularizer = "bilateral_laplacian"
            width = 320
            "#,
        )
        .unwrap();

        assert_eq!(config.motion.samples, 30);
        assert_eq!(config.motion.rotation_deg, 5.0);
        assert_eq!(config.deblur.noise_model, NoiseModel::Gaussian);
        assert_eq!(config.deblur.regularizer, RegularizerKind::BilateralLaplacian);
        assert_eq!(config.deblur.width, Some(320));
        assert_eq!(config.deblur.height, None);
        assert_eq!(config.deblur.iterations, 100);
    }

    #[test]
    fn test_load_or_create_round_trip() {
        let dir = std::env::temp_dir().join(format!("projective-deblur-cfg-{}", std::process::id()));
        let path = dir.join("deblur.toml");
        let _ = std::fs::remove_dir_all(&dir);

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());

        let mut changed = created.clone();
        changed.motion.correspondences = vec![[0.0, 0.0, 1.0, 2.0]];
        changed.deblur.regularizer = RegularizerKind::TotalVariation;
        changed.save(&path).unwrap();

        let loaded = Config::load_or_create(&path).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
        assert_eq!(loaded, changed);
    }

    #[test]
    fn test_build_model_from_correspondences() {
        let motion = MotionConfig {
            samples: 3,
            correspondences: vec![
                [-10.0, -10.0, -8.0, -10.0],
                [10.0, -10.0, 12.0, -10.0],
                [10.0, 10.0, 12.0, 10.0],
                [-10.0, 10.0, -8.0, 10.0],
            ],
            ..Default::default()
        };

        let model = motion.build_model().unwrap();
        assert_eq!(model.samples(), 3);
        let (x, y) = model.homography(1).unwrap().transform(0.0, 0.0);
        assert!((x - 1.0).abs() < 1e-6, "half of a 2px shift, got {}", x);
        assert!(y.abs() < 1e-6);
    }

    #[test]
    fn test_build_model_rejects_too_few_points() {
        let motion = MotionConfig {
            correspondences: vec![[0.0, 0.0, 1.0, 1.0]],
            ..Default::default()
        };
        assert!(motion.build_model().is_err());
    }
}
