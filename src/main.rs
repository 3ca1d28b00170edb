//! projective-deblur - Richardson-Lucy deblurring under projective camera motion
//!
//! Blur is modelled as the average of an image warped through a sequence of
//! homographies sampled along the camera path. The `blur` command synthesizes
//! such an observation, `deblur` recovers a latent image from one, and `fit`
//! estimates the final-pose homography from point correspondences.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use projective_deblur::buffer::Image;
use projective_deblur::config::Config;
use projective_deblur::deblur::{NoiseModel, RlDeblurrer};
use projective_deblur::io;
use projective_deblur::metrics::{ErrorCalculator, RmsError};
use projective_deblur::motion::Direction;
use projective_deblur::regularizer::{Regularizer, RegularizerKind};

/// projective-deblur - remove camera-shake blur described by a homography path
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "deblur.toml", global = true)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Synthesize a motion-blurred observation from a sharp image
    Blur {
        /// Sharp input image
        input: PathBuf,

        /// Where to write the blurred image
        output: PathBuf,

        /// Standard deviation of added Gaussian noise, in [0, 1] units
        #[arg(long, default_value_t = 0.0)]
        noise_sigma: f32,

        /// Noise generator seed
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Process as grayscale
        #[arg(long)]
        gray: bool,

        #[command(flatten)]
        motion: MotionArgs,
    },

    /// Recover a sharp image from a motion-blurred observation
    Deblur {
        /// Blurred input image
        input: PathBuf,

        /// Where to write the deblurred image
        output: PathBuf,

        /// Sharp reference used to report the error per iteration
        #[arg(long)]
        ground_truth: Option<PathBuf>,

        /// Number of iterations
        #[arg(short = 'n', long)]
        iterations: Option<usize>,

        /// Regularization strength
        #[arg(short, long)]
        lambda: Option<f32>,

        /// Prior applied on every update
        #[arg(short, long, value_enum)]
        regularizer: Option<RegularizerKind>,

        /// Noise model selecting the update rule
        #[arg(long, value_enum)]
        noise: Option<NoiseModel>,

        /// Process as grayscale
        #[arg(long)]
        gray: bool,

        /// Latent image width
        #[arg(long)]
        width: Option<usize>,

        /// Latent image height
        #[arg(long)]
        height: Option<usize>,

        #[command(flatten)]
        motion: MotionArgs,
    },

    /// Fit the final-pose homography from the configured correspondences
    Fit,
}

/// Overrides for the `[motion]` section
#[derive(Args, Debug)]
struct MotionArgs {
    /// Homography samples per exposure
    #[arg(long)]
    samples: Option<usize>,

    /// Final rotation in degrees
    #[arg(long)]
    rotation: Option<f64>,

    /// Final scale factor
    #[arg(long)]
    scale: Option<f64>,

    /// Final horizontal translation in pixels
    #[arg(long, allow_hyphen_values = true)]
    dx: Option<f64>,

    /// Final vertical translation in pixels
    #[arg(long, allow_hyphen_values = true)]
    dy: Option<f64>,
}

impl MotionArgs {
    fn apply(&self, config: &mut Config) {
        let motion = &mut config.motion;
        if let Some(samples) = self.samples {
            motion.samples = samples;
        }
        if let Some(rotation) = self.rotation {
            motion.rotation_deg = rotation;
        }
        if let Some(scale) = self.scale {
            motion.scale = scale;
        }
        if let Some(dx) = self.dx {
            motion.dx = dx;
        }
        if let Some(dy) = self.dy {
            motion.dy = dy;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("projective-deblur v{}", env!("CARGO_PKG_VERSION"));

    // Load or create configuration
    let mut config = Config::load_or_create(&cli.config)?;

    match cli.command {
        Command::Blur {
            input,
            output,
            noise_sigma,
            seed,
            gray,
            motion,
        } => {
            motion.apply(&mut config);
            run_blur(&config, &input, &output, noise_sigma, seed, gray)
        }
        Command::Deblur {
            input,
            output,
            ground_truth,
            iterations,
            lambda,
            regularizer,
            noise,
            gray,
            width,
            height,
            motion,
        } => {
            motion.apply(&mut config);
            let deblur = &mut config.deblur;
            if let Some(iterations) = iterations {
                deblur.iterations = iterations;
            }
            if let Some(lambda) = lambda {
                deblur.lambda = lambda;
            }
            if let Some(regularizer) = regularizer {
                deblur.regularizer = regularizer;
            }
            if let Some(noise) = noise {
                deblur.noise_model = noise;
            }
            if width.is_some() {
                deblur.width = width;
            }
            if height.is_some() {
                deblur.height = height;
            }
            run_deblur(&config, &input, &output, ground_truth.as_deref(), gray)
        }
        Command::Fit => run_fit(&config),
    }
}

fn run_blur(
    config: &Config,
    input: &Path,
    output: &Path,
    noise_sigma: f32,
    seed: u64,
    gray: bool,
) -> Result<()> {
    let model = config
        .motion
        .build_model()
        .context("Failed to build motion model")?;
    let sharp = io::load_image(input, gray)?;

    let mut blurred = Image::new(sharp.width(), sharp.height(), sharp.channels())?;
    let mut weight = vec![0.0f32; sharp.pixel_count()];
    model.blur_unit_weight(&sharp, &mut blurred, &mut weight, Direction::Forward)?;
    info!("Blurred with {} homography samples", model.samples());

    let blurred = if noise_sigma > 0.0 {
        info!("Adding Gaussian noise (sigma {})", noise_sigma);
        io::add_gaussian_noise(&blurred, noise_sigma, seed)?
    } else {
        blurred
    };

    io::save_image(output, &blurred)
}

fn run_deblur(
    config: &Config,
    input: &Path,
    output: &Path,
    ground_truth: Option<&Path>,
    gray: bool,
) -> Result<()> {
    let model = config
        .motion
        .build_model()
        .context("Failed to build motion model")?;
    let blurred = io::load_image(input, gray)?;

    let width = config.deblur.width.unwrap_or(blurred.width());
    let height = config.deblur.height.unwrap_or(blurred.height());
    let mut estimate = io::resize(&blurred, width, height)?;

    let calculator = match ground_truth {
        Some(path) => {
            let mut truth = io::load_image(path, blurred.channels() == 1)?;
            if truth.dimensions() != (width, height) {
                warn!(
                    "Ground truth is {}x{}, resizing to the {}x{} latent image",
                    truth.width(),
                    truth.height(),
                    width,
                    height
                );
                truth = io::resize(&truth, width, height)?;
            }
            Some(RmsError::new(truth))
        }
        None => None,
    };

    let regularizer = Regularizer::new(config.deblur.regularizer, &config.prior);
    let mut deblurrer = RlDeblurrer::new(&model);
    let report = deblurrer.deblur(
        &blurred,
        &mut estimate,
        &config.deblur.params(),
        &regularizer,
        calculator.as_ref().map(|c| c as &dyn ErrorCalculator),
    )?;

    match (report.initial_error, report.final_error()) {
        (Some(initial), Some(last)) => {
            info!("RMS error {:.6} -> {:.6}", initial, last)
        }
        _ => info!("No ground truth given, skipping error report"),
    }

    io::save_image(output, &estimate)
}

fn run_fit(config: &Config) -> Result<()> {
    let motion = &config.motion;
    if motion.correspondences.is_empty() {
        anyhow::bail!("No correspondences configured under [motion]");
    }

    let homography = motion
        .fit_homography()
        .context("Failed to fit homography")?;
    info!(
        "Fitted {:?} homography from {} correspondences",
        motion.fit,
        motion.correspondences.len()
    );

    println!("{}", homography.matrix());
    for &[x, y, u, v] in &motion.correspondences {
        let (px, py) = homography.transform(x, y);
        println!(
            "({:.2}, {:.2}) -> ({:.2}, {:.2})  target ({:.2}, {:.2})",
            x, y, px, py, u, v
        );
    }
    Ok(())
}
