//! Richardson-Lucy deconvolution of images blurred by projective camera motion
//!
//! The blur is modelled as the average of the latent image warped through a
//! sequence of homographies sampled along the camera path
//! ([`motion::MotionBlurModel`]). [`deblur::RlDeblurrer`] inverts it
//! iteratively, optionally under one of the edge-preserving priors in
//! [`regularizer`].

pub mod buffer;
pub mod config;
pub mod deblur;
pub mod error;
pub mod homography;
pub mod io;
pub mod metrics;
pub mod motion;
pub mod regularizer;

pub use buffer::Image;
pub use error::{Error, Result};
