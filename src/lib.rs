//! Conditional GAN training for eye gaze redirection.
//!
//! The pipeline turns a flat corpus of eye patches whose filenames encode
//! identity, head pose and gaze angle into cross-angle training pairs
//! ([`data`]), and trains an angle-conditioned generator against a
//! discriminator with adversarial, perceptual/style, gaze-consistency and
//! cyclic reconstruction losses ([`model`], [`training`]).

pub mod data;
pub mod error;
pub mod model;
pub mod tracker;
pub mod training;
pub mod utils;
