#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::config::Config;
use burn::prelude::*;
use burn::tensor::TensorData;
use clap::Parser;
use gaze_redirect_burn::data::{FsLoader, ImageLoader};
use gaze_redirect_burn::training::{render_angle_sweep, resume_from, TrainingConfig};
use gaze_redirect_burn::utils::compile_frames_to_gif;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Render gaze angle sweeps from a trained checkpoint")]
struct Args {
    #[arg(long)]
    experiment_dir: PathBuf,
    /// Checkpoint path without extension, e.g. `checkpoint/model-9`.
    /// Relative paths are resolved against the experiment directory.
    #[arg(long)]
    checkpoint: PathBuf,
    /// Eye patch images to redirect.
    #[arg(long, required = true, num_args = 1..)]
    images: Vec<PathBuf>,
    #[arg(long)]
    save_dir: PathBuf,
    #[arg(long)]
    output_gif: Option<String>,
}

#[cfg(feature = "wgpu")]
type Backend = burn::backend::Wgpu<f32, i32>;
#[cfg(not(feature = "wgpu"))]
type Backend = burn::backend::NdArray<f32>;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config_path = args.experiment_dir.join("config.json");
    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let checkpoint = if args.checkpoint.is_relative() {
        args.experiment_dir.join(&args.checkpoint)
    } else {
        args.checkpoint.clone()
    };

    let device = Default::default();
    let gan = resume_from::<Backend>(&checkpoint, &config.model, &device)?;

    std::fs::create_dir_all(&args.save_dir)
        .with_context(|| format!("failed to create {}", args.save_dir.display()))?;

    let size = config.model.image_size;
    let loader = FsLoader::new(size as u32);
    for (idx, image_path) in args.images.iter().enumerate() {
        let pixels = loader.load(image_path)?;
        let source = Tensor::<Backend, 4>::from_data(
            TensorData::new(pixels, [1, 3, size, size]),
            &device,
        );
        let out_path = args.save_dir.join(format!("sweep_{idx:03}.png"));
        render_angle_sweep(&gan.generator, source, &out_path)?;
        tracing::info!(input = %image_path.display(), output = %out_path.display(), "sweep rendered");
    }

    if let Some(gif_name) = &args.output_gif {
        compile_frames_to_gif(&args.save_dir, &args.save_dir.join(gif_name))?;
    }

    Ok(())
}
