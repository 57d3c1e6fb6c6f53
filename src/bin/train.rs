#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::config::Config;
use clap::Parser;
use gaze_redirect_burn::tracker::{FileTracker, NullTracker, Tracker};
use gaze_redirect_burn::training::TrainingConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Train the gaze redirection GAN with Burn")]
struct Args {
    #[arg(long)]
    experiment_dir: PathBuf,
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
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
    let config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    config.validate()?;

    let mut tracker: Box<dyn Tracker> = match config.use_comet {
        Some(mode) => {
            let project = config.comet_project.as_deref().unwrap_or("gaze-redirection");
            let workspace = config.comet_workspace.as_deref().unwrap_or("default");
            tracing::info!(?mode, project, workspace, "experiment tracking enabled");
            Box::new(FileTracker::new(&args.experiment_dir, project, workspace)?)
        }
        None => Box::new(NullTracker),
    };

    type TrainBackend = Autodiff<Backend>;
    let device = Default::default();
    gaze_redirect_burn::training::train::<TrainBackend>(
        &args.experiment_dir,
        config,
        tracker.as_mut(),
        device,
    )?;
    Ok(())
}
