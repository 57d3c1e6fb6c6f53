use crate::data::{
    angle_tensor, build_pairs, AngleIndexer, FsLoader, GazeBatch, PairBatcher, PairDataset,
    TrainingPair,
};
use crate::error::{CheckpointError, ConfigError, TrainError};
use crate::model::{
    discriminator_losses, generator_losses, Discriminator, FeatureNetwork, Generator, LossConfig,
    ModelConfig,
};
use crate::tracker::{Tracker, TrackerMode};
use crate::utils::{save_concat_images, tensor_to_images};
use anyhow::{Context, Result};
use burn::config::Config;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::module::{AutodiffModule, Module};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Horizontal sweep rendered by the periodic visualization, in degrees.
const SWEEP_DEGREES: [f32; 7] = [-15.0, -10.0, -5.0, 0.0, 5.0, 10.0, 15.0];

/// Checkpoints keep full f32 precision so a resumed run continues from the
/// exact weights that were saved.
type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Training configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub loss: LossConfig,
    pub data_path: String,
    pub batch_size: usize,
    pub lr: f64,
    pub epochs: usize,
    #[config(default = 0.5)]
    pub beta1: f32,
    #[config(default = 0.999)]
    pub beta2: f32,
    #[config(default = 1)]
    pub critic_iter_per_gen: usize,
    #[config(default = 100)]
    pub image_save_freq: usize,
    #[config(default = 1)]
    pub model_save_freq: usize,
    #[config(default = 50)]
    pub train_id_threshold: u32,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = false)]
    pub resume: bool,
    pub use_comet: Option<TrackerMode>,
    pub comet_project: Option<String>,
    pub comet_workspace: Option<String>,
    /// Exported record holding the fixed perceptual network's weights. When
    /// absent the network keeps its random initialization.
    pub feature_weights: Option<String>,
}

impl TrainingConfig {
    /// Fail fast on values the loop cannot run with, before any data
    /// loading or network construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_path.is_empty() {
            return Err(ConfigError::new("data_path", "must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::new("batch_size", "must be at least 1"));
        }
        if self.epochs == 0 {
            return Err(ConfigError::new("epochs", "must be at least 1"));
        }
        if self.critic_iter_per_gen == 0 {
            return Err(ConfigError::new("critic_iter_per_gen", "must be at least 1"));
        }
        if self.image_save_freq == 0 {
            return Err(ConfigError::new("image_save_freq", "must be at least 1"));
        }
        if self.model_save_freq == 0 {
            return Err(ConfigError::new("model_save_freq", "must be at least 1"));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(ConfigError::new("lr", "must be a positive finite number"));
        }
        for (key, value) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&value) {
                return Err(ConfigError::new(key, "must lie in [0, 1)"));
            }
        }
        for (key, value) in [
            ("lambda_p", self.loss.lambda_p),
            ("lambda_gaze", self.loss.lambda_gaze),
            ("lambda_recon", self.loss.lambda_recon),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::new(key, "must be a non-negative finite number"));
            }
        }
        Ok(())
    }
}

/// Persisted loop position for resume support.
#[derive(Serialize, Deserialize, Default, Clone)]
pub struct TrainingState {
    pub epoch: usize,
    pub step: usize,
}

/// Generator/discriminator pair persisted together in checkpoints.
#[derive(Module, Debug)]
pub struct GazeGan<B: Backend> {
    pub generator: Generator<B>,
    pub discriminator: Discriminator<B>,
}

impl<B: Backend> GazeGan<B> {
    pub fn new(model: &ModelConfig, device: &B::Device) -> Self {
        Self {
            generator: model.init_generator(device),
            discriminator: model.init_discriminator(device),
        }
    }
}

/// Load generator and discriminator state from a checkpoint file.
///
/// Called explicitly by the orchestrator (or an inference tool); a missing
/// or unreadable file is fatal rather than a trigger for fresh
/// initialization.
pub fn resume_from<B: Backend>(
    path: &Path,
    model: &ModelConfig,
    device: &B::Device,
) -> Result<GazeGan<B>, CheckpointError> {
    if !path.with_extension("mpk").exists() {
        return Err(CheckpointError::Missing {
            path: path.with_extension("mpk"),
        });
    }
    let record = CheckpointRecorder::new()
        .load(path.to_path_buf(), device)
        .map_err(|err| CheckpointError::Load {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    Ok(GazeGan::new(model, device).load_record(record))
}

fn save_checkpoint<B: Backend>(gan: &GazeGan<B>, path: &Path) -> Result<(), CheckpointError> {
    CheckpointRecorder::new()
        .record(gan.clone().into_record(), path.to_path_buf())
        .map_err(|err| CheckpointError::Save {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

type AdamOptimizer<B, M> = OptimizerAdaptor<burn::optim::Adam, M, B>;

/// Exponential moving average with decay 0.9, used only to smooth the
/// per-epoch loss displays.
pub fn ema(previous: f64, loss: f64) -> f64 {
    0.9 * previous + 0.1 * loss
}

/// All tensors in a batch must live on one device before any forward pass.
fn ensure_single_device<B: Backend>(batch: &GazeBatch<B>) -> Result<(), TrainError> {
    let device = batch.sources.device();
    if batch.targets.device() != device
        || batch.source_angles.device() != device
        || batch.target_angles.device() != device
        || batch.labels.device() != device
    {
        return Err(TrainError::DeviceMismatch);
    }
    Ok(())
}

/// One discriminator update: redirect to the target angle, score real
/// against fake, supervise the gaze head on real images. The generator runs
/// in inference mode, so neither its gradients nor its batch norm running
/// statistics move.
pub fn discriminator_step<B: AutodiffBackend>(
    gan: GazeGan<B>,
    loss_config: &LossConfig,
    optim: &mut AdamOptimizer<B, Discriminator<B>>,
    lr: f64,
    batch: &GazeBatch<B>,
) -> (GazeGan<B>, f64) {
    let fake = Tensor::from_inner(gan.generator.valid().forward(
        batch.sources.clone().inner(),
        batch.target_angles.clone().inner(),
    ));
    let losses = discriminator_losses(
        &gan.discriminator,
        loss_config,
        batch.sources.clone(),
        fake,
        batch.source_angles.clone(),
    );
    let value = losses.total.clone().into_scalar().elem::<f64>();

    let grads = losses.total.backward();
    let grads = GradientsParams::from_grads(grads, &gan.discriminator);
    let discriminator = optim.step(lr, gan.discriminator, grads);

    (
        GazeGan {
            generator: gan.generator,
            discriminator,
        },
        value,
    )
}

/// One generator update with cyclic re-redirection back to the source
/// angle. The adversarial and gaze terms score through the inference-mode
/// discriminator, so no discriminator state moves.
pub fn generator_step<B: AutodiffBackend>(
    gan: GazeGan<B>,
    features: &FeatureNetwork<B>,
    loss_config: &LossConfig,
    optim: &mut AdamOptimizer<B, Generator<B>>,
    lr: f64,
    batch: &GazeBatch<B>,
) -> (GazeGan<B>, f64) {
    let fake = gan
        .generator
        .forward(batch.sources.clone(), batch.target_angles.clone());
    let reconstructed = gan
        .generator
        .forward(fake.clone(), batch.source_angles.clone());
    let losses = generator_losses(
        &gan.discriminator,
        features,
        loss_config,
        batch.sources.clone(),
        fake,
        batch.targets.clone(),
        reconstructed,
        batch.target_angles.clone(),
    );
    let value = losses.total.clone().into_scalar().elem::<f64>();

    let grads = losses.total.backward();
    let grads = GradientsParams::from_grads(grads, &gan.generator);
    let generator = optim.step(lr, gan.generator, grads);

    (
        GazeGan {
            generator,
            discriminator: gan.discriminator,
        },
        value,
    )
}

/// Render [original | redirected at each sweep angle] as one horizontal
/// strip and save it. Expects a single-image batch.
pub fn render_angle_sweep<B: Backend>(
    generator: &Generator<B>,
    source: Tensor<B, 4>,
    path: &Path,
) -> Result<()> {
    let device = source.device();
    let mut strip = tensor_to_images(source.clone())?;
    for degrees in SWEEP_DEGREES {
        let angle = angle_tensor::<B>(&[[degrees / 15.0, 0.0]], &device);
        let redirected = generator.forward(source.clone(), angle);
        strip.extend(tensor_to_images(redirected)?);
    }
    save_concat_images(&strip, path)
}

fn write_training_state(state_path: &Path, state: &TrainingState) -> Result<()> {
    let state_json =
        serde_json::to_string_pretty(state).context("failed to serialize training state")?;
    std::fs::write(state_path, state_json)
        .with_context(|| format!("failed to write {}", state_path.display()))?;
    Ok(())
}

/// Resolve `data_path` relative to the experiment directory if needed.
fn resolve_data_dir(experiment_dir: &Path, data_path: &str) -> PathBuf {
    let candidate = PathBuf::from(data_path);
    if candidate.is_relative() {
        experiment_dir.join(candidate)
    } else {
        candidate
    }
}

/// Run the alternating-update training loop described by `config`.
///
/// Per batch the discriminator steps once; the generator steps every
/// `critic_iter_per_gen` batches. An angle sweep of the current batch's
/// first image is written every `image_save_freq` batches, and a checkpoint
/// plus a held-out sweep every `model_save_freq` epochs.
pub fn train<B: AutodiffBackend>(
    experiment_dir: &Path,
    config: TrainingConfig,
    tracker: &mut dyn Tracker,
    device: B::Device,
) -> Result<()> {
    config.validate()?;

    let model_dir = experiment_dir.join("checkpoint");
    let debug_dir = experiment_dir.join("debug");
    std::fs::create_dir_all(&model_dir)?;
    std::fs::create_dir_all(&debug_dir)?;
    config.save(experiment_dir.join("config.json"))?;
    tracker.log_parameters(serde_json::to_value(&config)?)?;

    let data_dir = resolve_data_dir(experiment_dir, &config.data_path);
    let indexer = AngleIndexer::scan(&data_dir)?;
    let (train_pairs, test_pairs) = build_pairs(&indexer, config.train_id_threshold);
    tracing::info!(
        groups = indexer.groups().len(),
        train = train_pairs.len(),
        test = test_pairs.len(),
        "dataset indexed"
    );
    if train_pairs.is_empty() {
        return Err(anyhow::anyhow!(
            "no training pairs found in {}",
            data_dir.display()
        ));
    }

    B::seed(&device, config.seed);

    let state_path = experiment_dir.join("state.json");
    let mut state = TrainingState::default();
    let mut gan = if config.resume {
        let contents = std::fs::read_to_string(&state_path)
            .with_context(|| format!("failed to read {}", state_path.display()))?;
        state = serde_json::from_str(&contents)?;
        let checkpoint = model_dir.join(format!("model-{}", state.epoch.saturating_sub(1)));
        resume_from::<B>(&checkpoint, &config.model, &device)?
    } else {
        GazeGan::new(&config.model, &device)
    };

    let mut feature_net = config.model.init_feature_network::<B>(&device);
    if let Some(weights) = &config.feature_weights {
        let path = PathBuf::from(weights);
        let record = CheckpointRecorder::new()
            .load(path.clone(), &device)
            .map_err(|err| CheckpointError::Load {
                path,
                message: err.to_string(),
            })?;
        feature_net = feature_net.load_record(record);
    }
    // Fixed from here on: the feature net is never passed to an optimizer.
    let feature_net = feature_net;

    let mut optim_g: AdamOptimizer<B, Generator<B>> = AdamConfig::new()
        .with_beta_1(config.beta1)
        .with_beta_2(config.beta2)
        .init();
    let mut optim_d: AdamOptimizer<B, Discriminator<B>> = AdamConfig::new()
        .with_beta_1(config.beta1)
        .with_beta_2(config.beta2)
        .init();

    let loader = Arc::new(FsLoader::new(config.model.image_size as u32));
    let batcher = PairBatcher::new(loader, config.model.image_size);

    let train_loader = DataLoaderBuilder::<B, TrainingPair, GazeBatch<B>>::new(batcher.clone())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .set_device(device.clone())
        .build(PairDataset::new(train_pairs));
    // The held-out set is consumed as a single full-size batch.
    let test_loader: Option<Arc<dyn DataLoader<B, GazeBatch<B>>>> = if test_pairs.is_empty() {
        None
    } else {
        Some(
            DataLoaderBuilder::<B, TrainingPair, GazeBatch<B>>::new(batcher)
                .batch_size(test_pairs.len())
                .set_device(device.clone())
                .build(PairDataset::new(test_pairs)),
        )
    };

    for epoch in state.epoch..config.epochs {
        let mut ema_d = 0.0;
        let mut ema_g = 0.0;
        let mut last_d = 0.0;
        let mut last_g = 0.0;
        let mut batch_count = 0usize;

        for batch in train_loader.iter() {
            batch_count += 1;
            state.step += 1;
            ensure_single_device(&batch)?;

            let (next, loss_d) =
                discriminator_step(gan, &config.loss, &mut optim_d, config.lr, &batch);
            gan = next;
            if !loss_d.is_finite() {
                return Err(TrainError::NonFiniteLoss {
                    term: "discriminator",
                    epoch,
                    batch: batch_count,
                }
                .into());
            }
            ema_d = ema(ema_d, loss_d);
            last_d = loss_d;

            if batch_count % config.critic_iter_per_gen == 0 {
                let (next, loss_g) = generator_step(
                    gan,
                    &feature_net,
                    &config.loss,
                    &mut optim_g,
                    config.lr,
                    &batch,
                );
                gan = next;
                if !loss_g.is_finite() {
                    return Err(TrainError::NonFiniteLoss {
                        term: "generator",
                        epoch,
                        batch: batch_count,
                    }
                    .into());
                }
                ema_g = ema(ema_g, loss_g);
                last_g = loss_g;
            }

            if batch_count % config.image_save_freq == 0 {
                let sample = batch.sources.clone().slice_dim(0, 0..1).inner();
                let path = debug_dir.join(format!("{epoch}_{batch_count}.png"));
                render_angle_sweep(&gan.generator.valid(), sample, &path)?;
                tracker.log_image(&path)?;
            }
        }

        tracing::info!(epoch, loss_d = ema_d, loss_g = ema_g, "epoch complete");
        tracker.log_metrics(epoch, &[("loss_d", last_d), ("loss_g", last_g)])?;
        state.epoch = epoch + 1;

        if epoch % config.model_save_freq == 0 {
            save_checkpoint(&gan, &model_dir.join(format!("model-{epoch}")))?;
            write_training_state(&state_path, &state)?;

            if let Some(test_loader) = &test_loader {
                if let Some(test_batch) = test_loader.iter().next() {
                    let sample = test_batch.sources.slice_dim(0, 0..1).inner();
                    let path = debug_dir.join(format!("test_{epoch}.png"));
                    render_angle_sweep(&gan.generator.valid(), sample, &path)?;
                    tracker.log_image(&path)?;
                }
            }
        }
    }

    save_checkpoint(
        &gan,
        &model_dir.join(format!("model-{}", config.epochs - 1)),
    )?;
    write_training_state(&state_path, &state)?;

    Ok(())
}
