pub mod discriminator;
pub mod feature;
pub mod generator;

use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::prelude::*;

pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use feature::{FeatureNetwork, FeatureNetworkConfig};
pub use generator::{Generator, GeneratorConfig};

/// Hyperparameters shared by the generator, discriminator and feature net.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 64)]
    pub image_size: usize,
    #[config(default = 3)]
    pub input_channels: usize,
    #[config(default = 64)]
    pub generator_dim: usize,
    #[config(default = 64)]
    pub discriminator_dim: usize,
    #[config(default = 16)]
    pub feature_dim: usize,
}

impl ModelConfig {
    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        GeneratorConfig::new(self.generator_dim, self.input_channels).init(device)
    }

    pub fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        DiscriminatorConfig::new(self.discriminator_dim, self.input_channels, self.image_size)
            .init(device)
    }

    pub fn init_feature_network<B: Backend>(&self, device: &B::Device) -> FeatureNetwork<B> {
        FeatureNetworkConfig::new(self.feature_dim, self.input_channels).init(device)
    }
}

/// Weighting for the perceptual, gaze-consistency and reconstruction terms.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = 100.0)]
    pub lambda_p: f64,
    #[config(default = 5.0)]
    pub lambda_gaze: f64,
    #[config(default = 50.0)]
    pub lambda_recon: f64,
}

/// Two-class adversarial loss for the discriminator: real images towards
/// the real class, generated images towards the fake class.
pub fn adv_loss_d<B: Backend>(
    discriminator: &Discriminator<B>,
    real: Tensor<B, 4>,
    fake: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let device = real.device();
    let (real_logits, _) = discriminator.forward(real);
    let (fake_logits, _) = discriminator.forward(fake);
    let loss_fn = BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(&device);
    let ones = Tensor::<B, 2, Int>::ones(real_logits.dims(), &device);
    let zeros = Tensor::<B, 2, Int>::zeros(fake_logits.dims(), &device);
    loss_fn
        .forward(real_logits, ones)
        .add(loss_fn.forward(fake_logits, zeros))
}

/// Adversarial loss pushing generated images towards the real class. The
/// discriminator scores in inference mode here: this term only drives the
/// generator, so discriminator state must not move.
pub fn adv_loss_g<B: Backend>(
    discriminator: &Discriminator<B>,
    fake: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let device = fake.device();
    let (fake_logits, _) = discriminator.forward_inference(fake);
    let loss_fn = BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(&device);
    let ones = Tensor::<B, 2, Int>::ones(fake_logits.dims(), &device);
    loss_fn.forward(fake_logits, ones)
}

/// Gaze-head regression on real images against their true angles.
pub fn gaze_loss_d<B: Backend>(
    discriminator: &Discriminator<B>,
    real: Tensor<B, 4>,
    angles: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let (_, predicted) = discriminator.forward(real);
    predicted.sub(angles).square().mean()
}

/// Gaze-head regression on generated images against the requested target
/// angles. This term is what makes the redirection controllable; like
/// [`adv_loss_g`] it scores through the inference-mode discriminator.
pub fn gaze_loss_g<B: Backend>(
    discriminator: &Discriminator<B>,
    fake: Tensor<B, 4>,
    target_angles: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let (_, predicted) = discriminator.forward_inference(fake);
    predicted.sub(target_angles).square().mean()
}

/// Feature-space content and Gram-matrix style distances between generated
/// and target images, summed over the extractor's layers.
pub fn content_style_loss<B: Backend>(
    features: &FeatureNetwork<B>,
    fake: Tensor<B, 4>,
    target: Tensor<B, 4>,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let device = fake.device();
    let fake_feats = features.forward(fake);
    let target_feats = features.forward(target);

    let mut content = Tensor::<B, 1>::zeros([1], &device);
    let mut style = Tensor::<B, 1>::zeros([1], &device);
    for (fake_feat, target_feat) in fake_feats.into_iter().zip(target_feats) {
        content = content.add(
            fake_feat
                .clone()
                .sub(target_feat.clone())
                .square()
                .mean(),
        );
        style = style.add(
            gram_matrix(fake_feat)
                .sub(gram_matrix(target_feat))
                .square()
                .mean(),
        );
    }
    (content, style)
}

/// Per-image Gram matrix of channel correlations, normalized by layer size.
fn gram_matrix<B: Backend>(features: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, channels, height, width] = features.dims();
    let flat = features.reshape([batch, channels, height * width]);
    let gram = flat.clone().matmul(flat.transpose());
    gram.div_scalar((channels * height * width) as f64)
}

/// Pixel-space cycle-consistency distance between the original source image
/// and its redirect-and-return reconstruction.
pub fn reconstruction_loss<B: Backend>(
    original: Tensor<B, 4>,
    reconstructed: Tensor<B, 4>,
) -> Tensor<B, 1> {
    reconstructed.sub(original).abs().mean()
}

/// Loss terms entering the discriminator update.
#[derive(Debug)]
pub struct DiscriminatorLosses<B: Backend> {
    pub adv: Tensor<B, 1>,
    pub gaze: Tensor<B, 1>,
    pub total: Tensor<B, 1>,
}

/// Compute the discriminator objective for one batch:
/// `adv_d + lambda_gaze * gaze_d`.
pub fn discriminator_losses<B: Backend>(
    discriminator: &Discriminator<B>,
    loss_config: &LossConfig,
    real: Tensor<B, 4>,
    fake: Tensor<B, 4>,
    real_angles: Tensor<B, 2>,
) -> DiscriminatorLosses<B> {
    let adv = adv_loss_d(discriminator, real.clone(), fake);
    let gaze = gaze_loss_d(discriminator, real, real_angles);
    let total = adv
        .clone()
        .add(gaze.clone().mul_scalar(loss_config.lambda_gaze));
    DiscriminatorLosses { adv, gaze, total }
}

/// Loss terms entering the generator update.
#[derive(Debug)]
pub struct GeneratorLosses<B: Backend> {
    pub adv: Tensor<B, 1>,
    pub content: Tensor<B, 1>,
    pub style: Tensor<B, 1>,
    pub gaze: Tensor<B, 1>,
    pub recon: Tensor<B, 1>,
    pub total: Tensor<B, 1>,
}

/// Compute the generator objective for one batch:
/// `adv_g + lambda_p * (content + style) + lambda_gaze * gaze_g
///  + lambda_recon * recon`.
#[allow(clippy::too_many_arguments)]
pub fn generator_losses<B: Backend>(
    discriminator: &Discriminator<B>,
    features: &FeatureNetwork<B>,
    loss_config: &LossConfig,
    sources: Tensor<B, 4>,
    fake: Tensor<B, 4>,
    targets: Tensor<B, 4>,
    reconstructed: Tensor<B, 4>,
    target_angles: Tensor<B, 2>,
) -> GeneratorLosses<B> {
    let adv = adv_loss_g(discriminator, fake.clone());
    let (content, style) = content_style_loss(features, fake.clone(), targets);
    let gaze = gaze_loss_g(discriminator, fake, target_angles);
    let recon = reconstruction_loss(sources, reconstructed);

    let total = adv
        .clone()
        .add(
            content
                .clone()
                .add(style.clone())
                .mul_scalar(loss_config.lambda_p),
        )
        .add(gaze.clone().mul_scalar(loss_config.lambda_gaze))
        .add(recon.clone().mul_scalar(loss_config.lambda_recon));

    GeneratorLosses {
        adv,
        content,
        style,
        gaze,
        recon,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type TestBackend = burn::backend::NdArray<f32>;

    fn tiny_config() -> ModelConfig {
        ModelConfig::new()
            .with_image_size(16)
            .with_generator_dim(4)
            .with_discriminator_dim(4)
            .with_feature_dim(4)
    }

    fn image_batch(batch: usize, size: usize) -> Tensor<TestBackend, 4> {
        Tensor::random(
            [batch, 3, size, size],
            Distribution::Uniform(0.0, 1.0),
            &Default::default(),
        )
    }

    fn angle_batch(batch: usize) -> Tensor<TestBackend, 2> {
        Tensor::random(
            [batch, 2],
            Distribution::Uniform(-1.0, 1.0),
            &Default::default(),
        )
    }

    #[test]
    fn generator_preserves_shape() {
        let device = Default::default();
        let generator = tiny_config().init_generator::<TestBackend>(&device);
        let out = generator.forward(image_batch(2, 16), angle_batch(2));
        assert_eq!(out.dims(), [2, 3, 16, 16]);
    }

    #[test]
    fn discriminator_head_shapes() {
        let device = Default::default();
        let discriminator = tiny_config().init_discriminator::<TestBackend>(&device);
        let (logits, angles) = discriminator.forward(image_batch(2, 16));
        assert_eq!(logits.dims(), [2, 1]);
        assert_eq!(angles.dims(), [2, 2]);
    }

    #[test]
    fn feature_network_yields_ordered_pyramid() {
        let device = Default::default();
        let features = tiny_config().init_feature_network::<TestBackend>(&device);
        let maps = features.forward(image_batch(2, 16));
        assert_eq!(maps.len(), 4);
        // Spatial size halves between blocks; channels double.
        assert_eq!(maps[0].dims(), [2, 4, 16, 16]);
        assert_eq!(maps[1].dims(), [2, 8, 8, 8]);
        assert_eq!(maps[2].dims(), [2, 16, 4, 4]);
        assert_eq!(maps[3].dims(), [2, 32, 2, 2]);
    }

    fn scalar(t: Tensor<TestBackend, 1>) -> f64 {
        t.into_scalar().elem::<f64>()
    }

    #[test]
    fn composite_losses_are_finite_scalars() {
        let device = Default::default();
        let config = tiny_config();
        let generator = config.init_generator::<TestBackend>(&device);
        let discriminator = config.init_discriminator::<TestBackend>(&device);
        let features = config.init_feature_network::<TestBackend>(&device);
        let loss_config = LossConfig::new();

        let sources = image_batch(4, 16);
        let targets = image_batch(4, 16);
        let source_angles = angle_batch(4);
        let target_angles = angle_batch(4);

        let fake = generator.forward(sources.clone(), target_angles.clone());
        let reconstructed = generator.forward(fake.clone(), source_angles.clone());

        let d_losses = discriminator_losses(
            &discriminator,
            &loss_config,
            sources.clone(),
            fake.clone(),
            source_angles,
        );
        let g_losses = generator_losses(
            &discriminator,
            &features,
            &loss_config,
            sources,
            fake,
            targets,
            reconstructed,
            target_angles,
        );

        for loss in [
            d_losses.adv,
            d_losses.gaze,
            d_losses.total,
            g_losses.adv,
            g_losses.content,
            g_losses.style,
            g_losses.gaze,
            g_losses.recon,
            g_losses.total,
        ] {
            assert_eq!(loss.dims(), [1]);
            assert!(scalar(loss).is_finite());
        }
    }

    #[test]
    fn reconstruction_loss_is_zero_for_identical_images() {
        let images = image_batch(2, 16);
        let loss = reconstruction_loss(images.clone(), images);
        assert_eq!(scalar(loss), 0.0);
    }

    #[test]
    fn reconstruction_loss_finite_when_target_equals_source_angle() {
        // Degenerate redirect-to-self: the cycle still produces a finite,
        // computable loss even though the network output is only close to
        // the input, not equal.
        let device = Default::default();
        let generator = tiny_config().init_generator::<TestBackend>(&device);
        let sources = image_batch(2, 16);
        let angles = angle_batch(2);
        let fake = generator.forward(sources.clone(), angles.clone());
        let reconstructed = generator.forward(fake, angles);
        let loss = reconstruction_loss(sources, reconstructed);
        assert!(scalar(loss).is_finite());
    }

    #[test]
    fn content_and_style_are_zero_for_identical_inputs() {
        let device = Default::default();
        let features = tiny_config().init_feature_network::<TestBackend>(&device);
        let images = image_batch(2, 16);
        let (content, style) = content_style_loss(&features, images.clone(), images);
        assert_eq!(scalar(content), 0.0);
        assert_eq!(scalar(style), 0.0);
    }
}
