use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Configuration for the fixed feature pyramid behind the perceptual loss.
#[derive(Config, Debug)]
pub struct FeatureNetworkConfig {
    pub feature_dim: usize,
    pub input_channels: usize,
    #[config(default = 4)]
    pub num_blocks: usize,
}

/// VGG-style conv pyramid whose intermediate activations feed the
/// content/style loss. The weights are loaded from an exported record and
/// never optimized during training.
#[derive(Module, Debug)]
pub struct FeatureNetwork<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
}

impl FeatureNetworkConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FeatureNetwork<B> {
        let mut convs = Vec::with_capacity(self.num_blocks);
        let mut in_channels = self.input_channels;
        for idx in 0..self.num_blocks {
            let out_channels = self.feature_dim << idx;
            convs.push(
                Conv2dConfig::new([in_channels, out_channels], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
            );
            in_channels = out_channels;
        }

        FeatureNetwork {
            convs,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }
}

impl<B: Backend> FeatureNetwork<B> {
    /// Ordered multi-layer feature maps, coarsest last.
    pub fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut features = Vec::with_capacity(self.convs.len());
        let mut x = images;
        for (idx, conv) in self.convs.iter().enumerate() {
            x = relu(conv.forward(x));
            features.push(x.clone());
            if idx != self.convs.len() - 1 {
                x = self.pool.forward(x);
            }
        }
        features
    }
}
