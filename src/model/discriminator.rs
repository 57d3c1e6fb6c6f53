use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Configuration for the discriminator with an auxiliary gaze head.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub discriminator_dim: usize,
    pub input_channels: usize,
    pub image_size: usize,
}

/// Discriminator with adversarial and gaze-regression heads.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    convs: Vec<Conv2d<B>>,
    bns: Vec<BatchNorm<B>>,
    fc_adv: Linear<B>,
    fc_gaze: Linear<B>,
}

impl DiscriminatorConfig {
    /// Initialize the discriminator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let dim = self.discriminator_dim;
        let convs = vec![
            conv(self.input_channels, dim, true, device, 2),
            conv(dim, dim * 2, false, device, 2),
            conv(dim * 2, dim * 4, false, device, 2),
            conv(dim * 4, dim * 8, false, device, 1),
        ];
        let bns = vec![
            BatchNormConfig::new(dim * 2).init(device),
            BatchNormConfig::new(dim * 4).init(device),
            BatchNormConfig::new(dim * 8).init(device),
        ];

        let mut size = self.image_size;
        size = conv_out(size, 4, 2, 1);
        size = conv_out(size, 4, 2, 1);
        size = conv_out(size, 4, 2, 1);
        size = conv_out(size, 4, 1, 1);
        let flat_dim = size * size * dim * 8;

        let fc_adv = LinearConfig::new(flat_dim, 1).init(device);
        let fc_gaze = LinearConfig::new(flat_dim, 2).init(device);

        Discriminator {
            convs,
            bns,
            fc_adv,
            fc_gaze,
        }
    }
}

impl<B: Backend> Discriminator<B> {
    /// Forward pass returning (realness_logits [batch, 1], predicted
    /// normalized gaze angle [batch, 2]).
    pub fn forward(&self, images: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let mut x = leaky_relu(self.convs[0].forward(images), 0.2);
        x = leaky_relu(self.bns[0].forward(self.convs[1].forward(x)), 0.2);
        x = leaky_relu(self.bns[1].forward(self.convs[2].forward(x)), 0.2);
        x = leaky_relu(self.bns[2].forward(self.convs[3].forward(x)), 0.2);
        self.heads(x)
    }

    /// Forward pass that reads batch norm running statistics without
    /// updating them. Used when the discriminator only scores another
    /// network's output: gradients still flow to the input images, but no
    /// discriminator state moves.
    pub fn forward_inference(&self, images: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let mut x = leaky_relu(self.convs[0].forward(images), 0.2);
        x = leaky_relu(batch_norm_inference(&self.bns[0], self.convs[1].forward(x)), 0.2);
        x = leaky_relu(batch_norm_inference(&self.bns[1], self.convs[2].forward(x)), 0.2);
        x = leaky_relu(batch_norm_inference(&self.bns[2], self.convs[3].forward(x)), 0.2);
        self.heads(x)
    }

    fn heads(&self, x: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let [batch, channels, height, width] = x.dims();
        let flat = x.reshape([batch, channels * height * width]);
        let logits = self.fc_adv.forward(flat.clone());
        let angles = self.fc_gaze.forward(flat);
        (logits, angles)
    }
}

/// Normalize with the layer's running statistics, leaving them untouched.
fn batch_norm_inference<B: Backend>(bn: &BatchNorm<B>, x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, channels, _, _] = x.dims();
    let shape = [1, channels, 1, 1];
    let mean = bn.running_mean.value().detach().reshape(shape);
    let var = bn.running_var.value().detach().reshape(shape);
    let normalized = x.sub(mean).div(var.add_scalar(bn.epsilon).sqrt());
    normalized
        .mul(bn.gamma.val().reshape(shape))
        .add(bn.beta.val().reshape(shape))
}

fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    bias: bool,
    device: &B::Device,
    stride: usize,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(bias)
        .init(device)
}

fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}
