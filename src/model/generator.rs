use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, relu, sigmoid};

/// Configuration for the angle-conditioned U-Net generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub generator_dim: usize,
    pub input_channels: usize,
    #[config(default = 2)]
    pub angle_channels: usize,
}

/// U-Net generator that redirects gaze to a requested angle.
///
/// The target angle enters as two constant planes stacked onto the input
/// image, so the same network handles both the forward redirection and the
/// cyclic re-redirection back to the source angle.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    enc_convs: Vec<Conv2d<B>>,
    enc_bns: Vec<BatchNorm<B>>,
    dec_convs: Vec<ConvTranspose2d<B>>,
    dec_bns: Vec<BatchNorm<B>>,
    dropout: Dropout,
    #[module(ignore)]
    angle_channels: usize,
}

impl GeneratorConfig {
    /// Initialize generator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let dim = self.generator_dim;
        let in_channels = self.input_channels + self.angle_channels;

        let enc_convs = vec![
            enc_conv(in_channels, dim, true, device),
            enc_conv(dim, dim * 2, false, device),
            enc_conv(dim * 2, dim * 4, false, device),
            enc_conv(dim * 4, dim * 4, false, device),
        ];
        let enc_bns = vec![
            BatchNormConfig::new(dim * 2).init(device),
            BatchNormConfig::new(dim * 4).init(device),
            BatchNormConfig::new(dim * 4).init(device),
        ];

        let dec_convs = vec![
            dec_conv(dim * 4, dim * 4, false, device),
            dec_conv(dim * 8, dim * 2, false, device),
            dec_conv(dim * 4, dim, false, device),
            dec_conv(dim * 2, self.input_channels, true, device),
        ];
        let dec_bns = vec![
            BatchNormConfig::new(dim * 4).init(device),
            BatchNormConfig::new(dim * 2).init(device),
            BatchNormConfig::new(dim).init(device),
        ];

        Generator {
            enc_convs,
            enc_bns,
            dec_convs,
            dec_bns,
            dropout: DropoutConfig::new(0.5).init(),
            angle_channels: self.angle_channels,
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Redirect `images` ([batch, 3, s, s] in [0, 1]) to the normalized gaze
    /// angles in `angles` ([batch, 2]); output has the input's shape.
    pub fn forward(&self, images: Tensor<B, 4>, angles: Tensor<B, 2>) -> Tensor<B, 4> {
        let x = self.condition(images, angles);
        let (encoded, enc_layers) = self.encode(x);
        self.decode(encoded, &enc_layers)
    }

    /// Tile the angle pair into constant planes and stack them onto the image.
    fn condition(&self, images: Tensor<B, 4>, angles: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, _, height, width] = images.dims();
        let planes = angles
            .reshape([batch, self.angle_channels, 1, 1])
            .repeat(&[1, 1, height, width]);
        Tensor::cat(vec![images, planes], 1)
    }

    fn encode(&self, images: Tensor<B, 4>) -> (Tensor<B, 4>, Vec<Tensor<B, 4>>) {
        let mut layers = Vec::with_capacity(self.enc_convs.len());
        let mut x = self.enc_convs[0].forward(images);
        layers.push(x.clone());
        for idx in 1..self.enc_convs.len() {
            x = leaky_relu(x, 0.2);
            x = self.enc_convs[idx].forward(x);
            x = self.enc_bns[idx - 1].forward(x);
            layers.push(x.clone());
        }
        (x, layers)
    }

    fn decode(&self, mut x: Tensor<B, 4>, enc_layers: &[Tensor<B, 4>]) -> Tensor<B, 4> {
        // U-Net decoder: dropout at the bottleneck, skip connections for
        // spatial detail.
        let last = self.dec_convs.len() - 1;
        for idx in 0..self.dec_convs.len() {
            x = relu(x);
            x = self.dec_convs[idx].forward(x);
            if idx != last {
                x = self.dec_bns[idx].forward(x);
            }
            if idx == 0 {
                x = self.dropout.forward(x);
            }
            if idx != last {
                let skip = enc_layers[last - 1 - idx].clone();
                x = Tensor::cat(vec![x, skip], 1);
            }
        }
        sigmoid(x)
    }
}

fn enc_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    bias: bool,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(bias)
        .init(device)
}

fn dec_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    bias: bool,
    device: &B::Device,
) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .with_bias(bias)
        .init(device)
}
