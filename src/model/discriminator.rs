use crate::model::geometry::VideoGeometry;
use crate::model::layers::{BatchNorm, ForwardMode};
use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::nn::{Initializer, Linear, LinearConfig, PaddingConfig3d};
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, sigmoid};

/// Configuration for the 3D-convolutional video discriminator.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub discriminator_filters: usize,
    pub color_channels: usize,
    #[config(default = 0.2)]
    pub leaky_slope: f64,
}

/// Real/fake scores for a batch of clips, each `[batch, 1]`.
#[derive(Clone, Debug)]
pub struct DiscriminatorOutput<B: Backend> {
    pub probability: Tensor<B, 2>,
    pub logits: Tensor<B, 2>,
}

/// Four conv3d stages (batch norm on all but the first) and a single-logit projection.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    convs: Vec<Conv3d<B>>,
    bns: Vec<BatchNorm<B>>,
    project: Linear<B>,
    #[module(ignore)]
    leaky_slope: f64,
}

impl DiscriminatorConfig {
    /// Initialize the discriminator layers on the given device.
    pub fn init<B: Backend>(&self, geometry: &VideoGeometry, device: &B::Device) -> Discriminator<B> {
        let df = self.discriminator_filters;
        let strides = geometry.discriminator_time_strides;
        let convs = vec![
            conv(self.color_channels, df, strides[0], device),
            conv(df, df * 2, strides[1], device),
            conv(df * 2, df * 4, strides[2], device),
            conv(df * 4, df * 8, strides[3], device),
        ];
        // The first stage sees raw pixels and is left unnormalized.
        let bns = vec![
            BatchNorm::new(df * 2, device),
            BatchNorm::new(df * 4, device),
            BatchNorm::new(df * 8, device),
        ];

        let [time, height, width] = geometry.discriminator_out;
        let flat_dim = df * 8 * time * height * width;
        let project = LinearConfig::new(flat_dim, 1)
            .with_initializer(Initializer::Normal {
                mean: 0.0,
                std: 0.02,
            })
            .init(device);

        Discriminator {
            convs,
            bns,
            project,
            leaky_slope: self.leaky_slope,
        }
    }
}

impl<B: Backend> Discriminator<B> {
    /// Score channel-first clips `[batch, channels, time, height, width]`.
    pub fn forward(&self, videos: Tensor<B, 5>, mode: ForwardMode) -> DiscriminatorOutput<B> {
        let mut x = leaky_relu(self.convs[0].forward(videos), self.leaky_slope);
        for (conv, bn) in self.convs.iter().skip(1).zip(self.bns.iter()) {
            x = leaky_relu(bn.forward(conv.forward(x), mode), self.leaky_slope);
        }

        let [batch, channels, time, height, width] = x.dims();
        let flat = x.reshape([batch, channels * time * height * width]);
        let logits = self.project.forward(flat);
        DiscriminatorOutput {
            probability: sigmoid(logits.clone()),
            logits,
        }
    }

    /// Weights of the final projection.
    pub fn projection_weights(&self) -> Tensor<B, 2> {
        self.project.weight.val()
    }

    /// Every trainable tensor, flattened: conv weights and biases, norm scales
    /// and shifts, then the projection. Running statistics are not included.
    pub fn trainable_tensors(&self) -> Vec<Tensor<B, 1>> {
        let mut tensors = Vec::new();
        for conv in &self.convs {
            tensors.push(conv.weight.val().flatten::<1>(0, 4));
            if let Some(bias) = &conv.bias {
                tensors.push(bias.val());
            }
        }
        for bn in &self.bns {
            tensors.extend(bn.affine());
        }
        tensors.push(self.project.weight.val().flatten::<1>(0, 1));
        if let Some(bias) = &self.project.bias {
            tensors.push(bias.val());
        }
        tensors
    }
}

/// Halves height and width; halves time when `time_stride` is 2, keeps it when 1.
fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    time_stride: usize,
    device: &B::Device,
) -> Conv3d<B> {
    let time_kernel = if time_stride == 2 { 4 } else { 3 };
    Conv3dConfig::new([in_channels, out_channels], [time_kernel, 4, 4])
        .with_stride([time_stride, 2, 2])
        .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
        .with_initializer(Initializer::Normal {
            mean: 0.0,
            std: 0.02,
        })
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn setup() -> (Discriminator<TestBackend>, VideoGeometry) {
        let device = Default::default();
        let geometry = VideoGeometry::new([8, 16, 16, 3], 16, 3).unwrap();
        let discriminator = DiscriminatorConfig::new(4, 3).init(&geometry, &device);
        (discriminator, geometry)
    }

    fn clips(batch: usize) -> Tensor<TestBackend, 5> {
        let device = Default::default();
        Tensor::random([batch, 3, 8, 16, 16], Distribution::Uniform(-1.0, 1.0), &device)
    }

    #[test]
    fn produces_one_logit_per_clip() {
        let (discriminator, _) = setup();
        let out = discriminator.forward(clips(3), ForwardMode::Train);
        assert_eq!(out.logits.dims(), [3, 1]);
        assert_eq!(out.probability.dims(), [3, 1]);

        let logits = out.logits.to_data().to_vec::<f32>().unwrap();
        let probs = out.probability.to_data().to_vec::<f32>().unwrap();
        for (logit, prob) in logits.iter().zip(probs.iter()) {
            let expected = 1.0 / (1.0 + (-logit).exp());
            assert!((prob - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn repeated_calls_share_weights() {
        let (discriminator, _) = setup();
        let before = discriminator.trainable_tensors();
        // Four convs with bias, three norms, projection with bias.
        assert_eq!(before.len(), 4 * 2 + 3 * 2 + 2);

        discriminator.forward(clips(2), ForwardMode::Train);
        discriminator.forward(clips(2), ForwardMode::Train);

        let after = discriminator.trainable_tensors();
        for (old, new) in before.into_iter().zip(after) {
            assert_eq!(old.to_data(), new.to_data());
        }
    }

    #[test]
    fn inference_mode_is_deterministic() {
        let (discriminator, _) = setup();
        let input = clips(2);
        let first = discriminator.forward(input.clone(), ForwardMode::Inference);
        let second = discriminator.forward(input, ForwardMode::Inference);
        assert_eq!(first.logits.to_data(), second.logits.to_data());
    }
}
