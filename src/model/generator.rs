use crate::model::geometry::{VideoGeometry, SPATIAL_STAGES};
use crate::model::layers::{BatchNorm, ForwardMode};
use burn::nn::conv::{ConvTranspose2d, ConvTranspose2dConfig, ConvTranspose3d, ConvTranspose3dConfig};
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{relu, sigmoid};

/// Configuration for the two-stream generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub z_dim: usize,
    pub generator_filters: usize,
    pub color_channels: usize,
}

/// Tensors produced by one generator pass, channel-first (`[batch, channels, time, h, w]`).
#[derive(Clone, Debug)]
pub struct GeneratorOutput<B: Backend> {
    /// Composite `foreground * mask + background * (1 - mask)`.
    pub video: Tensor<B, 5>,
    /// Per-pixel, per-frame opacity in `[0, 1]`, single channel.
    pub mask: Tensor<B, 5>,
    pub foreground: Tensor<B, 5>,
    /// Static frame replicated over time.
    pub background: Tensor<B, 5>,
    /// L1 norm of the mask head weights; only computed in training mode.
    pub mask_penalty: Option<Tensor<B, 1>>,
}

/// Generator with a static 2D background stream and a dynamic 3D foreground/mask stream.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    static_project: Linear<B>,
    static_deconvs: Vec<ConvTranspose2d<B>>,
    static_norms: Vec<BatchNorm<B>>,
    dynamic_project: Linear<B>,
    dynamic_deconvs: Vec<ConvTranspose3d<B>>,
    dynamic_norms: Vec<BatchNorm<B>>,
    mask_head: ConvTranspose3d<B>,
    foreground_head: ConvTranspose3d<B>,
    #[module(ignore)]
    filters: usize,
    #[module(ignore)]
    base_size: usize,
    #[module(ignore)]
    base_frames: usize,
    #[module(ignore)]
    frames: usize,
}

impl GeneratorConfig {
    /// Initialize generator layers for the given resolution schedule.
    pub fn init<B: Backend>(&self, geometry: &VideoGeometry, device: &B::Device) -> Generator<B> {
        let gf = self.generator_filters;
        let base = geometry.base_size;
        let channels = [gf * 8, gf * 4, gf * 2, gf];

        let static_project = linear(self.z_dim, channels[0] * base * base, device);
        let mut static_deconvs = Vec::with_capacity(SPATIAL_STAGES);
        static_deconvs.push(deconv2d(channels[0], channels[1], device));
        static_deconvs.push(deconv2d(channels[1], channels[2], device));
        static_deconvs.push(deconv2d(channels[2], channels[3], device));
        static_deconvs.push(deconv2d(channels[3], self.color_channels, device));
        let static_norms = channels
            .iter()
            .map(|&c| BatchNorm::new(c, device))
            .collect();

        let strides = geometry.generator_time_strides;
        let dynamic_project = linear(
            self.z_dim,
            channels[0] * geometry.base_frames * base * base,
            device,
        );
        let mut dynamic_deconvs = Vec::with_capacity(SPATIAL_STAGES - 1);
        dynamic_deconvs.push(deconv3d(channels[0], channels[1], strides[0], device));
        dynamic_deconvs.push(deconv3d(channels[1], channels[2], strides[1], device));
        dynamic_deconvs.push(deconv3d(channels[2], channels[3], strides[2], device));
        let dynamic_norms = channels
            .iter()
            .map(|&c| BatchNorm::new(c, device))
            .collect();

        let mask_head = deconv3d(channels[3], 1, strides[3], device);
        let foreground_head = deconv3d(channels[3], self.color_channels, strides[3], device);

        Generator {
            static_project,
            static_deconvs,
            static_norms,
            dynamic_project,
            dynamic_deconvs,
            dynamic_norms,
            mask_head,
            foreground_head,
            filters: gf,
            base_size: base,
            base_frames: geometry.base_frames,
            frames: geometry.frames,
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Synthesize videos from latent codes `[batch, z_dim]`.
    pub fn forward(&self, z: Tensor<B, 2>, mode: ForwardMode) -> GeneratorOutput<B> {
        let background = self.background(z.clone(), mode);
        let [batch, channels, height, width] = background.dims();
        let background = background
            .reshape([batch, channels, 1, height, width])
            .repeat_dim(2, self.frames);

        let features = self.dynamic_features(z, mode);
        let mask = sigmoid(self.mask_head.forward(features.clone()));
        let foreground = self.foreground_head.forward(features).tanh();

        let video = composite(foreground.clone(), background.clone(), mask.clone());
        let mask_penalty = match mode {
            ForwardMode::Train => Some(self.mask_penalty()),
            ForwardMode::Inference => None,
        };

        GeneratorOutput {
            video,
            mask,
            foreground,
            background,
            mask_penalty,
        }
    }

    /// Sum of absolute mask-head weights (a weight regularizer, not an activation one).
    pub fn mask_penalty(&self) -> Tensor<B, 1> {
        self.mask_head.weight.val().abs().sum()
    }

    /// Weights of the mask head.
    pub fn mask_weights(&self) -> Tensor<B, 5> {
        self.mask_head.weight.val()
    }

    /// Static stream: one frame `[batch, channels, size, size]` in `[-1, 1]`.
    fn background(&self, z: Tensor<B, 2>, mode: ForwardMode) -> Tensor<B, 4> {
        let batch = z.dims()[0];
        let mut x = self
            .static_project
            .forward(z)
            .reshape([batch, self.filters * 8, self.base_size, self.base_size]);
        x = relu(self.static_norms[0].forward(x, mode));
        for idx in 0..self.static_deconvs.len() - 1 {
            x = self.static_deconvs[idx].forward(x);
            x = relu(self.static_norms[idx + 1].forward(x, mode));
        }
        self.static_deconvs[self.static_deconvs.len() - 1]
            .forward(x)
            .tanh()
    }

    /// Dynamic trunk: the feature volume both heads branch from.
    fn dynamic_features(&self, z: Tensor<B, 2>, mode: ForwardMode) -> Tensor<B, 5> {
        let batch = z.dims()[0];
        let mut x = self.dynamic_project.forward(z).reshape([
            batch,
            self.filters * 8,
            self.base_frames,
            self.base_size,
            self.base_size,
        ]);
        x = relu(self.dynamic_norms[0].forward(x, mode));
        for (deconv, norm) in self.dynamic_deconvs.iter().zip(self.dynamic_norms.iter().skip(1)) {
            x = relu(norm.forward(deconv.forward(x), mode));
        }
        x
    }
}

/// Alpha-composite: the mask selects foreground (1) or background (0) per pixel and frame.
pub fn composite<B: Backend>(
    foreground: Tensor<B, 5>,
    background: Tensor<B, 5>,
    mask: Tensor<B, 5>,
) -> Tensor<B, 5> {
    let inverse = mask.clone().neg().add_scalar(1.0);
    foreground.mul(mask).add(background.mul(inverse))
}

fn normal_init() -> Initializer {
    Initializer::Normal {
        mean: 0.0,
        std: 0.02,
    }
}

fn linear<B: Backend>(d_input: usize, d_output: usize, device: &B::Device) -> Linear<B> {
    LinearConfig::new(d_input, d_output)
        .with_initializer(normal_init())
        .init(device)
}

fn deconv2d<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .with_initializer(normal_init())
        .init(device)
}

/// Doubles height and width; doubles time when `time_stride` is 2, keeps it when 1.
fn deconv3d<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    time_stride: usize,
    device: &B::Device,
) -> ConvTranspose3d<B> {
    let time_kernel = if time_stride == 2 { 4 } else { 3 };
    ConvTranspose3dConfig::new([in_channels, out_channels], [time_kernel, 4, 4])
        .with_stride([time_stride, 2, 2])
        .with_padding([1, 1, 1])
        .with_initializer(normal_init())
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn small_generator(geometry: &VideoGeometry) -> Generator<TestBackend> {
        let device = Default::default();
        GeneratorConfig::new(6, 4, geometry.channels).init(geometry, &device)
    }

    fn latent(batch: usize) -> Tensor<TestBackend, 2> {
        let device = Default::default();
        Tensor::random(
            [batch, 6],
            burn::tensor::Distribution::Uniform(-1.0, 1.0),
            &device,
        )
    }

    #[test]
    fn streams_have_expected_shapes() {
        let geometry = VideoGeometry::new([8, 16, 16, 3], 16, 3).unwrap();
        let generator = small_generator(&geometry);
        let out = generator.forward(latent(2), ForwardMode::Train);

        assert_eq!(out.video.dims(), [2, 3, 8, 16, 16]);
        assert_eq!(out.foreground.dims(), [2, 3, 8, 16, 16]);
        assert_eq!(out.background.dims(), [2, 3, 8, 16, 16]);
        assert_eq!(out.mask.dims(), [2, 1, 8, 16, 16]);
    }

    #[test]
    fn mask_is_a_soft_selector() {
        let geometry = VideoGeometry::new([8, 16, 16, 3], 16, 3).unwrap();
        let generator = small_generator(&geometry);
        let out = generator.forward(latent(2), ForwardMode::Train);

        let mask = out.mask.to_data().to_vec::<f32>().unwrap();
        assert!(mask.iter().all(|m| (0.0..=1.0).contains(m)));
    }

    #[test]
    fn video_is_alpha_composite_of_streams() {
        let geometry = VideoGeometry::new([8, 16, 16, 3], 16, 3).unwrap();
        let generator = small_generator(&geometry);
        let out = generator.forward(latent(2), ForwardMode::Train);

        let mask = out.mask.repeat_dim(1, 3).to_data().to_vec::<f32>().unwrap();
        let fg = out.foreground.to_data().to_vec::<f32>().unwrap();
        let bg = out.background.to_data().to_vec::<f32>().unwrap();
        let video = out.video.to_data().to_vec::<f32>().unwrap();
        for idx in 0..video.len() {
            let expected = mask[idx] * fg[idx] + (1.0 - mask[idx]) * bg[idx];
            assert!((video[idx] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn background_is_constant_over_time() {
        let geometry = VideoGeometry::new([4, 16, 16, 1], 16, 1).unwrap();
        let generator = small_generator(&geometry);
        let out = generator.forward(latent(1), ForwardMode::Inference);

        let first = out.background.clone().slice_dim(2, 0..1);
        for t in 1..4 {
            let frame = out.background.clone().slice_dim(2, t..t + 1);
            let diff = frame.sub(first.clone()).abs().max().into_scalar();
            assert_eq!(diff, 0.0);
        }
    }

    #[test]
    fn penalty_is_l1_of_mask_weights_and_only_in_training() {
        let geometry = VideoGeometry::new([8, 16, 16, 3], 16, 3).unwrap();
        let generator = small_generator(&geometry);

        let train = generator.forward(latent(1), ForwardMode::Train);
        let penalty = train.mask_penalty.unwrap().into_scalar();
        let expected: f32 = generator
            .mask_weights()
            .to_data()
            .to_vec::<f32>()
            .unwrap()
            .iter()
            .map(|w| w.abs())
            .sum();
        assert!((penalty - expected).abs() < 1e-3 * expected.max(1.0));

        let inference = generator.forward(latent(1), ForwardMode::Inference);
        assert!(inference.mask_penalty.is_none());
    }
}
