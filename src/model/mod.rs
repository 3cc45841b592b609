pub mod discriminator;
pub mod generator;
pub mod geometry;
pub mod layers;
pub mod params;

use crate::error::{ModelError, ModelResult};
use burn::module::Ignored;
use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::Distribution;

pub use discriminator::{Discriminator, DiscriminatorConfig, DiscriminatorOutput};
pub use generator::{composite, Generator, GeneratorConfig, GeneratorOutput};
pub use geometry::VideoGeometry;
pub use layers::{BatchNorm, ForwardMode};
pub use params::ParamGroup;

/// Hyperparameters of the video GAN.
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// `[frames, height, width, channels]` of every real and generated clip.
    #[config(default = "[32, 64, 64, 3]")]
    pub video_shape: [usize; 4],
    #[config(default = 100)]
    pub batch_size: usize,
    /// Batch size used by [`VideoGan::sample`].
    #[config(default = 64)]
    pub sample_size: usize,
    /// Frame height and width; a multiple of 16.
    #[config(default = 64)]
    pub output_size: usize,
    #[config(default = 100)]
    pub z_dim: usize,
    /// Filters of the last generator stage; earlier stages use 2x, 4x and 8x.
    #[config(default = 64)]
    pub generator_filters: usize,
    /// Filters of the first discriminator stage; later stages use 2x, 4x and 8x.
    #[config(default = 64)]
    pub discriminator_filters: usize,
    /// Accepted for compatibility; the convolutional streams have no hidden dense layer.
    #[config(default = 1024)]
    pub generator_fc_dim: usize,
    /// Accepted for compatibility; the discriminator projects straight to one logit.
    #[config(default = 1024)]
    pub discriminator_fc_dim: usize,
    #[config(default = 3)]
    pub color_channels: usize,
    /// Weight of the mask-sparsity penalty in the generator loss.
    #[config(default = 0.1)]
    pub mask_penalty: f64,
    #[config(default = 0.2)]
    pub leaky_slope: f64,
}

impl ModelConfig {
    /// Validate every field and derive the resolution schedule.
    pub fn geometry(&self) -> ModelResult<VideoGeometry> {
        let sizes = [
            ("batch_size", self.batch_size),
            ("sample_size", self.sample_size),
            ("z_dim", self.z_dim),
            ("generator_filters", self.generator_filters),
            ("discriminator_filters", self.discriminator_filters),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(ModelError::InvalidConfig(format!("{name} must be positive")));
        }
        if !self.mask_penalty.is_finite() || self.mask_penalty < 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "mask_penalty must be finite and non-negative, got {}",
                self.mask_penalty
            )));
        }
        VideoGeometry::new(self.video_shape, self.output_size, self.color_channels)
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(self.z_dim, self.generator_filters, self.color_channels)
    }

    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        DiscriminatorConfig::new(self.discriminator_filters, self.color_channels)
            .with_leaky_slope(self.leaky_slope)
    }

    /// Build the model, failing fast on an invalid configuration.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ModelResult<VideoGan<B>> {
        let geometry = self.geometry()?;
        let generator = self.generator_config().init(&geometry, device);
        let discriminator = self.discriminator_config().init(&geometry, device);
        Ok(VideoGan {
            generator,
            discriminator,
            config: Ignored(self.clone()),
            geometry: Ignored(geometry),
        })
    }
}

/// Loss tensors of one adversarial step plus the tensors needed for logging.
#[derive(Debug)]
pub struct GanLosses<B: Backend> {
    pub discriminator_loss: Tensor<B, 1>,
    pub discriminator_real_loss: Tensor<B, 1>,
    pub discriminator_fake_loss: Tensor<B, 1>,
    pub generator_loss: Tensor<B, 1>,
    pub adversarial_loss: Tensor<B, 1>,
    pub mask_penalty: Tensor<B, 1>,
    pub real_probability: Tensor<B, 2>,
    pub fake_probability: Tensor<B, 2>,
    pub fake_videos: Tensor<B, 5>,
}

/// Scalar view of [`GanLosses`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LossSummary {
    pub discriminator_loss: f64,
    pub discriminator_real_loss: f64,
    pub discriminator_fake_loss: f64,
    pub generator_loss: f64,
    pub adversarial_loss: f64,
    pub mask_penalty: f64,
}

impl<B: Backend> GanLosses<B> {
    /// Read the scalar losses back, failing on NaN or infinity.
    pub fn summary(&self) -> ModelResult<LossSummary> {
        let summary = LossSummary {
            discriminator_loss: scalar(&self.discriminator_loss),
            discriminator_real_loss: scalar(&self.discriminator_real_loss),
            discriminator_fake_loss: scalar(&self.discriminator_fake_loss),
            generator_loss: scalar(&self.generator_loss),
            adversarial_loss: scalar(&self.adversarial_loss),
            mask_penalty: scalar(&self.mask_penalty),
        };
        let values = [
            ("discriminator_loss", summary.discriminator_loss),
            ("discriminator_real_loss", summary.discriminator_real_loss),
            ("discriminator_fake_loss", summary.discriminator_fake_loss),
            ("generator_loss", summary.generator_loss),
            ("adversarial_loss", summary.adversarial_loss),
            ("mask_penalty", summary.mask_penalty),
        ];
        for (what, value) in values {
            if !value.is_finite() {
                return Err(ModelError::NonFinite { what, value });
            }
        }
        Ok(summary)
    }
}

fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> f64 {
    tensor.clone().into_scalar().elem::<f64>()
}

/// Generator and discriminator with separately owned parameters.
#[derive(Module, Debug)]
pub struct VideoGan<B: Backend> {
    generator: Generator<B>,
    discriminator: Discriminator<B>,
    config: Ignored<ModelConfig>,
    geometry: Ignored<VideoGeometry>,
}

impl<B: Backend> VideoGan<B> {
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn geometry(&self) -> &VideoGeometry {
        &self.geometry
    }

    pub fn generator(&self) -> &Generator<B> {
        &self.generator
    }

    pub fn discriminator(&self) -> &Discriminator<B> {
        &self.discriminator
    }

    /// Replace the generator, e.g. with the result of an optimizer step.
    pub fn map_generator(mut self, f: impl FnOnce(Generator<B>) -> Generator<B>) -> Self {
        self.generator = f(self.generator);
        self
    }

    /// Replace the discriminator, e.g. with the result of an optimizer step.
    pub fn map_discriminator(
        mut self,
        f: impl FnOnce(Discriminator<B>) -> Discriminator<B>,
    ) -> Self {
        self.discriminator = f(self.discriminator);
        self
    }

    pub fn generator_parameters(&self) -> ParamGroup {
        ParamGroup::collect::<B, _>("generator", &self.generator)
    }

    pub fn discriminator_parameters(&self) -> ParamGroup {
        ParamGroup::collect::<B, _>("discriminator", &self.discriminator)
    }

    /// Training-mode synthesis of `batch_size` clips, channel-last, with the mask penalty.
    pub fn generate(&self, z: Tensor<B, 2>) -> ModelResult<GeneratorOutput<B>> {
        self.check_latent(&z, self.config.batch_size)?;
        Ok(channels_last_output(self.generator.forward(z, ForwardMode::Train)))
    }

    /// Score channel-last clips `[batch_size, frames, height, width, channels]`.
    ///
    /// Every call goes through the same discriminator instance, so scoring real
    /// and generated clips always shares one parameter set.
    pub fn discriminate(&self, videos: Tensor<B, 5>) -> ModelResult<DiscriminatorOutput<B>> {
        self.check_videos(&videos)?;
        Ok(self
            .discriminator
            .forward(to_channels_first(videos), ForwardMode::Train))
    }

    /// Inference-mode synthesis of `sample_size` clips, detached from any autodiff graph.
    pub fn sample(&self, z: Tensor<B, 2>) -> ModelResult<Tensor<B, 5>> {
        Ok(self.decompose(z)?.video)
    }

    /// Like [`sample`](Self::sample) but also returns the mask and both streams.
    pub fn decompose(&self, z: Tensor<B, 2>) -> ModelResult<GeneratorOutput<B>> {
        self.check_latent(&z, self.config.sample_size)?;
        let out = channels_last_output(self.generator.forward(z, ForwardMode::Inference));
        Ok(GeneratorOutput {
            video: out.video.detach(),
            mask: out.mask.detach(),
            foreground: out.foreground.detach(),
            background: out.background.detach(),
            mask_penalty: None,
        })
    }

    /// Generate once, score real and fake clips, and assemble both objectives.
    pub fn losses(&self, real: Tensor<B, 5>, z: Tensor<B, 2>) -> ModelResult<GanLosses<B>> {
        let generated = self.generate(z)?;
        let mask_penalty = generated
            .mask_penalty
            .unwrap_or_else(|| self.generator.mask_penalty());
        let real_out = self.discriminate(real)?;
        let fake_out = self.discriminate(generated.video.clone())?;

        let device = real_out.logits.device();
        let bce = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&device);
        let ones = Tensor::<B, 2, Int>::ones(real_out.logits.dims(), &device);
        let zeros = Tensor::<B, 2, Int>::zeros(fake_out.logits.dims(), &device);

        let discriminator_real_loss = bce.forward(real_out.logits, ones.clone());
        let discriminator_fake_loss = bce.forward(fake_out.logits.clone(), zeros);
        let adversarial_loss = bce.forward(fake_out.logits, ones);

        let discriminator_loss = discriminator_real_loss
            .clone()
            .add(discriminator_fake_loss.clone());
        let generator_loss = adversarial_loss
            .clone()
            .add(mask_penalty.clone().mul_scalar(self.config.mask_penalty));

        Ok(GanLosses {
            discriminator_loss,
            discriminator_real_loss,
            discriminator_fake_loss,
            generator_loss,
            adversarial_loss,
            mask_penalty,
            real_probability: real_out.probability,
            fake_probability: fake_out.probability,
            fake_videos: generated.video,
        })
    }

    fn check_latent(&self, z: &Tensor<B, 2>, batch: usize) -> ModelResult<()> {
        let expected = [batch, self.config.z_dim];
        let actual = z.dims();
        if actual != expected {
            return Err(ModelError::shape("latent batch", &expected, &actual));
        }
        Ok(())
    }

    fn check_videos(&self, videos: &Tensor<B, 5>) -> ModelResult<()> {
        let [frames, height, width, channels] = self.geometry.video_shape();
        let expected = [self.config.batch_size, frames, height, width, channels];
        let actual = videos.dims();
        if actual != expected {
            return Err(ModelError::shape("video batch", &expected, &actual));
        }
        Ok(())
    }
}

/// Uniform latent codes in `[-1, 1)`.
pub fn sample_latent<B: Backend>(batch: usize, z_dim: usize, device: &B::Device) -> Tensor<B, 2> {
    Tensor::random([batch, z_dim], Distribution::Uniform(-1.0, 1.0), device)
}

/// `[batch, time, height, width, channels]` -> `[batch, channels, time, height, width]`.
pub fn to_channels_first<B: Backend>(videos: Tensor<B, 5>) -> Tensor<B, 5> {
    videos.permute([0, 4, 1, 2, 3])
}

/// `[batch, channels, time, height, width]` -> `[batch, time, height, width, channels]`.
pub fn to_channels_last<B: Backend>(videos: Tensor<B, 5>) -> Tensor<B, 5> {
    videos.permute([0, 2, 3, 4, 1])
}

fn channels_last_output<B: Backend>(out: GeneratorOutput<B>) -> GeneratorOutput<B> {
    GeneratorOutput {
        video: to_channels_last(out.video),
        mask: to_channels_last(out.mask),
        foreground: to_channels_last(out.foreground),
        background: to_channels_last(out.background),
        mask_penalty: out.mask_penalty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn small_config() -> ModelConfig {
        ModelConfig::new()
            .with_video_shape([8, 16, 16, 3])
            .with_batch_size(2)
            .with_sample_size(3)
            .with_output_size(16)
            .with_z_dim(8)
            .with_generator_filters(4)
            .with_discriminator_filters(4)
    }

    fn model() -> VideoGan<TestBackend> {
        small_config().init(&Default::default()).unwrap()
    }

    #[test]
    fn default_config_is_valid() {
        let geometry = ModelConfig::new().geometry().unwrap();
        assert_eq!(geometry.video_shape(), [32, 64, 64, 3]);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = small_config().with_z_dim(0).geometry().unwrap_err();
        assert!(matches!(err, ModelError::InvalidConfig(_)));
    }

    #[test]
    fn negative_penalty_is_rejected() {
        let err = small_config().with_mask_penalty(-1.0).geometry().unwrap_err();
        assert!(matches!(err, ModelError::InvalidConfig(_)));
    }

    #[test]
    fn generate_rejects_wrong_latent_width() {
        let device = Default::default();
        let model = model();
        let z = sample_latent::<TestBackend>(2, 7, &device);
        let err = model.generate(z).unwrap_err();
        assert_eq!(
            err,
            ModelError::ShapeMismatch {
                what: "latent batch",
                expected: vec![2, 8],
                actual: vec![2, 7],
            }
        );
    }

    #[test]
    fn sample_uses_sample_size() {
        let device = Default::default();
        let model = model();
        let video = model
            .sample(sample_latent::<TestBackend>(3, 8, &device))
            .unwrap();
        assert_eq!(video.dims(), [3, 8, 16, 16, 3]);
        assert!(model
            .sample(sample_latent::<TestBackend>(2, 8, &device))
            .is_err());
    }

    #[test]
    fn discriminate_rejects_channel_first_input() {
        let device = Default::default();
        let model = model();
        let videos = Tensor::<TestBackend, 5>::zeros([2, 3, 8, 16, 16], &device);
        assert!(matches!(
            model.discriminate(videos),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn parameter_groups_are_disjoint() {
        let model = model();
        let generator = model.generator_parameters();
        let discriminator = model.discriminator_parameters();
        assert!(!generator.is_empty());
        assert!(!discriminator.is_empty());
        assert!(generator.is_disjoint(&discriminator));
        assert!(discriminator.is_disjoint(&generator));
    }

    #[test]
    fn losses_combine_as_documented() {
        let device = Default::default();
        let model = model();
        let real = Tensor::<TestBackend, 5>::random(
            [2, 8, 16, 16, 3],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let losses = model
            .losses(real, sample_latent::<TestBackend>(2, 8, &device))
            .unwrap();
        let summary = losses.summary().unwrap();

        let d_sum = summary.discriminator_real_loss + summary.discriminator_fake_loss;
        assert!((summary.discriminator_loss - d_sum).abs() < 1e-5);
        let g_sum = summary.adversarial_loss + 0.1 * summary.mask_penalty;
        assert!((summary.generator_loss - g_sum).abs() < 1e-4 * g_sum.abs().max(1.0));
        assert!(summary.mask_penalty > 0.0);
        assert_eq!(losses.fake_videos.dims(), [2, 8, 16, 16, 3]);
    }

    #[test]
    fn non_finite_losses_are_reported() {
        let device = Default::default();
        let nan = Tensor::<TestBackend, 1>::from_floats([f32::NAN], &device);
        let one = Tensor::<TestBackend, 1>::from_floats([1.0], &device);
        let losses = GanLosses {
            discriminator_loss: nan,
            discriminator_real_loss: one.clone(),
            discriminator_fake_loss: one.clone(),
            generator_loss: one.clone(),
            adversarial_loss: one.clone(),
            mask_penalty: one,
            real_probability: Tensor::zeros([1, 1], &device),
            fake_probability: Tensor::zeros([1, 1], &device),
            fake_videos: Tensor::zeros([1, 1, 1, 1, 1], &device),
        };
        assert!(matches!(
            losses.summary(),
            Err(ModelError::NonFinite {
                what: "discriminator_loss",
                ..
            })
        ));
    }
}
