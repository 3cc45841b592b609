use crate::data::{build_batch, load_clips, DataConfig, VideoBatch, VideoClip};
use crate::model::{sample_latent, Discriminator, Generator, LossSummary, ModelConfig, VideoGan};
use crate::utils::{save_video_grid_gif, video_to_frames};
use anyhow::{Context, Result};
use burn::config::Config;
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::DataLoaderBuilder;
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Training configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    /// Directory of clip sub-directories, relative to the experiment directory if not absolute.
    pub data_dir: String,
    #[config(default = 0)]
    pub experiment_id: usize,
    #[config(default = 25)]
    pub num_epochs: usize,
    /// Shared by the generator and discriminator optimizers.
    #[config(default = 2e-4)]
    pub learning_rate: f64,
    #[config(default = 0.5)]
    pub beta1: f64,
    /// Generator updates per discriminator update.
    #[config(default = 2)]
    pub generator_steps: usize,
    #[config(default = 2)]
    pub num_workers: usize,
    #[config(default = 100)]
    pub sample_steps: usize,
    #[config(default = 500)]
    pub checkpoint_steps: usize,
    #[config(default = 10)]
    pub log_steps: usize,
    #[config(default = false)]
    pub resume: bool,
    #[config(default = 42)]
    pub seed: u64,
}

/// Persisted training state for resume support.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
struct TrainingState {
    step: usize,
    epoch: usize,
    /// Batches already consumed in `epoch`.
    #[serde(default)]
    batch: usize,
}

/// Clip dataset padded to a whole number of batches by wrapping around.
#[derive(Clone)]
struct VideoDataset {
    clips: Vec<Arc<VideoClip>>,
    len: usize,
}

impl VideoDataset {
    fn new(clips: Vec<Arc<VideoClip>>, batch_size: usize) -> Self {
        let len = if clips.is_empty() {
            0
        } else {
            clips.len().div_ceil(batch_size) * batch_size
        };
        Self { clips, len }
    }
}

impl Dataset<Arc<VideoClip>> for VideoDataset {
    fn get(&self, index: usize) -> Option<Arc<VideoClip>> {
        if index >= self.len {
            return None;
        }
        self.clips.get(index % self.clips.len()).cloned()
    }

    fn len(&self) -> usize {
        self.len
    }
}

#[derive(Clone)]
struct VideoBatcher {
    config: DataConfig,
    rng: Arc<Mutex<StdRng>>,
}

impl VideoBatcher {
    fn new(config: DataConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl<B: Backend> Batcher<B, Arc<VideoClip>, VideoBatch<B>> for VideoBatcher {
    fn batch(&self, items: Vec<Arc<VideoClip>>, device: &B::Device) -> VideoBatch<B> {
        let refs: Vec<&VideoClip> = items.iter().map(|item| item.as_ref()).collect();
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Clips shorter than a window are dropped by `load_clips`.
        build_batch::<B>(&refs, &self.config, true, &mut *rng, device)
            .expect("failed to build batch")
    }
}

/// Loss summaries of one training step.
#[derive(Clone, Debug, Default)]
pub struct StepMetrics {
    pub discriminator: LossSummary,
    pub generator: LossSummary,
}

/// One Adam optimizer per parameter group; each sees only its own gradients.
pub struct GanTrainer<B: AutodiffBackend> {
    optim_gen: OptimizerAdaptor<Adam, Generator<B>, B>,
    optim_disc: OptimizerAdaptor<Adam, Discriminator<B>, B>,
    learning_rate: f64,
    generator_steps: usize,
}

impl<B: AutodiffBackend> GanTrainer<B> {
    pub fn new(config: &TrainingConfig) -> Self {
        let adam = AdamConfig::new().with_beta_1(config.beta1 as f32);
        Self {
            optim_gen: adam.init::<B, Generator<B>>(),
            optim_disc: adam.init::<B, Discriminator<B>>(),
            learning_rate: config.learning_rate,
            generator_steps: config.generator_steps.max(1),
        }
    }

    /// Update the discriminator on `real` clips and clips generated from `z`.
    pub fn discriminator_step(
        &mut self,
        model: VideoGan<B>,
        real: Tensor<B, 5>,
        z: Tensor<B, 2>,
    ) -> Result<(VideoGan<B>, LossSummary)> {
        let losses = model.losses(real, z)?;
        let summary = losses.summary()?;
        let grads = losses.discriminator_loss.backward();
        let grads = GradientsParams::from_grads(grads, model.discriminator());

        let lr = self.learning_rate;
        let optim = &mut self.optim_disc;
        let model = model.map_discriminator(|discriminator| optim.step(lr, discriminator, grads));
        Ok((model, summary))
    }

    /// Update the generator against the current discriminator.
    pub fn generator_step(
        &mut self,
        model: VideoGan<B>,
        real: Tensor<B, 5>,
        z: Tensor<B, 2>,
    ) -> Result<(VideoGan<B>, LossSummary)> {
        let losses = model.losses(real, z)?;
        let summary = losses.summary()?;
        let grads = losses.generator_loss.backward();
        let grads = GradientsParams::from_grads(grads, model.generator());

        let lr = self.learning_rate;
        let optim = &mut self.optim_gen;
        let model = model.map_generator(|generator| optim.step(lr, generator, grads));
        Ok((model, summary))
    }

    /// Write both optimizer records next to the model record.
    pub fn save_records(&self, model_dir: &Path) -> Result<()> {
        let recorder = CompactRecorder::new();
        Recorder::<B>::record(&recorder, self.optim_gen.to_record(), model_dir.join("optim_gen"))
            .context("failed to save generator optimizer")?;
        Recorder::<B>::record(&recorder, self.optim_disc.to_record(), model_dir.join("optim_disc"))
            .context("failed to save discriminator optimizer")?;
        Ok(())
    }

    /// Restore optimizer state written by [`save_records`](Self::save_records).
    pub fn load_records(mut self, model_dir: &Path, device: &B::Device) -> Result<Self> {
        let recorder = CompactRecorder::new();
        let gen = Recorder::<B>::load(&recorder, model_dir.join("optim_gen"), device)
            .context("failed to load generator optimizer")?;
        let disc = Recorder::<B>::load(&recorder, model_dir.join("optim_disc"), device)
            .context("failed to load discriminator optimizer")?;
        self.optim_gen = self.optim_gen.load_record(gen);
        self.optim_disc = self.optim_disc.load_record(disc);
        Ok(self)
    }

    /// One discriminator update followed by the configured generator updates.
    pub fn step(
        &mut self,
        model: VideoGan<B>,
        real: Tensor<B, 5>,
        z: Tensor<B, 2>,
    ) -> Result<(VideoGan<B>, StepMetrics)> {
        let (mut model, discriminator) = self.discriminator_step(model, real.clone(), z.clone())?;
        let mut generator = LossSummary::default();
        for _ in 0..self.generator_steps {
            let (next, summary) = self.generator_step(model, real.clone(), z.clone())?;
            model = next;
            generator = summary;
        }
        Ok((
            model,
            StepMetrics {
                discriminator,
                generator,
            },
        ))
    }
}

fn write_training_state(state_path: &Path, state: &TrainingState) -> Result<()> {
    let state_json =
        serde_json::to_string_pretty(state).context("failed to serialize training state")?;
    std::fs::write(state_path, state_json)
        .with_context(|| format!("failed to write {}", state_path.display()))
}

fn save_checkpoint<B: AutodiffBackend>(
    model: &VideoGan<B>,
    trainer: &GanTrainer<B>,
    model_dir: &Path,
    state: &TrainingState,
) -> Result<()> {
    model
        .clone()
        .save_file(model_dir.join("model"), &CompactRecorder::new())
        .context("failed to save model checkpoint")?;
    trainer.save_records(model_dir)?;
    write_training_state(&model_dir.join("state.json"), state)?;
    tracing::info!(step = state.step, "saved checkpoint to {}", model_dir.display());
    Ok(())
}

/// Load a `model` record written by the training loop.
pub fn load_model<B: Backend>(
    model: VideoGan<B>,
    model_dir: &Path,
    device: &B::Device,
) -> Result<VideoGan<B>> {
    let record = CompactRecorder::new()
        .load(model_dir.join("model"), device)
        .with_context(|| format!("failed to load model from {}", model_dir.display()))?;
    Ok(model.load_record(record))
}

/// Sample videos in inference mode and write them as an animated grid.
pub fn save_samples<B: Backend>(model: &VideoGan<B>, z: Tensor<B, 2>, path: &Path) -> Result<()> {
    let videos = model.sample(z)?;
    let frames = video_to_frames(videos)?;
    save_video_grid_gif(&frames, path)
}

/// Train the video GAN, handling checkpoints and sampling.
pub fn train<B: AutodiffBackend>(
    experiment_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
) -> Result<()> {
    let geometry = config.model.geometry()?;
    let model_id = format!(
        "experiment_{}_batch_{}",
        config.experiment_id, config.model.batch_size
    );
    let model_dir = experiment_dir.join("checkpoint").join(model_id);
    let sample_dir = model_dir.join("samples");
    std::fs::create_dir_all(&sample_dir)?;
    config.save(model_dir.join("config.json"))?;

    let state_path = model_dir.join("state.json");
    let mut state = TrainingState::default();
    if config.resume && state_path.exists() {
        let contents = std::fs::read_to_string(&state_path)?;
        state = serde_json::from_str(&contents)?;
    }

    B::seed(&device, config.seed);
    let mut model = config.model.init::<B>(&device)?;
    let mut trainer = GanTrainer::<B>::new(&config);
    if config.resume && state.step > 0 {
        model = load_model(model, &model_dir, &device)?;
        trainer = trainer.load_records(&model_dir, &device)?;
        tracing::info!(
            step = state.step,
            epoch = state.epoch,
            batch = state.batch,
            "resumed from checkpoint"
        );
    }

    let data_config = DataConfig {
        frames: geometry.frames,
        size: geometry.size as u32,
        channels: geometry.channels,
    };
    let data_dir = resolve_data_dir(experiment_dir, &config.data_dir);
    let clips = load_clips(&data_dir, &data_config)
        .with_context(|| format!("failed to load clips from {}", data_dir.display()))?;
    tracing::info!("training clips -> {}", clips.len());

    let clips = clips.into_iter().map(Arc::new).collect::<Vec<_>>();
    let dataset = VideoDataset::new(clips, config.model.batch_size);
    let batcher = VideoBatcher::new(data_config, config.seed);
    let loader = DataLoaderBuilder::<B, Arc<VideoClip>, VideoBatch<B>>::new(batcher)
        .batch_size(config.model.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers.max(1))
        .set_device(device.clone())
        .build(dataset);

    let sample_z = sample_latent::<B::InnerBackend>(
        config.model.sample_size,
        config.model.z_dim,
        &device,
    );

    // The shuffle order of a resumed epoch is not replayed; only its length is.
    for epoch in state.epoch..config.num_epochs {
        for batch in loader.iter().skip(state.batch) {
            state.step += 1;
            state.batch += 1;
            let z = sample_latent::<B>(config.model.batch_size, config.model.z_dim, &device);
            let (next, metrics) = trainer
                .step(model, batch.videos, z)
                .with_context(|| format!("training halted at step {}", state.step))?;
            model = next;

            if config.log_steps > 0 && state.step % config.log_steps == 0 {
                tracing::info!(
                    epoch = epoch + 1,
                    step = state.step,
                    d_loss = metrics.discriminator.discriminator_loss,
                    d_loss_real = metrics.discriminator.discriminator_real_loss,
                    d_loss_fake = metrics.discriminator.discriminator_fake_loss,
                    g_loss = metrics.generator.generator_loss,
                    g_adversarial = metrics.generator.adversarial_loss,
                    mask_penalty = metrics.generator.mask_penalty,
                    "train step"
                );
            }

            if config.sample_steps > 0 && state.step % config.sample_steps == 0 {
                let path = sample_dir.join(format!("sample_{:02}_{:06}.gif", epoch, state.step));
                save_samples(&model.valid(), sample_z.clone(), &path)?;
                tracing::debug!("wrote samples to {}", path.display());
            }

            if config.checkpoint_steps > 0 && state.step % config.checkpoint_steps == 0 {
                save_checkpoint(&model, &trainer, &model_dir, &state)?;
            }
        }
        state.epoch = epoch + 1;
        state.batch = 0;
    }

    save_checkpoint(&model, &trainer, &model_dir, &state)?;
    Ok(())
}

/// Resolve `data_dir` relative to the experiment directory if needed.
fn resolve_data_dir(experiment_dir: &Path, data_dir: &str) -> PathBuf {
    let candidate = PathBuf::from(data_dir);
    if candidate.is_relative() {
        experiment_dir.join(candidate)
    } else {
        candidate
    }
}
