#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::WgpuDevice;
use burn::backend::WebGpu;
use burn::config::Config;
use burn::prelude::*;
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use videogan_burn::model::sample_latent;
use videogan_burn::training::{load_model, save_samples, TrainingConfig};
use videogan_burn::utils::{save_video_grid_gif, video_to_frames};

#[derive(Parser, Debug)]
#[command(about = "Sample videos from a trained video GAN")]
struct Args {
    /// Checkpoint directory holding `config.json` and the model record.
    #[arg(long)]
    model_dir: PathBuf,
    #[arg(long)]
    save_dir: PathBuf,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Also write the background, foreground and mask streams.
    #[arg(long, default_value_t = false)]
    layers: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    type Gpu = WebGpu<f32, i32>;
    let device = WgpuDevice::default();

    let config_path = args.model_dir.join("config.json");
    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let model = config.model.init::<Gpu>(&device)?;
    let model = load_model(model, &args.model_dir, &device)?;

    Gpu::seed(&device, args.seed);
    let z = sample_latent::<Gpu>(config.model.sample_size, config.model.z_dim, &device);
    fs::create_dir_all(&args.save_dir)?;

    let samples_path = args.save_dir.join("samples.gif");
    save_samples(&model, z.clone(), &samples_path)?;
    tracing::info!("wrote {}", samples_path.display());

    if args.layers {
        let layers = model.decompose(z)?;
        write_layer(layers.background, &args.save_dir.join("background.gif"))?;
        write_layer(layers.foreground, &args.save_dir.join("foreground.gif"))?;
        // The mask lives in [0, 1]; stretch it to the [-1, 1] range frames are rendered from.
        let mask = layers.mask.mul_scalar(2.0).sub_scalar(1.0);
        write_layer(mask, &args.save_dir.join("mask.gif"))?;
    }

    Ok(())
}

fn write_layer<B: Backend>(videos: Tensor<B, 5>, path: &Path) -> Result<()> {
    let frames = video_to_frames(videos)?;
    save_video_grid_gif(&frames, path)?;
    tracing::info!("wrote {}", path.display());
    Ok(())
}
