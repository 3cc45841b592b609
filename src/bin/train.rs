#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::graphics::AutoGraphicsApi;
use burn::backend::wgpu::{init_setup, RuntimeOptions, WgpuDevice};
use burn::backend::{Autodiff, WebGpu};
use burn::config::Config;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use videogan_burn::model::{ModelConfig, VideoGeometry};
use videogan_burn::training::TrainingConfig;

#[derive(Parser, Debug)]
#[command(about = "Train the two-stream video GAN with Burn")]
struct Args {
    #[arg(long)]
    experiment_dir: PathBuf,
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    type Backend = WebGpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;
    let device = WgpuDevice::default();
    let setup = init_setup::<AutoGraphicsApi>(&device, RuntimeOptions::default());
    let max_storage_buffer_binding_size =
        setup.device.limits().max_storage_buffer_binding_size as u64;
    adjust_batch_size_for_wgpu(&mut config.model, max_storage_buffer_binding_size)?;

    videogan_burn::training::train::<AutodiffBackend>(&args.experiment_dir, config, device)
}

fn adjust_batch_size_for_wgpu(
    model: &mut ModelConfig,
    max_storage_buffer_binding_size: u64,
) -> Result<()> {
    let geometry = model.geometry()?;
    let elem_bytes = std::mem::size_of::<f32>() as u64;
    let per_sample_bytes = estimate_max_conv_workspace_elems(model, &geometry) * elem_bytes;
    if per_sample_bytes == 0 {
        return Ok(());
    }

    let safe_limit = max_storage_buffer_binding_size.saturating_sub(1);
    let max_batch = (safe_limit / per_sample_bytes) as usize;
    if max_batch == 0 {
        return Err(anyhow::anyhow!(
            "wgpu max storage buffer size ({max_storage_buffer_binding_size} bytes) cannot hold one clip (estimated {per_sample_bytes} bytes); reduce video_shape or filters"
        ));
    }

    if model.batch_size > max_batch {
        tracing::warn!(
            max_storage_buffer_binding_size,
            per_sample_bytes,
            "lowering batch_size from {} to {}",
            model.batch_size,
            max_batch
        );
        model.batch_size = max_batch;
    }
    Ok(())
}

/// Largest unfolded convolution buffer, in elements, needed for one clip.
fn estimate_max_conv_workspace_elems(model: &ModelConfig, geometry: &VideoGeometry) -> u64 {
    let spatial_kernel = 16u64;
    let time_kernel = |stride: usize| if stride == 2 { 4u64 } else { 3u64 };
    let mut max_elems = 0u64;

    // Dynamic-stream transposed convolutions, including the mask and foreground heads.
    let gf = model.generator_filters as u64;
    let gen_out_channels = [gf * 4, gf * 2, gf, model.color_channels as u64 + 1];
    let mut time = geometry.base_frames as u64;
    let mut size = geometry.base_size as u64;
    for (&out_channels, &stride) in gen_out_channels
        .iter()
        .zip(geometry.generator_time_strides.iter())
    {
        let elems = out_channels * time * size * size * spatial_kernel * time_kernel(stride);
        max_elems = max_elems.max(elems);
        time *= stride as u64;
        size *= 2;
    }

    // Discriminator convolutions.
    let df = model.discriminator_filters as u64;
    let mut in_channels = model.color_channels as u64;
    let mut time = geometry.frames as u64;
    let mut size = geometry.size as u64;
    for (&out_channels, &stride) in [df, df * 2, df * 4, df * 8]
        .iter()
        .zip(geometry.discriminator_time_strides.iter())
    {
        if stride == 2 {
            time = (time / 2).max(1);
        }
        size /= 2;
        let elems = in_channels * time * size * size * spatial_kernel * time_kernel(stride);
        max_elems = max_elems.max(elems);
        in_channels = out_channels;
    }

    max_elems
}
