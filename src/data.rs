use anyhow::{Context, Result};
use burn::prelude::*;
use burn::tensor::TensorData;
use image::{DynamicImage, GenericImageView};
use rand::Rng;
use std::path::{Path, PathBuf};

/// Frame extensions picked up inside a clip directory.
const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// A decoded clip: every frame, channel-last and normalized to [-1, 1].
#[derive(Debug, Clone)]
pub struct VideoClip {
    pub name: String,
    pub num_frames: usize,
    pub(crate) values: Vec<f32>,
}

/// Settings for decoding clips and assembling batches.
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Frames per training clip.
    pub frames: usize,
    /// Height and width frames are resized to.
    pub size: u32,
    /// 3 for RGB, 1 for luma.
    pub channels: usize,
}

/// A batch of channel-last clips `[batch, time, height, width, channels]`.
#[derive(Clone, Debug)]
pub struct VideoBatch<B: Backend> {
    pub videos: Tensor<B, 5>,
}

impl DataConfig {
    fn frame_len(&self) -> usize {
        self.size as usize * self.size as usize * self.channels
    }
}

impl VideoClip {
    /// `frames` consecutive frames starting at `start`.
    pub fn window(&self, start: usize, frames: usize, config: &DataConfig) -> &[f32] {
        let frame_len = config.frame_len();
        &self.values[start * frame_len..(start + frames) * frame_len]
    }
}

/// Load every sub-directory of `data_dir` as a clip, skipping ones that are too short.
pub fn load_clips(data_dir: &Path, config: &DataConfig) -> Result<Vec<VideoClip>> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(data_dir)
        .with_context(|| format!("failed to read {}", data_dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let mut clips = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let clip = load_clip(&dir, config)?;
        if clip.num_frames < config.frames {
            tracing::warn!(
                "skipping {}: {} frames, need {}",
                dir.display(),
                clip.num_frames,
                config.frames
            );
            continue;
        }
        clips.push(clip);
    }

    if clips.is_empty() {
        return Err(anyhow::anyhow!(
            "no clips with at least {} frames in {}",
            config.frames,
            data_dir.display()
        ));
    }
    Ok(clips)
}

/// Decode the frames of one clip directory in file-name order.
pub fn load_clip(dir: &Path, config: &DataConfig) -> Result<VideoClip> {
    let mut paths = Vec::new();
    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    for ext in FRAME_EXTENSIONS {
        let pattern = format!("{escaped}/*.{ext}");
        paths.extend(glob::glob(&pattern)?.filter_map(Result::ok));
    }
    paths.sort();

    let mut values = Vec::with_capacity(paths.len() * config.frame_len());
    for path in &paths {
        let img = image::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        append_frame(&img, config, &mut values);
    }

    let name = dir
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    Ok(VideoClip {
        name,
        num_frames: paths.len(),
        values,
    })
}

/// Build a batch from clips, taking a random window when `random_window` is set
/// and the first `frames` frames otherwise. Fails on clips shorter than `frames`.
pub fn build_batch<B: Backend>(
    clips: &[&VideoClip],
    config: &DataConfig,
    random_window: bool,
    rng: &mut impl Rng,
    device: &B::Device,
) -> Result<VideoBatch<B>> {
    let size = config.size as usize;
    let mut batch = Vec::with_capacity(clips.len() * config.frames * config.frame_len());

    for &clip in clips {
        let max_start = clip.num_frames.checked_sub(config.frames).ok_or_else(|| {
            anyhow::anyhow!(
                "clip {} has {} frames, need {}",
                clip.name,
                clip.num_frames,
                config.frames
            )
        })?;
        let start = if random_window && max_start > 0 {
            rng.gen_range(0..=max_start)
        } else {
            0
        };
        batch.extend_from_slice(clip.window(start, config.frames, config));
    }

    let videos = Tensor::<B, 5>::from_data(
        TensorData::new(
            batch,
            [clips.len(), config.frames, size, size, config.channels],
        ),
        device,
    );
    Ok(VideoBatch { videos })
}

/// Resize and normalize one frame, appending HWC values in [-1, 1].
fn append_frame(img: &DynamicImage, config: &DataConfig, out: &mut Vec<f32>) {
    let img = if img.dimensions() != (config.size, config.size) {
        img.resize_exact(
            config.size,
            config.size,
            image::imageops::FilterType::CatmullRom,
        )
    } else {
        img.clone()
    };

    if config.channels == 1 {
        out.extend(img.to_luma8().into_raw().into_iter().map(normalize));
    } else {
        out.extend(img.to_rgb8().into_raw().into_iter().map(normalize));
    }
}

fn normalize(value: u8) -> f32 {
    (value as f32 / 127.5) - 1.0
}
