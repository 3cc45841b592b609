use anyhow::{Context, Result};
use burn::prelude::*;
use gif::{Encoder, Frame, Repeat};
use image::{GenericImage, Rgb, RgbImage};
use std::fs::File;
use std::path::Path;

/// Map [-1, 1] normalized values back to [0, 1].
pub fn scale_back(value: f32) -> f32 {
    (value + 1.0) * 0.5
}

/// Convert channel-last videos `[batch, time, height, width, channels]` in [-1, 1]
/// to one RGB image per frame. Single-channel videos are rendered as gray.
pub fn video_to_frames<B: Backend>(videos: Tensor<B, 5>) -> Result<Vec<Vec<RgbImage>>> {
    let data = videos.to_data().convert::<f32>();
    let shape = data.shape.clone();
    if shape.len() != 5 {
        return Err(anyhow::anyhow!(
            "expected rank-5 tensor for videos, got shape {shape:?}"
        ));
    }
    let (batch, frames, height, width, channels) =
        (shape[0], shape[1], shape[2], shape[3], shape[4]);
    if channels != 1 && channels != 3 {
        return Err(anyhow::anyhow!(
            "expected 1 or 3 channels for videos, got {channels}"
        ));
    }

    let values = data
        .to_vec::<f32>()
        .context("failed to read tensor data as f32")?;
    let to_u8 = |v: f32| (scale_back(v).clamp(0.0, 1.0) * 255.0) as u8;
    let frame_len = height * width * channels;
    let mut videos_out = Vec::with_capacity(batch);

    for b in 0..batch {
        let mut clip = Vec::with_capacity(frames);
        for t in 0..frames {
            let base = (b * frames + t) * frame_len;
            let mut img = RgbImage::new(width as u32, height as u32);
            for y in 0..height {
                for x in 0..width {
                    let idx = base + (y * width + x) * channels;
                    let pixel = if channels == 3 {
                        [to_u8(values[idx]), to_u8(values[idx + 1]), to_u8(values[idx + 2])]
                    } else {
                        let v = to_u8(values[idx]);
                        [v, v, v]
                    };
                    img.put_pixel(x as u32, y as u32, Rgb(pixel));
                }
            }
            clip.push(img);
        }
        videos_out.push(clip);
    }

    Ok(videos_out)
}

/// Smallest near-square grid holding `count` tiles.
pub fn grid_shape(count: usize) -> (usize, usize) {
    let cols = (count as f64).sqrt().ceil().max(1.0) as usize;
    let rows = count.div_ceil(cols).max(1);
    (rows, cols)
}

/// Merge images into a fixed grid (rows x cols).
pub fn merge_images(images: &[RgbImage], rows: usize, cols: usize) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(anyhow::anyhow!("no images to merge"));
    }
    let width = images[0].width();
    let height = images[0].height();
    let mut out = RgbImage::new(width * cols as u32, height * rows as u32);

    for (idx, img) in images.iter().enumerate() {
        let row = idx / cols;
        let col = idx % cols;
        if row >= rows {
            break;
        }
        out.copy_from(img, (col as u32) * width, (row as u32) * height)
            .context("failed to copy image into grid")?;
    }

    Ok(out)
}

/// Tile each time step of every clip into a grid and write the result as a looping GIF.
pub fn save_video_grid_gif(videos: &[Vec<RgbImage>], path: &Path) -> Result<()> {
    let frames = videos
        .first()
        .map(|clip| clip.len())
        .ok_or_else(|| anyhow::anyhow!("no videos to save for {}", path.display()))?;
    if frames == 0 || videos.iter().any(|clip| clip.len() != frames) {
        return Err(anyhow::anyhow!(
            "videos for {} must share a non-zero frame count",
            path.display()
        ));
    }

    let (rows, cols) = grid_shape(videos.len());
    let grids = (0..frames)
        .map(|t| {
            let tiles: Vec<RgbImage> = videos.iter().map(|clip| clip[t].clone()).collect();
            merge_images(&tiles, rows, cols)
        })
        .collect::<Result<Vec<_>>>()?;
    write_gif(&grids, path)
}

/// Encode RGB frames into an infinitely repeating GIF.
pub fn write_gif(frames: &[RgbImage], path: &Path) -> Result<()> {
    let first = frames
        .first()
        .ok_or_else(|| anyhow::anyhow!("no frames provided for {}", path.display()))?;
    let (width, height) = first.dimensions();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut encoder = Encoder::new(&mut file, width as u16, height as u16, &[])?;
    encoder.set_repeat(Repeat::Infinite)?;

    for img in frames {
        let mut frame = Frame::from_rgb(width as u16, height as u16, img.as_raw());
        frame.delay = 10;
        encoder.write_frame(&frame)?;
    }

    Ok(())
}
