use crate::error::{ModelError, ModelResult};

/// Number of spatial doublings between the projected volume and the output frame.
pub const SPATIAL_STAGES: usize = 4;

/// Spatial factor the output resolution must be a multiple of.
pub const SPATIAL_FACTOR: usize = 1 << SPATIAL_STAGES;

/// Resolution schedule shared by the generator and the discriminator.
///
/// Derived once from a validated [`ModelConfig`](super::ModelConfig) so that no
/// layer ever has to divide a resolution and round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoGeometry {
    /// Frames per clip.
    pub frames: usize,
    /// Output height and width.
    pub size: usize,
    pub channels: usize,
    /// Height and width of the projected volumes (`size / 16`).
    pub base_size: usize,
    /// Frames of the projected dynamic volume.
    pub base_frames: usize,
    /// Temporal stride (1 or 2) of each dynamic-stream stage; the last entry is the heads.
    pub generator_time_strides: [usize; SPATIAL_STAGES],
    /// Temporal stride (1 or 2) of each discriminator stage.
    pub discriminator_time_strides: [usize; SPATIAL_STAGES],
    /// `[frames, height, width]` of the last discriminator feature volume.
    pub discriminator_out: [usize; 3],
}

impl VideoGeometry {
    /// Validate the shape fields and build the schedule.
    pub fn new(
        video_shape: [usize; 4],
        output_size: usize,
        color_channels: usize,
    ) -> ModelResult<Self> {
        let [frames, height, width, channels] = video_shape;
        if video_shape.iter().any(|&dim| dim == 0) {
            return Err(ModelError::InvalidConfig(format!(
                "video_shape {video_shape:?} has an empty dimension"
            )));
        }
        if output_size == 0 || output_size % SPATIAL_FACTOR != 0 {
            return Err(ModelError::ResolutionNotDivisible {
                size: output_size,
                factor: SPATIAL_FACTOR,
            });
        }
        if height != output_size || width != output_size {
            return Err(ModelError::InvalidConfig(format!(
                "video_shape frames are {height}x{width} but output_size is {output_size}"
            )));
        }
        if channels != color_channels {
            return Err(ModelError::InvalidConfig(format!(
                "video_shape has {channels} channels but color_channels is {color_channels}"
            )));
        }

        // The trailing stages double time; leading ones keep it when the clip is short.
        let doublings = (frames.trailing_zeros() as usize).min(SPATIAL_STAGES);
        let base_frames = frames >> doublings;
        let mut generator_time_strides = [2; SPATIAL_STAGES];
        for stride in generator_time_strides
            .iter_mut()
            .take(SPATIAL_STAGES - doublings)
        {
            *stride = 1;
        }

        let mut discriminator_time_strides = [1; SPATIAL_STAGES];
        let mut time = frames;
        let mut space = output_size;
        for stride in discriminator_time_strides.iter_mut() {
            if time >= 2 {
                *stride = 2;
                time = conv_out(time, 4, 2, 1);
            }
            space = conv_out(space, 4, 2, 1);
        }

        Ok(Self {
            frames,
            size: output_size,
            channels,
            base_size: output_size / SPATIAL_FACTOR,
            base_frames,
            generator_time_strides,
            discriminator_time_strides,
            discriminator_out: [time, space, space],
        })
    }

    /// `[frames, height, width, channels]` of one clip.
    pub fn video_shape(&self) -> [usize; 4] {
        [self.frames, self.size, self.size, self.channels]
    }
}

fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}
