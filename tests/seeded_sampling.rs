//! Kept in its own test binary: the backend seed is process-wide, so other
//! tests drawing random tensors in parallel would disturb it.

use burn::backend::NdArray;
use burn::prelude::*;
use videogan_burn::{ModelConfig, VideoGan};

type TestBackend = NdArray;

fn seeded_model(seed: u64) -> VideoGan<TestBackend> {
    let device = Default::default();
    TestBackend::seed(&device, seed);
    let model: VideoGan<TestBackend> = ModelConfig::new()
        .with_video_shape([8, 16, 16, 3])
        .with_batch_size(4)
        .with_sample_size(2)
        .with_output_size(16)
        .with_z_dim(8)
        .with_generator_filters(4)
        .with_discriminator_filters(4)
        .init(&device)
        .unwrap();
    // Parameters initialize lazily; draw them now, under this seed.
    model
        .sample(Tensor::zeros([2, 8], &device))
        .unwrap();
    model
}

fn values(tensor: Tensor<TestBackend, 5>) -> Vec<f32> {
    tensor.into_data().to_vec::<f32>().unwrap()
}

#[test]
fn same_seed_and_latent_sample_identically() {
    let device = Default::default();
    let train_z = Tensor::<TestBackend, 2>::from_floats(
        [
            [0.5, -0.5, 0.25, -0.25, 0.1, -0.1, 0.9, -0.9],
            [-0.3, 0.3, 0.7, -0.7, 0.0, 0.2, -0.2, 0.4],
            [0.8, 0.1, -0.6, 0.3, -0.4, 0.6, 0.05, -0.8],
            [-0.9, 0.6, 0.2, -0.1, 0.35, -0.55, 0.45, 0.15],
        ],
        &device,
    );
    let z = Tensor::<TestBackend, 2>::from_floats(
        [
            [0.1, 0.2, 0.3, 0.4, -0.1, -0.2, -0.3, -0.4],
            [0.9, -0.8, 0.7, -0.6, 0.5, -0.4, 0.3, -0.2],
        ],
        &device,
    );

    let first = seeded_model(17);
    let second = seeded_model(17);

    let before = values(first.sample(z.clone()).unwrap());
    assert_eq!(before, values(second.sample(z.clone()).unwrap()));

    // One training-mode pass on each moves the running statistics identically.
    first.generate(train_z.clone()).unwrap();
    second.generate(train_z).unwrap();

    let after = values(first.sample(z.clone()).unwrap());
    assert_eq!(after, values(second.sample(z).unwrap()));
    assert_ne!(before, after);
}
