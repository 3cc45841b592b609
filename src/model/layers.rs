use burn::module::{Param, RunningState};
use burn::prelude::*;

/// Whether a forward pass learns batch statistics or replays the running ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardMode {
    Train,
    Inference,
}

/// Batch normalization over the channel axis of a channel-first tensor of any rank.
///
/// Running statistics live in the layer itself and only change during
/// [`ForwardMode::Train`] passes.
#[derive(Module, Debug)]
pub struct BatchNorm<B: Backend> {
    gamma: Param<Tensor<B, 1>>,
    beta: Param<Tensor<B, 1>>,
    running_mean: RunningState<Tensor<B, 1>>,
    running_var: RunningState<Tensor<B, 1>>,
    #[module(ignore)]
    momentum: f64,
    #[module(ignore)]
    epsilon: f64,
}

impl<B: Backend> BatchNorm<B> {
    /// Unit scale, zero shift, zero mean and unit variance.
    pub fn new(num_channels: usize, device: &B::Device) -> Self {
        Self {
            gamma: Param::from_tensor(Tensor::ones([num_channels], device)),
            beta: Param::from_tensor(Tensor::zeros([num_channels], device)),
            running_mean: RunningState::new(Tensor::zeros([num_channels], device)),
            running_var: RunningState::new(Tensor::ones([num_channels], device)),
            momentum: 0.1,
            epsilon: 1e-5,
        }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>, mode: ForwardMode) -> Tensor<B, D> {
        let channels = x.dims()[1];
        let mut shape = [1; D];
        shape[1] = channels;

        let (mean, var) = match mode {
            ForwardMode::Train => self.batch_statistics(x.clone()),
            ForwardMode::Inference => {
                let device = x.device();
                let mean = self.running_mean.value_sync().to_device(&device).reshape(shape);
                let var = self.running_var.value_sync().to_device(&device).reshape(shape);
                (mean, var)
            }
        };

        let gamma = self.gamma.val().reshape(shape);
        let beta = self.beta.val().reshape(shape);
        x.sub(mean)
            .div((var + self.epsilon).sqrt())
            .mul(gamma)
            .add(beta)
    }

    /// Per-channel batch mean/variance, folded into the running averages.
    fn batch_statistics<const D: usize>(&self, x: Tensor<B, D>) -> (Tensor<B, D>, Tensor<B, D>) {
        let device = x.device();
        let channels = x.dims()[1];
        let reduce: Vec<usize> = (0..D).filter(|&dim| dim != 1).collect();

        let mean = x.clone().mean_dims(reduce.as_slice());
        let var = x.sub(mean.clone()).square().mean_dims(reduce.as_slice());

        let running_mean = self
            .running_mean
            .value_sync()
            .to_device(&device)
            .mul_scalar(1.0 - self.momentum)
            .add(mean.clone().detach().reshape([channels]).mul_scalar(self.momentum));
        let running_var = self
            .running_var
            .value_sync()
            .to_device(&device)
            .mul_scalar(1.0 - self.momentum)
            .add(var.clone().detach().reshape([channels]).mul_scalar(self.momentum));
        self.running_mean.update(running_mean.detach());
        self.running_var.update(running_var.detach());

        (mean, var)
    }

    /// Current running mean, mostly for inspection in tests.
    pub fn running_mean(&self) -> Tensor<B, 1> {
        self.running_mean.value_sync()
    }

    /// Scale and shift, in that order.
    pub(crate) fn affine(&self) -> [Tensor<B, 1>; 2] {
        [self.gamma.val(), self.beta.val()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    fn input(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 5> {
        // Channel 0 holds 1..=4, channel 1 holds 10..=40.
        let values = vec![1.0f32, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
        Tensor::from_data(TensorData::new(values, [1, 2, 2, 2, 1]), device)
    }

    #[test]
    fn train_mode_normalizes_each_channel() {
        let device = Default::default();
        let norm = BatchNorm::<TestBackend>::new(2, &device);
        let out = norm.forward(input(&device), ForwardMode::Train);

        let means = out
            .clone()
            .mean_dims(&[0, 2, 3, 4])
            .to_data()
            .to_vec::<f32>()
            .unwrap();
        for mean in means {
            assert!(mean.abs() < 1e-5, "channel mean {mean}");
        }
        let vars = out
            .square()
            .mean_dims(&[0, 2, 3, 4])
            .to_data()
            .to_vec::<f32>()
            .unwrap();
        for var in vars {
            assert!((var - 1.0).abs() < 1e-3, "channel variance {var}");
        }
    }

    #[test]
    fn train_mode_moves_running_mean_by_momentum() {
        let device = Default::default();
        let norm = BatchNorm::<TestBackend>::new(2, &device);
        norm.forward(input(&device), ForwardMode::Train);

        let running = norm.running_mean().to_data().to_vec::<f32>().unwrap();
        assert!((running[0] - 0.25).abs() < 1e-5);
        assert!((running[1] - 2.5).abs() < 1e-5);
    }

    #[test]
    fn inference_mode_uses_running_statistics_without_updating_them() {
        let device = Default::default();
        let norm = BatchNorm::<TestBackend>::new(2, &device);
        let x = input(&device);
        let out = norm.forward(x.clone(), ForwardMode::Inference);

        let scale = (1.0f32 + 1e-5).sqrt();
        let expected = x.to_data().to_vec::<f32>().unwrap();
        let actual = out.to_data().to_vec::<f32>().unwrap();
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e / scale).abs() < 1e-4, "{a} vs {}", e / scale);
        }
        let running = norm.running_mean().to_data().to_vec::<f32>().unwrap();
        assert_eq!(running, vec![0.0, 0.0]);
    }

    #[test]
    fn inference_after_training_uses_updated_statistics() {
        let device = Default::default();
        let norm = BatchNorm::<TestBackend>::new(2, &device);
        let x = input(&device);
        norm.forward(x.clone(), ForwardMode::Train);
        let out = norm.forward(x.clone(), ForwardMode::Inference);

        // Biased batch variances are 1.25 and 125, folded in with momentum 0.1.
        let stats = [(0.25f32, 0.9f32 + 0.125), (2.5, 0.9 + 12.5)];
        let inputs = x.to_data().to_vec::<f32>().unwrap();
        let actual = out.to_data().to_vec::<f32>().unwrap();
        for (idx, (a, raw)) in actual.iter().zip(inputs.iter()).enumerate() {
            let (mean, var) = stats[idx / 4];
            let expected = (raw - mean) / (var + 1e-5).sqrt();
            assert!((a - expected).abs() < 1e-4, "{a} vs {expected}");
        }
    }
}
