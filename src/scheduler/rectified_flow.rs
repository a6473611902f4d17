//! Rectified-flow Euler scheduler.
//!
//! The denoiser predicts velocity `v = ε - x_0`. Integrating from `t_max` to 0:
//!
//! ```text
//! t     = linspace(t_max, 0, steps + 1)
//! x_next = x + (t_next - t) · v
//! ```

use candle_core::Tensor;

use super::{Scheduler, linspace_to_zero};
use crate::Result;

pub struct RectifiedFlowScheduler {
    sigma_max: f64,
    timesteps: Vec<f64>,
}

impl RectifiedFlowScheduler {
    /// `sigma_max` is clamped to `[0, 1]`.
    pub fn new(sigma_max: f64) -> Self {
        Self {
            sigma_max: sigma_max.clamp(0.0, 1.0),
            timesteps: Vec::new(),
        }
    }

    pub fn sigma_max(&self) -> f64 {
        self.sigma_max
    }
}

impl Scheduler for RectifiedFlowScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) {
        self.timesteps = linspace_to_zero(self.sigma_max, num_inference_steps);
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn add_noise(&self, init: &Tensor, noise: &Tensor, step_index: usize) -> Result<Tensor> {
        let t = self.timesteps[step_index];
        Ok(((init * (1.0 - t))? + (noise * t)?)?)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        step_index: usize,
    ) -> Result<Tensor> {
        let dt = self.timesteps[step_index + 1] - self.timesteps[step_index];
        let velocity = model_output.to_dtype(sample.dtype())?;
        Ok((sample + (velocity * dt)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn timesteps_run_from_sigma_max_to_zero() {
        let mut scheduler = RectifiedFlowScheduler::new(0.8);
        scheduler.set_timesteps(4);
        let t = scheduler.timesteps();
        assert_eq!(t.len(), 5);
        assert!((t[0] - 0.8).abs() < 1e-12);
        assert_eq!(t[4], 0.0);
        assert!(t.windows(2).all(|w| w[0] > w[1]), "timesteps decrease: {t:?}");
    }

    #[test]
    fn sigma_max_is_clamped() {
        assert_eq!(RectifiedFlowScheduler::new(3.0).sigma_max(), 1.0);
    }

    #[test]
    fn exact_velocity_recovers_data() {
        let device = Device::Cpu;
        let data = Tensor::randn(0f32, 1.0, (1, 2, 16), &device).unwrap();
        let noise = Tensor::randn(0f32, 1.0, (1, 2, 16), &device).unwrap();
        let velocity = (&noise - &data).unwrap();

        let mut scheduler = RectifiedFlowScheduler::new(1.0);
        scheduler.set_timesteps(5);
        let mut x = scheduler.add_noise(&data, &noise, 0).unwrap();
        for i in 0..5 {
            x = scheduler.step(&velocity, &x, i).unwrap();
        }
        let err: f32 = (x - &data)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(err < 1e-5, "straight-line flow should land on the data, err {err}");
    }

    #[test]
    fn add_noise_at_terminal_step_is_clean() {
        let device = Device::Cpu;
        let init = Tensor::ones((1, 1, 4), DType::F32, &device).unwrap();
        let noise = Tensor::zeros((1, 1, 4), DType::F32, &device).unwrap();
        let mut scheduler = RectifiedFlowScheduler::new(1.0);
        scheduler.set_timesteps(2);
        let mid: Vec<f32> = scheduler
            .add_noise(&init, &noise, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(mid, vec![0.5; 4]);
        let end: Vec<f32> = scheduler
            .add_noise(&init, &noise, 2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(end, vec![1.0; 4]);
    }
}
