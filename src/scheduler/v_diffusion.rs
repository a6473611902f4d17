//! Deterministic DDIM for v-prediction on the cosine schedule.
//!
//! ```text
//! α = cos(πt/2), σ = sin(πt/2)
//! x_0 = α·x - σ·v
//! ε   = σ·x + α·v
//! x_next = α_next·x_0 + σ_next·ε
//! ```
//!
//! A variation noise level `σ_k` (ratio of noise to signal) starts the schedule
//! at `t_max = atan(σ_k) · 2/π`.

use std::f64::consts::FRAC_PI_2;

use candle_core::Tensor;

use super::{Scheduler, linspace_to_zero};
use crate::Result;

pub struct VDiffusionScheduler {
    t_max: f64,
    timesteps: Vec<f64>,
}

impl VDiffusionScheduler {
    pub fn new(t_max: f64) -> Self {
        Self {
            t_max: t_max.clamp(0.0, 1.0),
            timesteps: Vec::new(),
        }
    }

    pub fn from_noise_level(sigma: f64) -> Self {
        Self::new(sigma.atan() / FRAC_PI_2)
    }

    pub fn t_max(&self) -> f64 {
        self.t_max
    }

    /// `(α, σ)` at timestep `t`.
    pub fn alpha_sigma(t: f64) -> (f64, f64) {
        ((t * FRAC_PI_2).cos(), (t * FRAC_PI_2).sin())
    }
}

impl Scheduler for VDiffusionScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) {
        self.timesteps = linspace_to_zero(self.t_max, num_inference_steps);
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn add_noise(&self, init: &Tensor, noise: &Tensor, step_index: usize) -> Result<Tensor> {
        let (alpha, sigma) = Self::alpha_sigma(self.timesteps[step_index]);
        Ok(((init * alpha)? + (noise * sigma)?)?)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        step_index: usize,
    ) -> Result<Tensor> {
        let (alpha, sigma) = Self::alpha_sigma(self.timesteps[step_index]);
        let (alpha_next, sigma_next) = Self::alpha_sigma(self.timesteps[step_index + 1]);
        let v = model_output.to_dtype(sample.dtype())?;

        let pred = ((sample * alpha)? - (&v * sigma)?)?;
        let eps = ((sample * sigma)? + (&v * alpha)?)?;
        Ok(((pred * alpha_next)? + (eps * sigma_next)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn unit_noise_level_starts_at_one() {
        let scheduler = VDiffusionScheduler::from_noise_level(f64::INFINITY);
        assert!((scheduler.t_max() - 1.0).abs() < 1e-12);
        let scheduler = VDiffusionScheduler::from_noise_level(1.0);
        assert!((scheduler.t_max() - 0.5).abs() < 1e-12, "atan(1) = π/4");
    }

    #[test]
    fn exact_v_recovers_data() {
        let device = Device::Cpu;
        let data = Tensor::randn(0f32, 1.0, (1, 2, 8), &device).unwrap();
        let noise = Tensor::randn(0f32, 1.0, (1, 2, 8), &device).unwrap();

        let mut scheduler = VDiffusionScheduler::new(0.9);
        scheduler.set_timesteps(6);
        let mut x = scheduler.add_noise(&data, &noise, 0).unwrap();
        for i in 0..6 {
            // v = α·ε - σ·x_0 at the current level.
            let (alpha, sigma) = VDiffusionScheduler::alpha_sigma(scheduler.timesteps()[i]);
            let v = ((&noise * alpha).unwrap() - (&data * sigma).unwrap()).unwrap();
            x = scheduler.step(&v, &x, i).unwrap();
        }
        let err: f32 = (x - &data)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(err < 1e-4, "DDIM with the true v should land on the data, err {err}");
    }
}
