//! Step schedules for the sampling loop.
//!
//! One schedule per diffusion objective:
//!
//! - [`rectified_flow`] — Euler integration of the predicted velocity over a
//!   linear `t` grid, `x_t = (1 - t) · x_0 + t · ε`
//! - [`v_diffusion`] — deterministic DDIM over the cosine schedule
//!   `α = cos(πt/2)`, `σ = sin(πt/2)`, with v-prediction
//!
//! Both run from `t_max` (1 for fresh generation, lower for variations of an
//! init signal) down to 0 in `steps` model evaluations.

pub mod rectified_flow;
pub mod v_diffusion;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};
use rectified_flow::RectifiedFlowScheduler;
use v_diffusion::VDiffusionScheduler;

/// Common interface for both schedules.
pub trait Scheduler {
    /// Set up the `t` grid for a given number of inference steps.
    fn set_timesteps(&mut self, num_inference_steps: usize);

    /// Model timesteps, `steps + 1` values from `t_max` down to 0.
    fn timesteps(&self) -> &[f64];

    /// `init` noised to the level of `timesteps()[step_index]`.
    fn add_noise(&self, init: &Tensor, noise: &Tensor, step_index: usize) -> Result<Tensor>;

    /// Advance `sample` from `timesteps()[step_index]` to `timesteps()[step_index + 1]`.
    fn step(&mut self, model_output: &Tensor, sample: &Tensor, step_index: usize)
    -> Result<Tensor>;

    /// Number of model evaluations.
    fn num_steps(&self) -> usize {
        self.timesteps().len().saturating_sub(1)
    }
}

/// What the denoiser predicts, and therefore which schedule integrates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffusionObjective {
    #[serde(rename = "v")]
    V,
    #[serde(rename = "rectified_flow")]
    RectifiedFlow,
}

impl DiffusionObjective {
    /// Schedule for this objective.
    ///
    /// `None` starts from pure noise at `t = 1`. `Some(level)` starts a
    /// variation at the given noise level.
    pub fn scheduler(self, init_noise_level: Option<f64>) -> Box<dyn Scheduler> {
        match (self, init_noise_level) {
            (Self::RectifiedFlow, level) => {
                Box::new(RectifiedFlowScheduler::new(level.unwrap_or(1.0)))
            }
            (Self::V, None) => Box::new(VDiffusionScheduler::new(1.0)),
            (Self::V, Some(level)) => Box::new(VDiffusionScheduler::from_noise_level(level)),
        }
    }
}

impl std::fmt::Display for DiffusionObjective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V => write!(f, "v"),
            Self::RectifiedFlow => write!(f, "rectified_flow"),
        }
    }
}

impl std::str::FromStr for DiffusionObjective {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v" => Ok(Self::V),
            "rectified_flow" | "rf" => Ok(Self::RectifiedFlow),
            other => Err(Error::Config(format!("unknown diffusion objective {other:?}"))),
        }
    }
}

/// `steps + 1` evenly spaced values from `start` down to 0.
pub(crate) fn linspace_to_zero(start: f64, steps: usize) -> Vec<f64> {
    (0..=steps)
        .map(|i| start * (1.0 - i as f64 / steps.max(1) as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_ends_at_zero() {
        let t = linspace_to_zero(1.0, 4);
        assert_eq!(t, vec![1.0, 0.75, 0.5, 0.25, 0.0]);
    }

    #[test]
    fn objective_parses_config_names() {
        let v: DiffusionObjective = serde_json::from_str("\"rectified_flow\"").unwrap();
        assert_eq!(v, DiffusionObjective::RectifiedFlow);
        assert_eq!("v".parse::<DiffusionObjective>().unwrap(), DiffusionObjective::V);
        assert!("ddpm".parse::<DiffusionObjective>().is_err());
    }

    #[test]
    fn scheduler_counts_steps() {
        let mut scheduler = DiffusionObjective::V.scheduler(None);
        scheduler.set_timesteps(24);
        assert_eq!(scheduler.num_steps(), 24);
        assert_eq!(scheduler.timesteps().len(), 25);
        assert_eq!(scheduler.timesteps()[0], 1.0);
    }

    #[test]
    fn variation_level_lowers_the_start() {
        let mut rf = DiffusionObjective::RectifiedFlow.scheduler(Some(0.3));
        rf.set_timesteps(3);
        assert!((rf.timesteps()[0] - 0.3).abs() < 1e-12);

        let mut v = DiffusionObjective::V.scheduler(Some(1.0));
        v.set_timesteps(3);
        assert!((v.timesteps()[0] - 0.5).abs() < 1e-12);
    }
}
