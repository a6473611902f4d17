//! Model configuration (`model_config.json`).
//!
//! Mirrors the stable-audio style layout:
//!
//! ```text
//! {sample_size, sample_rate, audio_channels,
//!  model: {io_channels, pretransform?, conditioning,
//!          diffusion: {*_cond_ids, diffusion_objective, config: DiTConfig}}}
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::conditioner::ConditioningConfig;
use crate::model::pretransform::PretransformConfig;
use crate::model::transformer::config::DiTConfig;
use crate::scheduler::DiffusionObjective;
use crate::{Error, Result};

/// Top-level model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Default output length in audio samples.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_audio_channels")]
    pub audio_channels: usize,
    pub model: DiffusionModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionModelConfig {
    /// Channels of the diffused signal.
    pub io_channels: usize,
    #[serde(default)]
    pub pretransform: Option<PretransformConfig>,
    pub conditioning: ConditioningConfig,
    pub diffusion: DiffusionConfig,
}

/// Routing of conditioner outputs into the transformer, plus the DiT itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    #[serde(default)]
    pub cross_attention_cond_ids: Vec<String>,
    #[serde(default)]
    pub global_cond_ids: Vec<String>,
    #[serde(default)]
    pub input_concat_ids: Vec<String>,
    #[serde(default)]
    pub prepend_cond_ids: Vec<String>,
    #[serde(default)]
    pub add_cond_ids: Vec<String>,
    #[serde(default = "default_objective")]
    pub diffusion_objective: DiffusionObjective,
    pub config: DiTConfig,
}

impl ModelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-check the sections against each other.
    pub fn validate(&self) -> Result<()> {
        let model = &self.model;
        if model.io_channels != model.diffusion.config.io_channels {
            return Err(Error::Config(format!(
                "model io_channels {} does not match diffusion io_channels {}",
                model.io_channels, model.diffusion.config.io_channels
            )));
        }
        let known: Vec<&str> = model
            .conditioning
            .configs
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        let routed = model
            .diffusion
            .cross_attention_cond_ids
            .iter()
            .chain(&model.diffusion.global_cond_ids)
            .chain(&model.diffusion.input_concat_ids)
            .chain(&model.diffusion.prepend_cond_ids)
            .chain(&model.diffusion.add_cond_ids);
        for id in routed {
            let base = id.strip_suffix("_g").unwrap_or(id);
            if !known.contains(&id.as_str()) && !known.contains(&base) {
                return Err(Error::Config(format!(
                    "diffusion routes conditioning id {id} that no conditioner produces"
                )));
            }
        }
        Ok(())
    }

    /// Output length in diffusion frames: audio samples divided by the
    /// pretransform's downsampling ratio when there is one.
    pub fn latent_length(&self, sample_size: usize) -> usize {
        match &self.model.pretransform {
            Some(p) => sample_size / p.downsampling_ratio(),
            None => sample_size,
        }
    }
}

fn default_sample_size() -> usize {
    2_097_152
}

fn default_sample_rate() -> u32 {
    44_100
}

fn default_audio_channels() -> usize {
    2
}

fn default_objective() -> DiffusionObjective {
    DiffusionObjective::RectifiedFlow
}
