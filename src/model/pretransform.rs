//! Pretransforms: invertible maps between waveform audio and the diffused signal.
//!
//! Latent diffusion runs on the output of a pretransform's encoder and decodes
//! the sampled latents back to audio. Autoencoder pretransforms are supplied by
//! the caller through [`Pretransform`]; without one the model still knows the
//! latent geometry and can sample latents. The patch pretransform is built in.

use std::sync::Arc;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Encode/decode capability of a pretransform.
pub trait Pretransform: Send + Sync {
    /// `[B, io_channels, T]` → `[B, encoded_channels, T / downsampling_ratio]`.
    fn encode(&self, audio: &Tensor) -> Result<Tensor>;

    /// Inverse of [`Pretransform::encode`].
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;

    fn downsampling_ratio(&self) -> usize;

    /// Audio channels consumed by the encoder.
    fn io_channels(&self) -> usize;

    /// Channels of the encoded representation.
    fn encoded_channels(&self) -> usize;

    /// Dtype of the pretransform's parameters.
    fn dtype(&self) -> DType;
}

/// Pretransform section of a model config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum PretransformConfig {
    /// External autoencoder; weights are not loaded by this crate.
    Autoencoder {
        io_channels: usize,
        latent_dim: usize,
        downsampling_ratio: usize,
    },
    Patched {
        channels: usize,
        patch_size: usize,
    },
}

impl PretransformConfig {
    pub fn downsampling_ratio(&self) -> usize {
        match self {
            Self::Autoencoder {
                downsampling_ratio, ..
            } => *downsampling_ratio,
            Self::Patched { patch_size, .. } => *patch_size,
        }
    }

    pub fn io_channels(&self) -> usize {
        match self {
            Self::Autoencoder { io_channels, .. } => *io_channels,
            Self::Patched { channels, .. } => *channels,
        }
    }

    /// Build the pretransform. Autoencoders come back without weights.
    pub fn build(&self) -> Result<Arc<dyn Pretransform>> {
        match self {
            Self::Patched {
                channels,
                patch_size,
            } => Ok(Arc::new(PatchedPretransform::new(*channels, *patch_size)?)),
            Self::Autoencoder {
                io_channels,
                latent_dim,
                downsampling_ratio,
            } => Ok(Arc::new(UnloadedAutoencoder {
                io_channels: *io_channels,
                latent_dim: *latent_dim,
                downsampling_ratio: *downsampling_ratio,
            })),
        }
    }
}

/// Autoencoder geometry without weights: sampling works, encode/decode fail.
#[derive(Debug, Clone)]
pub struct UnloadedAutoencoder {
    io_channels: usize,
    latent_dim: usize,
    downsampling_ratio: usize,
}

impl UnloadedAutoencoder {
    fn unavailable(&self, op: &str) -> Error {
        Error::Config(format!(
            "cannot {op}: autoencoder weights are not loaded; register a pretransform or return latents"
        ))
    }
}

impl Pretransform for UnloadedAutoencoder {
    fn encode(&self, _audio: &Tensor) -> Result<Tensor> {
        Err(self.unavailable("encode init audio"))
    }

    fn decode(&self, _latents: &Tensor) -> Result<Tensor> {
        Err(self.unavailable("decode latents"))
    }

    fn downsampling_ratio(&self) -> usize {
        self.downsampling_ratio
    }

    fn io_channels(&self) -> usize {
        self.io_channels
    }

    fn encoded_channels(&self) -> usize {
        self.latent_dim
    }

    fn dtype(&self) -> DType {
        DType::F32
    }
}

/// Lossless folding of `patch_size` consecutive samples into channels.
///
/// `[B, C, L·P]` ↔ `[B, C·P, L]` (`b c (l h) -> b (c h) l`).
#[derive(Debug, Clone)]
pub struct PatchedPretransform {
    channels: usize,
    patch_size: usize,
}

impl PatchedPretransform {
    pub fn new(channels: usize, patch_size: usize) -> Result<Self> {
        if patch_size == 0 {
            return Err(Error::Config("patch_size must be at least 1".into()));
        }
        Ok(Self {
            channels,
            patch_size,
        })
    }
}

impl Pretransform for PatchedPretransform {
    fn encode(&self, audio: &Tensor) -> Result<Tensor> {
        let (b, c, t) = audio.dims3()?;
        let h = self.patch_size;
        if t % h != 0 {
            return Err(Error::Invariant(format!(
                "audio length {t} is not a multiple of patch size {h}"
            )));
        }
        Ok(audio
            .reshape((b, c, t / h, h))?
            .transpose(2, 3)?
            .contiguous()?
            .reshape((b, c * h, t / h))?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let (b, ch, l) = latents.dims3()?;
        let h = self.patch_size;
        let c = ch / h;
        Ok(latents
            .reshape((b, c, h, l))?
            .transpose(2, 3)?
            .contiguous()?
            .reshape((b, c, l * h))?)
    }

    fn downsampling_ratio(&self) -> usize {
        self.patch_size
    }

    fn io_channels(&self) -> usize {
        self.channels
    }

    fn encoded_channels(&self) -> usize {
        self.channels * self.patch_size
    }

    fn dtype(&self) -> DType {
        DType::F32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn patched_round_trip_is_lossless() {
        let p = PatchedPretransform::new(2, 4).unwrap();
        let audio = Tensor::randn(0f32, 1.0, (1, 2, 32), &Device::Cpu).unwrap();
        let latents = p.encode(&audio).unwrap();
        assert_eq!(latents.dims(), &[1, 8, 8]);
        let restored = p.decode(&latents).unwrap();
        let a: Vec<f32> = audio.flatten_all().unwrap().to_vec1().unwrap();
        let r: Vec<f32> = restored.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, r);
    }

    #[test]
    fn patched_rejects_ragged_length() {
        let p = PatchedPretransform::new(1, 4).unwrap();
        let audio = Tensor::zeros((1, 1, 10), DType::F32, &Device::Cpu).unwrap();
        assert!(p.encode(&audio).is_err());
    }

    #[test]
    fn config_parses_adjacent_tag() {
        let json = r#"{"type": "autoencoder", "config": {"io_channels": 2, "latent_dim": 64, "downsampling_ratio": 2048}}"#;
        let cfg: PretransformConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.downsampling_ratio(), 2048);
        assert_eq!(cfg.io_channels(), 2);
        let unloaded = cfg.build().unwrap();
        assert_eq!(unloaded.encoded_channels(), 64);
        let latents = Tensor::zeros((1, 64, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(unloaded.decode(&latents), Err(Error::Config(_))));
    }
}
