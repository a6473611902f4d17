//! Audio and video conditioners backed by pretrained encoders or a pretransform.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use super::backbone::{AudioEncoder, BackboneOwnership, Backbones, ImageEncoder, VideoEncoder};
use super::config::{
    ClapAudioOptions, HieraOptions, PretransformOptions, VideoClipOptions, clip_width,
};
use super::value::{ConditionValue, feature_batch, tensors};
use super::{ConditionerOutput, ProjOut};
use crate::audio::set_audio_channels;
use crate::model::pretransform::Pretransform;
use crate::{Error, Result};

fn ones_mask(batch: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::ones((batch, 1), DType::F32, device)?)
}

/// Adapt `[C, T]` / `[T]` clips to `channels`, right-pad to a common length
/// and stack as `[B, channels, T]`.
fn stack_audio(clips: &[Tensor], channels: usize, device: &Device) -> Result<Tensor> {
    let clips = clips
        .iter()
        .map(|c| {
            let c = match c.rank() {
                1 => c.unsqueeze(0)?.unsqueeze(0)?,
                2 => c.unsqueeze(0)?,
                3 if c.dim(0)? == 1 => c.clone(),
                rank => {
                    return Err(Error::Audio(format!(
                        "conditioning audio must be [T] or [C, T], got rank {rank}"
                    )));
                }
            };
            let c = c.to_device(device)?.to_dtype(DType::F32)?;
            set_audio_channels(&c, channels)
        })
        .collect::<Result<Vec<_>>>()?;
    let longest = clips
        .iter()
        .map(|c| c.dim(2))
        .collect::<candle_core::Result<Vec<_>>>()?
        .into_iter()
        .max()
        .ok_or_else(|| Error::Invariant("empty conditioning batch".into()))?;
    let padded = clips
        .iter()
        .map(|c| -> Result<Tensor> { Ok(c.pad_with_zeros(2, 0, longest - c.dim(2)?)?) })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::cat(&padded, 0)?)
}

/// CLAP audio embedding of mono-downmixed clips, as a single token.
pub struct ClapAudioConditioner {
    encoder: Box<dyn AudioEncoder>,
    proj_out: ProjOut,
    dtype: DType,
}

impl ClapAudioConditioner {
    pub fn new(
        opts: &ClapAudioOptions,
        id: &str,
        vb: VarBuilder,
        backbones: &mut Backbones,
    ) -> Result<Self> {
        let encoder = backbones.take_audio(id)?;
        let proj_out = ProjOut::new(encoder.width(), opts.output_dim, opts.project_out, vb.clone())?;
        Ok(Self {
            encoder,
            proj_out,
            dtype: vb.dtype(),
        })
    }

    pub fn forward(
        &mut self,
        inputs: &[ConditionValue],
        device: &Device,
    ) -> Result<ConditionerOutput> {
        let mono = stack_audio(&tensors(inputs)?, 1, device)?.squeeze(1)?;
        let embeds = self.encoder.embed(&mono)?.to_dtype(self.dtype)?;
        let embeds = self.proj_out.forward(&embeds.unsqueeze(1)?)?;
        let batch = embeds.dim(0)?;
        Ok(ConditionerOutput::Paired(embeds, ones_mask(batch, device)?))
    }
}

/// Per-frame CLIP image features: `[B, T, C, H, W] → [B, T, output_dim]`.
pub struct VideoClipConditioner {
    encoder: Box<dyn ImageEncoder>,
    proj_out: ProjOut,
    ownership: BackboneOwnership,
    dtype: DType,
}

impl VideoClipConditioner {
    pub fn new(
        opts: &VideoClipOptions,
        id: &str,
        vb: VarBuilder,
        backbones: &mut Backbones,
    ) -> Result<Self> {
        let dim = clip_width(&opts.clip_model_name).ok_or_else(|| {
            Error::Config(format!("{id}: unknown CLIP model name {}", opts.clip_model_name))
        })?;
        let encoder = backbones.take_image(id)?;
        if encoder.width() != dim {
            return Err(Error::Config(format!(
                "{id}: image encoder is {} wide but {} features are {dim} wide",
                encoder.width(),
                opts.clip_model_name
            )));
        }
        let proj_out = ProjOut::new(dim, opts.output_dim, opts.project_out, vb.clone())?;
        Ok(Self {
            encoder,
            proj_out,
            ownership: BackboneOwnership::from_flag(opts.enable_grad),
            dtype: vb.dtype(),
        })
    }

    pub fn ownership(&self) -> BackboneOwnership {
        self.ownership
    }

    pub fn forward(
        &mut self,
        inputs: &[ConditionValue],
        device: &Device,
    ) -> Result<ConditionerOutput> {
        let video = feature_batch(inputs, None, device, DType::F32)?;
        let (b, t, c, h, w) = video.dims5()?;
        let frames = video.reshape((b * t, c, h, w))?;
        let features = self.encoder.image_features(&frames)?;
        let features = features
            .reshape((b, t, features.dim(1)?))?
            .to_dtype(self.dtype)?;
        let embeds = self.proj_out.forward(&features)?;
        Ok(ConditionerOutput::Paired(embeds, ones_mask(b, device)?))
    }
}

/// Hiera video tokens, projected.
pub struct HieraConditioner {
    encoder: Box<dyn VideoEncoder>,
    proj_out: ProjOut,
    ownership: BackboneOwnership,
    dtype: DType,
}

impl HieraConditioner {
    pub fn new(
        opts: &HieraOptions,
        id: &str,
        vb: VarBuilder,
        backbones: &mut Backbones,
    ) -> Result<Self> {
        let encoder = backbones.take_video(id)?;
        let proj_out = ProjOut::new(encoder.width(), opts.output_dim, opts.project_out, vb.clone())?;
        Ok(Self {
            encoder,
            proj_out,
            ownership: BackboneOwnership::from_flag(opts.finetune),
            dtype: vb.dtype(),
        })
    }

    pub fn ownership(&self) -> BackboneOwnership {
        self.ownership
    }

    pub fn forward(
        &mut self,
        inputs: &[ConditionValue],
        device: &Device,
    ) -> Result<ConditionerOutput> {
        let video = feature_batch(inputs, None, device, DType::F32)?;
        let tokens = self.encoder.encode(&video)?.to_dtype(self.dtype)?;
        let embeds = self.proj_out.forward(&tokens)?;
        let batch = embeds.dim(0)?;
        Ok(ConditionerOutput::Paired(embeds, ones_mask(batch, device)?))
    }
}

/// Audio encoded by a pretransform, channel-projected, returned channel-first.
///
/// Output is `[B, output_dim, T_latent]` with an all-ones `[B, T_latent]` mask.
pub struct PretransformConditioner {
    pretransform: Arc<dyn Pretransform>,
    proj_out: ProjOut,
}

impl PretransformConditioner {
    pub fn new(
        opts: &PretransformOptions,
        id: &str,
        vb: VarBuilder,
        backbones: &mut Backbones,
    ) -> Result<Self> {
        let pretransform = match backbones.take_pretransform(id) {
            Some(p) => p,
            None => opts.pretransform_config.build()?,
        };
        let proj_out = ProjOut::new(
            pretransform.encoded_channels(),
            opts.output_dim,
            false,
            vb,
        )?;
        Ok(Self {
            pretransform,
            proj_out,
        })
    }

    pub fn forward(
        &mut self,
        inputs: &[ConditionValue],
        device: &Device,
    ) -> Result<ConditionerOutput> {
        let audio = stack_audio(&tensors(inputs)?, self.pretransform.io_channels(), device)?
            .to_dtype(self.pretransform.dtype())?;
        let latents = self.pretransform.encode(&audio)?;
        let embeds = self
            .proj_out
            .forward(&latents.transpose(1, 2)?.contiguous()?)?
            .transpose(1, 2)?;
        let (batch, _, length) = embeds.dims3()?;
        Ok(ConditionerOutput::Paired(
            embeds,
            Tensor::ones((batch, length), DType::F32, device)?,
        ))
    }
}
