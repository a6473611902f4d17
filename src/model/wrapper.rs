//! Conditioner, diffusion transformer and pretransform bundled as one model.
//!
//! Checkpoint layout (stable-audio style):
//!
//! ```text
//! conditioner.conditioners.<id>.*   conditioner weights
//! model.model.*                     diffusion transformer
//! ```

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use super::conditioner::{Backbones, CondTensors, ConditioningBatch, Metadata, MultiConditioner};
use super::pretransform::Pretransform;
use super::transformer::{DiffusionConditioning, DiffusionTransformer, NegativeConditioning};
use crate::checkpoint::ModelSource;
use crate::config::{DiffusionConfig, ModelConfig};
use crate::scheduler::DiffusionObjective;
use crate::{Error, Result};

/// [`Backbones`] key under which a caller-supplied model pretransform is looked up.
pub const MODEL_PRETRANSFORM: &str = "pretransform";

/// Which conditioning ids feed which transformer input.
#[derive(Debug, Clone, Default)]
pub struct ConditioningRoutes {
    pub cross_attention: Vec<String>,
    pub global: Vec<String>,
    pub input_concat: Vec<String>,
    pub prepend: Vec<String>,
    pub add: Vec<String>,
}

impl From<&DiffusionConfig> for ConditioningRoutes {
    fn from(config: &DiffusionConfig) -> Self {
        Self {
            cross_attention: config.cross_attention_cond_ids.clone(),
            global: config.global_cond_ids.clone(),
            input_concat: config.input_concat_ids.clone(),
            prepend: config.prepend_cond_ids.clone(),
            add: config.add_cond_ids.clone(),
        }
    }
}

pub struct ConditionedDiffusionModel {
    pub model: DiffusionTransformer,
    pub conditioner: Option<MultiConditioner>,
    pub pretransform: Option<Arc<dyn Pretransform>>,
    pub routes: ConditioningRoutes,
    pub diffusion_objective: DiffusionObjective,
    pub io_channels: usize,
    pub sample_rate: u32,
    pub sample_size: usize,
}

impl ConditionedDiffusionModel {
    /// Build every component of `config` from `vb`.
    ///
    /// A pretransform registered in `backbones` under [`MODEL_PRETRANSFORM`]
    /// takes precedence over the configured one.
    pub fn load(
        config: &ModelConfig,
        vb: VarBuilder,
        backbones: &mut Backbones,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let conditioner = MultiConditioner::new(
            &config.model.conditioning,
            vb.pp("conditioner").pp("conditioners"),
            backbones,
            device,
        )?;
        let model = DiffusionTransformer::new(&config.model.diffusion.config, vb.pp("model").pp("model"))?;
        let pretransform = match backbones.take_pretransform(MODEL_PRETRANSFORM) {
            Some(p) => Some(p),
            None => config.model.pretransform.as_ref().map(|p| p.build()).transpose()?,
        };
        if let Some(p) = &pretransform
            && p.encoded_channels() != config.model.io_channels
        {
            return Err(Error::Config(format!(
                "pretransform encodes {} channels but the model diffuses {}",
                p.encoded_channels(),
                config.model.io_channels
            )));
        }

        tracing::info!(
            objective = %config.model.diffusion.diffusion_objective,
            io_channels = config.model.io_channels,
            latent = pretransform.is_some(),
            "Loaded diffusion model"
        );

        Ok(Self {
            model,
            conditioner: Some(conditioner),
            pretransform,
            routes: ConditioningRoutes::from(&config.model.diffusion),
            diffusion_objective: config.model.diffusion.diffusion_objective,
            io_channels: config.model.io_channels,
            sample_rate: config.sample_rate,
            sample_size: config.sample_size,
        })
    }

    /// Load `model_config.json` and `model.safetensors` from `source`.
    pub fn from_pretrained(
        source: &ModelSource,
        backbones: &mut Backbones,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let config = ModelConfig::from_file(source.resolve("model_config.json")?)?;
        let vb = source.var_builder(&["model.safetensors"], dtype, device)?;
        Self::load(&config, vb, backbones, device)
    }

    /// Run the conditioner over a batch of metadata.
    pub fn condition(&mut self, batch: &[Metadata], device: &Device) -> Result<ConditioningBatch> {
        match &mut self.conditioner {
            Some(conditioner) => conditioner.forward(batch, device),
            None => Err(Error::Invariant(
                "model has no conditioner; pass precomputed conditioning tensors".into(),
            )),
        }
    }

    /// Route conditioner outputs into the transformer's conditioning inputs.
    pub fn get_conditioning_inputs(&self, batch: &ConditioningBatch) -> Result<DiffusionConditioning> {
        let routes = &self.routes;
        let (cross_attn_cond, cross_attn_mask) = concat_tokens(batch, &routes.cross_attention)?.unzip();
        let (prepend_cond, prepend_cond_mask) = concat_tokens(batch, &routes.prepend)?.unzip();
        Ok(DiffusionConditioning {
            cross_attn_cond,
            cross_attn_mask,
            global_cond: concat_global(batch, &routes.global)?,
            input_concat_cond: concat_on(batch, &routes.input_concat, 1)?,
            prepend_cond,
            prepend_cond_mask,
            add_cond: concat_on(batch, &routes.add, 2)?,
        })
    }

    /// Route negative-prompt conditioner outputs: only cross-attention, global
    /// and input-concat conditioning have negative counterparts.
    pub fn get_negative_conditioning_inputs(
        &self,
        batch: &ConditioningBatch,
    ) -> Result<NegativeConditioning> {
        let routes = &self.routes;
        let (cross_attn_cond, cross_attn_mask) = concat_tokens(batch, &routes.cross_attention)?.unzip();
        Ok(NegativeConditioning {
            cross_attn_cond,
            cross_attn_mask,
            global_cond: concat_global(batch, &routes.global)?,
            input_concat_cond: concat_on(batch, &routes.input_concat, 1)?,
        })
    }
}

fn entry<'a>(batch: &'a ConditioningBatch, key: &str) -> Result<&'a CondTensors> {
    batch.get(key).ok_or_else(|| Error::MissingConditioningKey {
        key: key.to_string(),
    })
}

/// Concatenate token sequences and their masks over the token axis.
///
/// 2-D inputs gain a token axis; `[B, 1]` masks are broadcast to the token
/// length; entries without a mask attend everywhere.
fn concat_tokens(batch: &ConditioningBatch, ids: &[String]) -> Result<Option<(Tensor, Tensor)>> {
    if ids.is_empty() {
        return Ok(None);
    }
    let mut tokens = Vec::with_capacity(ids.len());
    let mut masks = Vec::with_capacity(ids.len());
    for id in ids {
        let cond = entry(batch, id)?;
        let t = match cond.tokens().rank() {
            2 => cond.tokens().unsqueeze(1)?,
            _ => cond.tokens().clone(),
        };
        let (b, s, _) = t.dims3()?;
        let mask = match cond.mask() {
            Some(m) => {
                let m = if m.rank() == 1 { m.unsqueeze(1)? } else { m.clone() };
                let m = m.to_dtype(DType::F32)?;
                match m.dim(1)? {
                    len if len == s => m,
                    1 => m.broadcast_as((b, s))?.contiguous()?,
                    len => {
                        return Err(Error::Invariant(format!(
                            "conditioning {id}: mask length {len} does not match {s} tokens"
                        )));
                    }
                }
            }
            None => Tensor::ones((b, s), DType::F32, t.device())?,
        };
        tokens.push(t);
        masks.push(mask);
    }
    Ok(Some((Tensor::cat(&tokens, 1)?, Tensor::cat(&masks, 1)?)))
}

/// Concatenate global vectors on channels; a single-token axis is squeezed.
fn concat_global(batch: &ConditioningBatch, ids: &[String]) -> Result<Option<Tensor>> {
    let Some(global) = concat_on_last(batch, ids)? else {
        return Ok(None);
    };
    if global.rank() == 3 && global.dim(1)? == 1 {
        Ok(Some(global.squeeze(1)?))
    } else {
        Ok(Some(global))
    }
}

fn concat_on_last(batch: &ConditioningBatch, ids: &[String]) -> Result<Option<Tensor>> {
    if ids.is_empty() {
        return Ok(None);
    }
    let parts = ids
        .iter()
        .map(|id| Ok(entry(batch, id)?.tokens().clone()))
        .collect::<Result<Vec<_>>>()?;
    let last = parts[0].rank() - 1;
    Ok(Some(Tensor::cat(&parts, last)?))
}

fn concat_on(batch: &ConditioningBatch, ids: &[String], dim: usize) -> Result<Option<Tensor>> {
    if ids.is_empty() {
        return Ok(None);
    }
    let parts = ids
        .iter()
        .map(|id| Ok(entry(batch, id)?.tokens().clone()))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(Tensor::cat(&parts, dim)?))
}
