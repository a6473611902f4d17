//! Conditioners over precomputed feature files (video, sync, text embeddings).

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::ConditionerOutput;
use super::config::{FeatureOptions, VideoGlobalOptions};
use super::value::{ConditionValue, feature_batch};
use crate::Result;

/// Linear projection of stacked features, `[B, S, dim] → [B, S, output_dim]`.
///
/// Used by `video_linear`, `video_sync` and `text_linear`, which differ only in
/// the tensor name read from torch archives.
pub struct LinearFeatures {
    embedder: Linear,
    pth_key: Option<&'static str>,
    dtype: DType,
}

impl LinearFeatures {
    pub fn new(opts: &FeatureOptions, pth_key: Option<&'static str>, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            embedder: candle_nn::linear(opts.dim, opts.output_dim, vb.pp("embedder.0"))?,
            pth_key,
            dtype: vb.dtype(),
        })
    }

    pub fn forward(&self, inputs: &[ConditionValue], device: &Device) -> Result<ConditionerOutput> {
        let x = feature_batch(inputs, self.pth_key, device, self.dtype)?;
        let x = self.embedder.forward(&x)?;
        let mask = Tensor::ones((x.dim(0)?, 1), DType::F32, device)?;
        Ok(ConditionerOutput::Paired(x, mask))
    }
}

/// Projected video features plus a pooled global vector.
///
/// Returns tokens `[B, S, output_dim]` and `global_proj(mean_S(tokens))` `[B, global_dim]`.
pub struct GlobalVideoFeatures {
    embedder: Linear,
    global_proj: Linear,
    pth_key: Option<&'static str>,
    dtype: DType,
}

impl GlobalVideoFeatures {
    pub fn new(
        opts: &VideoGlobalOptions,
        pth_key: Option<&'static str>,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            pth_key,
            embedder: candle_nn::linear(opts.dim, opts.output_dim, vb.pp("embedder.0"))?,
            global_proj: candle_nn::linear(
                opts.output_dim,
                opts.global_dim,
                vb.pp("global_proj.0"),
            )?,
            dtype: vb.dtype(),
        })
    }

    pub fn forward(&self, inputs: &[ConditionValue], device: &Device) -> Result<ConditionerOutput> {
        let x = feature_batch(inputs, self.pth_key, device, self.dtype)?;
        let x = self.embedder.forward(&x)?;
        let global = self.global_proj.forward(&x.mean(1)?)?;
        let batch = x.dim(0)?;
        Ok(ConditionerOutput::PairedWithGlobal(
            x,
            Tensor::ones((batch, 1), DType::F32, device)?,
            global,
            Tensor::ones((batch, 1), DType::F32, device)?,
        ))
    }
}

/// Features passed through unchanged (`mm_unchang`).
pub struct PassthroughFeatures {
    pth_key: Option<&'static str>,
    dtype: DType,
}

impl PassthroughFeatures {
    pub fn new(_opts: &FeatureOptions, pth_key: Option<&'static str>, vb: VarBuilder) -> Self {
        Self {
            pth_key,
            dtype: vb.dtype(),
        }
    }

    pub fn forward(&self, inputs: &[ConditionValue], device: &Device) -> Result<ConditionerOutput> {
        let x = feature_batch(inputs, self.pth_key, device, self.dtype)?;
        Ok(ConditionerOutput::Single(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensors(batch: usize, seq: usize, dim: usize) -> Vec<ConditionValue> {
        (0..batch)
            .map(|_| {
                ConditionValue::Tensor(Tensor::randn(0f32, 1.0, (seq, dim), &Device::Cpu).unwrap())
            })
            .collect()
    }

    #[test]
    fn linear_features_project_and_mask() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let opts = FeatureOptions {
            dim: 12,
            output_dim: 8,
        };
        let cond = LinearFeatures::new(&opts, Some("sync_features"), vb).unwrap();
        let out = cond.forward(&tensors(2, 5, 12), &Device::Cpu).unwrap();
        let ConditionerOutput::Paired(tokens, mask) = out else {
            panic!("expected a token/mask pair");
        };
        assert_eq!(tokens.dims(), &[2, 5, 8]);
        assert_eq!(mask.dims(), &[2, 1]);
    }

    #[test]
    fn global_features_add_pooled_vector() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let opts = VideoGlobalOptions {
            dim: 12,
            output_dim: 8,
            global_dim: 16,
        };
        let cond = GlobalVideoFeatures::new(&opts, Some("metaclip_features"), vb).unwrap();
        let out = cond.forward(&tensors(3, 4, 12), &Device::Cpu).unwrap();
        let ConditionerOutput::PairedWithGlobal(tokens, _, global, global_mask) = out else {
            panic!("expected tokens plus global");
        };
        assert_eq!(tokens.dims(), &[3, 4, 8]);
        assert_eq!(global.dims(), &[3, 16]);
        assert_eq!(global_mask.dims(), &[3, 1]);
    }

    #[test]
    fn passthrough_stacks_inputs() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let opts = FeatureOptions {
            dim: 6,
            output_dim: 6,
        };
        let cond = PassthroughFeatures::new(&opts, Some("metaclip_features"), vb);
        let out = cond.forward(&tensors(2, 3, 6), &Device::Cpu).unwrap();
        assert!(matches!(out, ConditionerOutput::Single(ref t) if t.dims() == [2, 3, 6]));
    }
}
