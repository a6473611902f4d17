//! Continuous-input transformer stack.
//!
//! ```text
//! x [B, T, dim_in] → project_in → (+ add_cond) → [prepend tokens ; x]
//!   → blocks (RoPE self-attn, cross-attn, FF, optional adaLN)
//!   → project_out → [B, P + T, dim_out]
//! ```

use candle_core::{DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::layers::TransformerBlock;
use super::rope::RotaryEmbedding;
use crate::Result;

/// Construction parameters for [`ContinuousTransformer`].
#[derive(Debug, Clone)]
pub struct BackboneConfig {
    pub dim: usize,
    pub depth: usize,
    pub dim_heads: usize,
    pub dim_in: usize,
    pub dim_out: usize,
    pub ff_mult: f64,
    /// Context width for cross-attention; `None` disables it.
    pub cond_token_dim: Option<usize>,
    /// Global vector width for adaLN; `None` disables it.
    pub global_cond_dim: Option<usize>,
}

/// Inputs to one backbone pass beyond the sequence itself.
#[derive(Default)]
pub struct BackboneInputs<'a> {
    pub prepend_embeds: Option<&'a Tensor>,
    pub prepend_mask: Option<&'a Tensor>,
    pub context: Option<&'a Tensor>,
    pub context_mask: Option<&'a Tensor>,
    pub add_cond: Option<&'a Tensor>,
    pub global_cond: Option<&'a Tensor>,
    pub mask: Option<&'a Tensor>,
}

pub struct ContinuousTransformer {
    project_in: Linear,
    project_out: Linear,
    rotary: RotaryEmbedding,
    layers: Vec<TransformerBlock>,
}

impl ContinuousTransformer {
    /// `vb` points at the `transformer` prefix.
    pub fn new(cfg: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..cfg.depth)
            .map(|i| {
                TransformerBlock::new(
                    cfg.dim,
                    cfg.dim_heads,
                    cfg.ff_mult,
                    cfg.cond_token_dim,
                    cfg.global_cond_dim,
                    vb.pp(format!("layers.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            project_in: candle_nn::linear_no_bias(cfg.dim_in, cfg.dim, vb.pp("project_in"))?,
            project_out: candle_nn::linear_no_bias(cfg.dim, cfg.dim_out, vb.pp("project_out"))?,
            rotary: RotaryEmbedding::for_head_dim(cfg.dim_heads),
            layers,
        })
    }

    /// `x`: `[B, T, dim_in]` → `[B, P + T, dim_out]` where `P` is the prepend length.
    pub fn forward(&self, x: &Tensor, inputs: &BackboneInputs) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;
        let mut x = self.project_in.forward(x)?;

        if let Some(add_cond) = inputs.add_cond {
            x = x.broadcast_add(&add_cond.to_dtype(x.dtype())?)?;
        }

        let mut mask = inputs.mask.cloned();
        if let Some(prepend) = inputs.prepend_embeds {
            let prepend_len = prepend.dim(1)?;
            x = Tensor::cat(&[&prepend.to_dtype(x.dtype())?, &x], 1)?;
            if inputs.prepend_mask.is_some() || mask.is_some() {
                let device = x.device();
                let seq_mask = match &mask {
                    Some(m) => m.to_dtype(DType::F32)?,
                    None => Tensor::ones((batch, seq), DType::F32, device)?,
                };
                let prepend_mask = match inputs.prepend_mask {
                    Some(m) => m.to_dtype(DType::F32)?,
                    None => Tensor::ones((batch, prepend_len), DType::F32, device)?,
                };
                mask = Some(Tensor::cat(&[&prepend_mask, &seq_mask], 1)?);
            }
        }

        let rope = self
            .rotary
            .compute_freqs(x.dim(1)?, x.dtype(), x.device())?;

        for layer in &self.layers {
            x = layer.forward(
                &x,
                inputs.context,
                inputs.context_mask,
                inputs.global_cond,
                mask.as_ref(),
                Some(&rope),
            )?;
        }

        Ok(self.project_out.forward(&x)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn small_cfg() -> BackboneConfig {
        BackboneConfig {
            dim: 32,
            depth: 2,
            dim_heads: 16,
            dim_in: 6,
            dim_out: 4,
            ff_mult: 2.0,
            cond_token_dim: Some(32),
            global_cond_dim: None,
        }
    }

    #[test]
    fn output_includes_prepend_positions() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let backbone = ContinuousTransformer::new(&small_cfg(), vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 10, 6), &dev).unwrap();
        let prepend = Tensor::randn(0f32, 1.0, (2, 1, 32), &dev).unwrap();
        let prepend_mask = Tensor::ones((2, 1), DType::F32, &dev).unwrap();
        let ctx = Tensor::randn(0f32, 1.0, (2, 3, 32), &dev).unwrap();

        let out = backbone
            .forward(
                &x,
                &BackboneInputs {
                    prepend_embeds: Some(&prepend),
                    prepend_mask: Some(&prepend_mask),
                    context: Some(&ctx),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(out.dims(), &[2, 11, 4]);
    }

    #[test]
    fn add_cond_is_summed_after_project_in() {
        let dev = Device::Cpu;
        let cfg = BackboneConfig {
            cond_token_dim: None,
            ..small_cfg()
        };
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let backbone = ContinuousTransformer::new(&cfg, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 5, 6), &dev).unwrap();
        let add = Tensor::ones((1, 5, 32), DType::F32, &dev).unwrap();
        let out = backbone
            .forward(
                &x,
                &BackboneInputs {
                    add_cond: Some(&add),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(out.dims(), &[1, 5, 4]);
    }
}
