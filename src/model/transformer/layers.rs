//! Transformer layer types for the diffusion backbone.
//!
//! - [`LayerNorm`] — bias-free layer norm (learned `gamma` only)
//! - [`FeedForward`] — GLU feed-forward with SiLU gate
//! - [`ConvMlp`] — channel-last gated conv MLP for additive conditioning
//! - [`TransformerBlock`] — self-attention + optional cross-attention + feed-forward,
//!   with optional adaLN modulation from a global vector

use candle_core::{D, Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Linear, VarBuilder};

use super::attention::Attention;
use crate::Result;

const LAYER_NORM_EPS: f64 = 1e-5;

/// Layer norm with a learned scale and a fixed zero bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    gamma: Tensor,
}

impl LayerNorm {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gamma: vb.get(dim, "gamma")?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(candle_core::DType::F32)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + LAYER_NORM_EPS)?.sqrt()?)?;
        Ok(normed
            .to_dtype(dtype)?
            .broadcast_mul(&self.gamma.to_dtype(dtype)?)?)
    }
}

/// GLU feed-forward: `Linear(dim, 2·inner)` → `x · silu(gate)` → `Linear(inner, dim)`.
///
/// Weights at `ff.0.proj` and `ff.4`; indices 1–3 are parameter-free reshapes.
#[derive(Debug, Clone)]
pub struct FeedForward {
    proj_in: Linear,
    proj_out: Linear,
}

impl FeedForward {
    pub fn new(dim: usize, mult: f64, vb: VarBuilder) -> Result<Self> {
        let inner = (dim as f64 * mult) as usize;
        let vb = vb.pp("ff");
        Ok(Self {
            proj_in: candle_nn::linear(dim, inner * 2, vb.pp("0").pp("proj"))?,
            proj_out: candle_nn::linear(inner, dim, vb.pp("4"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.proj_in.forward(x)?;
        let parts = h.chunk(2, D::Minus1)?;
        let h = (&parts[0] * parts[1].silu()?)?;
        Ok(self.proj_out.forward(&h)?)
    }
}

/// Gated conv MLP over channel-last sequences: `w2(silu(w1 x) · w3 x)`.
///
/// The hidden width is `2/3` of the requested size, rounded up to a multiple of 256.
#[derive(Debug, Clone)]
pub struct ConvMlp {
    w1: Conv1d,
    w2: Conv1d,
    w3: Conv1d,
}

impl ConvMlp {
    pub fn new(dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = Self::hidden_width(hidden_dim);
        let cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            w1: candle_nn::conv1d_no_bias(dim, hidden, 3, cfg, vb.pp("w1"))?,
            w2: candle_nn::conv1d_no_bias(hidden, dim, 3, cfg, vb.pp("w2"))?,
            w3: candle_nn::conv1d_no_bias(dim, hidden, 3, cfg, vb.pp("w3"))?,
        })
    }

    pub fn hidden_width(hidden_dim: usize) -> usize {
        let hidden = 2 * hidden_dim / 3;
        256 * hidden.div_ceil(256)
    }

    /// `x`: `[B, T, C]` → `[B, T, C]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.transpose(1, 2)?.contiguous()?;
        let gate = self.w1.forward(&x)?.silu()?;
        let h = (gate * self.w3.forward(&x)?)?;
        Ok(self.w2.forward(&h)?.transpose(1, 2)?)
    }
}

/// One backbone block.
pub struct TransformerBlock {
    pre_norm: LayerNorm,
    self_attn: Attention,
    cross: Option<(LayerNorm, Attention)>,
    ff_norm: LayerNorm,
    ff: FeedForward,
    /// SiLU → `Linear(global_dim, 6·dim)`, present in adaLN mode.
    to_scale_shift_gate: Option<Linear>,
}

impl TransformerBlock {
    pub fn new(
        dim: usize,
        dim_heads: usize,
        ff_mult: f64,
        cross_attend_dim: Option<usize>,
        global_cond_dim: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cross = match cross_attend_dim {
            Some(ctx_dim) => Some((
                LayerNorm::new(dim, vb.pp("cross_attend_norm"))?,
                Attention::cross_attention(vb.pp("cross_attn"), dim, ctx_dim, dim_heads)?,
            )),
            None => None,
        };
        let to_scale_shift_gate = match global_cond_dim {
            Some(g) => Some(candle_nn::linear_no_bias(
                g,
                dim * 6,
                vb.pp("to_scale_shift_gate").pp("1"),
            )?),
            None => None,
        };
        Ok(Self {
            pre_norm: LayerNorm::new(dim, vb.pp("pre_norm"))?,
            self_attn: Attention::self_attention(vb.pp("self_attn"), dim, dim_heads)?,
            cross,
            ff_norm: LayerNorm::new(dim, vb.pp("ff_norm"))?,
            ff: FeedForward::new(dim, ff_mult, vb.pp("ff"))?,
            to_scale_shift_gate,
        })
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, S, D]`
    /// - `context` / `context_mask`: cross-attention tokens `[B, S_ctx, D_ctx]` and `[B, S_ctx]`
    /// - `global_cond`: `[B, G]`, used only in adaLN mode
    /// - `mask`: `[B, S]` sequence mask
    /// - `rope`: `(cos, sin)` tables for the sequence
    pub fn forward(
        &self,
        x: &Tensor,
        context: Option<&Tensor>,
        context_mask: Option<&Tensor>,
        global_cond: Option<&Tensor>,
        mask: Option<&Tensor>,
        rope: Option<&(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let modulation = match (&self.to_scale_shift_gate, global_cond) {
            (Some(linear), Some(g)) => {
                let params = linear.forward(&g.silu()?)?.unsqueeze(1)?;
                Some(params.chunk(6, D::Minus1)?)
            }
            _ => None,
        };

        let x = match &modulation {
            Some(m) => {
                let (scale_self, shift_self, gate_self) = (&m[0], &m[1], &m[2]);
                let residual = x;
                let h = self.pre_norm.forward(x)?;
                let h = h
                    .broadcast_mul(&(scale_self + 1.0)?)?
                    .broadcast_add(shift_self)?;
                let h = self.self_attn.forward(&h, None, mask, None, rope)?;
                let gate = sigmoid(&gate_self.affine(-1.0, 1.0)?)?;
                (h.broadcast_mul(&gate)? + residual)?
            }
            None => {
                let h = self.pre_norm.forward(x)?;
                (x + self.self_attn.forward(&h, None, mask, None, rope)?)?
            }
        };

        let x = match (&self.cross, context) {
            (Some((norm, attn)), Some(ctx)) => {
                let h = norm.forward(&x)?;
                (&x + attn.forward(&h, Some(ctx), None, context_mask, None)?)?
            }
            _ => x,
        };

        match &modulation {
            Some(m) => {
                let (scale_ff, shift_ff, gate_ff) = (&m[3], &m[4], &m[5]);
                let h = self.ff_norm.forward(&x)?;
                let h = h.broadcast_mul(&(scale_ff + 1.0)?)?.broadcast_add(shift_ff)?;
                let h = self.ff.forward(&h)?;
                let gate = sigmoid(&gate_ff.affine(-1.0, 1.0)?)?;
                Ok((h.broadcast_mul(&gate)? + x)?)
            }
            None => {
                let h = self.ff_norm.forward(&x)?;
                Ok((&x + self.ff.forward(&h)?)?)
            }
        }
    }
}

fn sigmoid(x: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::sigmoid(x)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::transformer::rope::RotaryEmbedding;
    use candle_core::{DType, Device};

    #[test]
    fn layer_norm_normalizes() {
        let dev = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let norm = LayerNorm::new(4, vb).unwrap();
        varmap
            .data()
            .lock()
            .unwrap()
            .get("gamma")
            .unwrap()
            .set(&Tensor::ones(4, DType::F32, &dev).unwrap())
            .unwrap();

        let x = Tensor::new(&[[1f32, 2.0, 3.0, 4.0]], &dev).unwrap();
        let y: Vec<f32> = norm.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let mean: f32 = y.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!(y[0] < 0.0 && y[3] > 0.0);
    }

    #[test]
    fn conv_mlp_hidden_rounds_to_256() {
        assert_eq!(ConvMlp::hidden_width(64 * 4), 256);
        assert_eq!(ConvMlp::hidden_width(768 * 4), 2048);
        assert_eq!(ConvMlp::hidden_width(1024 * 4), 2816);
    }

    #[test]
    fn conv_mlp_keeps_channel_last_shape() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let mlp = ConvMlp::new(16, 64, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 10, 16), &dev).unwrap();
        assert_eq!(mlp.forward(&x).unwrap().dims(), &[2, 10, 16]);
    }

    #[test]
    fn block_shape_with_cross_attention() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let block = TransformerBlock::new(32, 16, 4.0, Some(24), None, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 8, 32), &dev).unwrap();
        let ctx = Tensor::randn(0f32, 1.0, (2, 5, 24), &dev).unwrap();
        let rope = RotaryEmbedding::for_head_dim(16)
            .compute_freqs(8, DType::F32, &dev)
            .unwrap();
        let y = block
            .forward(&x, Some(&ctx), None, None, None, Some(&rope))
            .unwrap();
        assert_eq!(y.dims(), &[2, 8, 32]);
    }

    #[test]
    fn adaln_block_with_zero_weights_is_identity() {
        // Zero projections make every branch output zero, leaving the residual.
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let block = TransformerBlock::new(32, 16, 4.0, None, Some(32), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 6, 32), &dev).unwrap();
        let g = Tensor::randn(0f32, 1.0, (1, 32), &dev).unwrap();
        let y = block.forward(&x, None, None, Some(&g), None, None).unwrap();
        let diff: f32 = (y - &x)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6, "diff = {diff}");
    }
}
