//! Multi-head attention for the diffusion transformer backbone.
//!
//! One type covers both uses:
//! - self-attention: fused `to_qkv`, rotary positions on q/k
//! - cross-attention: `to_q` from the sequence, fused `to_kv` from the context
//!
//! All projections are bias-free. Masks are `[B, S]` with 1 = attend.

use candle_core::{DType, Module, Tensor};
use candle_nn::VarBuilder;

use super::rope::RotaryEmbedding;
use crate::Result;

enum Projection {
    SelfAttention { to_qkv: candle_nn::Linear },
    CrossAttention { to_q: candle_nn::Linear, to_kv: candle_nn::Linear },
}

/// Scaled dot-product attention.
pub struct Attention {
    projection: Projection,
    to_out: candle_nn::Linear,
    num_heads: usize,
    kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    /// Self-attention over `dim`-wide tokens.
    pub fn self_attention(vb: VarBuilder, dim: usize, dim_heads: usize) -> Result<Self> {
        let to_qkv = candle_nn::linear_no_bias(dim, dim * 3, vb.pp("to_qkv"))?;
        let to_out = candle_nn::linear_no_bias(dim, dim, vb.pp("to_out"))?;
        Ok(Self {
            projection: Projection::SelfAttention { to_qkv },
            to_out,
            num_heads: dim / dim_heads,
            kv_heads: dim / dim_heads,
            head_dim: dim_heads,
        })
    }

    /// Cross-attention from `dim`-wide tokens to `dim_context`-wide context.
    pub fn cross_attention(
        vb: VarBuilder,
        dim: usize,
        dim_context: usize,
        dim_heads: usize,
    ) -> Result<Self> {
        let to_q = candle_nn::linear_no_bias(dim, dim, vb.pp("to_q"))?;
        let to_kv = candle_nn::linear_no_bias(dim_context, dim_context * 2, vb.pp("to_kv"))?;
        let to_out = candle_nn::linear_no_bias(dim, dim, vb.pp("to_out"))?;
        Ok(Self {
            projection: Projection::CrossAttention { to_q, to_kv },
            to_out,
            num_heads: dim / dim_heads,
            kv_heads: dim_context / dim_heads,
            head_dim: dim_heads,
        })
    }

    fn split_heads(&self, x: &Tensor, heads: usize) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;
        Ok(x
            .reshape((batch, seq, heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, S, dim]`
    /// - `context`: `[B, S_ctx, dim_context]` (cross-attention only)
    /// - `mask`: `[B, S]` sequence mask; keys are masked by it in self-attention
    ///   and masked query rows are zeroed on output
    /// - `context_mask`: `[B, S_ctx]` key mask for cross-attention
    /// - `rope`: `(cos, sin)` `[S, R]`, applied in self-attention only
    ///
    /// Returns `[B, S, dim]`.
    pub fn forward(
        &self,
        x: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        context_mask: Option<&Tensor>,
        rope: Option<&(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;

        let (q, k, v) = match (&self.projection, context) {
            (Projection::SelfAttention { to_qkv }, _) => {
                let qkv = to_qkv.forward(x)?.chunk(3, candle_core::D::Minus1)?;
                let q = self.split_heads(&qkv[0], self.num_heads)?;
                let k = self.split_heads(&qkv[1], self.num_heads)?;
                let v = self.split_heads(&qkv[2], self.num_heads)?;
                match rope {
                    Some((cos, sin)) => (
                        RotaryEmbedding::apply(&q, cos, sin)?,
                        RotaryEmbedding::apply(&k, cos, sin)?,
                        v,
                    ),
                    None => (q, k, v),
                }
            }
            (Projection::CrossAttention { to_q, to_kv }, Some(context)) => {
                let q = self.split_heads(&to_q.forward(x)?, self.num_heads)?;
                let kv = to_kv.forward(context)?.chunk(2, candle_core::D::Minus1)?;
                let k = self.split_heads(&kv[0], self.kv_heads)?;
                let v = self.split_heads(&kv[1], self.kv_heads)?;
                (q, k, v)
            }
            (Projection::CrossAttention { .. }, None) => {
                return Err(crate::Error::Invariant(
                    "cross-attention called without context".into(),
                ));
            }
        };

        // Grouped heads: repeat each kv head to cover its query heads.
        let (k, v) = if self.kv_heads != self.num_heads {
            let repeat = self.num_heads / self.kv_heads;
            (repeat_kv(&k, repeat)?, repeat_kv(&v, repeat)?)
        } else {
            (k, v)
        };

        let key_mask = match &self.projection {
            Projection::SelfAttention { .. } => mask,
            Projection::CrossAttention { .. } => context_mask,
        };

        let scale = (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / scale)?;

        let attn_weights = match key_mask {
            Some(key_mask) => {
                // key_mask: [B, S_k] → additive bias [B, 1, 1, S_k]
                let bias = mask_bias(key_mask, attn_weights.dtype())?;
                attn_weights.broadcast_add(&bias.unsqueeze(1)?.unsqueeze(1)?)?
            }
            None => attn_weights,
        };

        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let out = attn_weights.matmul(&v)?; // [B, H, S, D]

        let out = out
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        let out = self.to_out.forward(&out)?;

        match mask {
            Some(mask) => {
                let keep = mask.to_dtype(out.dtype())?.unsqueeze(2)?;
                Ok(out.broadcast_mul(&keep)?)
            }
            None => Ok(out),
        }
    }
}

fn repeat_kv(x: &Tensor, repeat: usize) -> Result<Tensor> {
    let (b, h, s, d) = x.dims4()?;
    Ok(x
        .unsqueeze(2)?
        .expand((b, h, repeat, s, d))?
        .reshape((b, h * repeat, s, d))?)
}

/// Additive attention bias from a `{0,1}` mask: 0 where attended, dtype minimum elsewhere.
pub fn mask_bias(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let min = match dtype {
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    };
    // (1 - mask) * min
    let inverted = mask.to_dtype(DType::F32)?.affine(-1.0, 1.0)?;
    Ok((inverted * min)?.to_dtype(dtype)?)
}
