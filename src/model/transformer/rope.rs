//! Rotary position embedding (RoPE) with partial rotation.
//!
//! The rotary dimension is `max(dim_heads / 2, 32)`, capped at `dim_heads`,
//! with `theta = 10_000`, so only the leading part of each head is rotated;
//! the remaining channels pass through unchanged (GPT-J style).
//!
//! Applied to self-attention queries and keys only; cross-attention keys come
//! from conditioning tokens and carry no positions.

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// Pre-computed rotary embedding tables.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    rot_dim: usize,
    theta: f64,
}

impl RotaryEmbedding {
    pub fn new(rot_dim: usize, theta: f64) -> Self {
        Self { rot_dim, theta }
    }

    /// Rotary embedding sized for a head width, `max(dim_heads / 2, 32)` capped at `dim_heads`.
    pub fn for_head_dim(dim_heads: usize) -> Self {
        Self::new((dim_heads / 2).max(32).min(dim_heads & !1), 10_000.0)
    }

    pub fn rot_dim(&self) -> usize {
        self.rot_dim
    }

    /// Compute cos and sin tables for positions `0..seq_len`.
    ///
    /// Returns `(cos, sin)` each of shape `[seq_len, rot_dim]`.
    pub fn compute_freqs(
        &self,
        seq_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        let half_dim = self.rot_dim / 2;

        // inv_freq = 1 / (theta ^ (2i / rot_dim)) for i in 0..half_dim
        let inv_freq: Vec<f64> = (0..half_dim)
            .map(|i| 1.0 / self.theta.powf(2.0 * i as f64 / self.rot_dim as f64))
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let positions: Vec<f64> = (0..seq_len).map(|i| i as f64).collect();
        let positions = Tensor::from_vec(positions, (seq_len, 1), device)?;

        // freqs = outer(positions, inv_freq) → [seq_len, half_dim]
        let freqs = positions.matmul(&inv_freq)?;

        // Duplicate: [freqs, freqs] → [seq_len, rot_dim]
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;

        let cos = freqs.cos()?.to_dtype(dtype)?;
        let sin = freqs.sin()?.to_dtype(dtype)?;

        Ok((cos, sin))
    }

    /// Apply rotary embedding to a tensor `x` of shape `[B, H, S, D]`.
    ///
    /// `cos` and `sin` have shape `[S, R]` with `R <= D`; channels `R..D`
    /// are left untouched.
    pub fn apply(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let head_dim = x.dim(candle_core::D::Minus1)?;
        let rot_dim = cos.dim(candle_core::D::Minus1)?;
        if rot_dim > head_dim {
            return Err(Error::Invariant(format!(
                "rotary tables are {rot_dim} wide but heads are {head_dim} wide"
            )));
        }

        // Rotation in f32 regardless of activation dtype.
        let x = x.to_dtype(DType::F32)?;
        let cos = cos.to_dtype(DType::F32)?;
        let sin = sin.to_dtype(DType::F32)?;

        let x_rot = x.narrow(candle_core::D::Minus1, 0, rot_dim)?;

        // rotate_half: [-x[..., R/2:], x[..., :R/2]]
        let half = rot_dim / 2;
        let x_first = x_rot.narrow(candle_core::D::Minus1, 0, half)?;
        let x_second = x_rot.narrow(candle_core::D::Minus1, half, half)?;
        let x_rotated = Tensor::cat(&[&x_second.neg()?, &x_first], candle_core::D::Minus1)?;

        // cos/sin are [S, R], broadcast to [1, 1, S, R]
        let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
        let sin = sin.unsqueeze(0)?.unsqueeze(0)?;
        let rotated = (x_rot.broadcast_mul(&cos)? + x_rotated.broadcast_mul(&sin)?)?;

        let result = if rot_dim < head_dim {
            let passthrough = x.narrow(candle_core::D::Minus1, rot_dim, head_dim - rot_dim)?;
            Tensor::cat(&[&rotated, &passthrough], candle_core::D::Minus1)?
        } else {
            rotated
        };
        result.to_dtype(x_dtype).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn rotary_dim_has_floor_of_32() {
        assert_eq!(RotaryEmbedding::for_head_dim(48).rot_dim(), 32);
        assert_eq!(RotaryEmbedding::for_head_dim(128).rot_dim(), 64);
    }

    #[test]
    fn rotary_dim_never_exceeds_head() {
        assert_eq!(RotaryEmbedding::for_head_dim(16).rot_dim(), 16);
        assert_eq!(RotaryEmbedding::for_head_dim(32).rot_dim(), 32);

        let device = Device::Cpu;
        let x = Tensor::randn(0.0_f32, 1.0, (1, 1, 4, 16), &device).unwrap();
        let (cos, sin) = RotaryEmbedding::new(32, 10_000.0)
            .compute_freqs(4, DType::F32, &device)
            .unwrap();
        assert!(matches!(
            RotaryEmbedding::apply(&x, &cos, &sin),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn freqs_shape() {
        let rope = RotaryEmbedding::new(32, 10_000.0);
        let (cos, sin) = rope.compute_freqs(100, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(cos.dims(), &[100, 32]);
        assert_eq!(sin.dims(), &[100, 32]);
    }

    #[test]
    fn apply_preserves_shape_and_passthrough() {
        let rope = RotaryEmbedding::new(32, 10_000.0);
        let device = Device::Cpu;

        let x = Tensor::randn(0.0_f32, 1.0, (1, 2, 10, 64), &device).unwrap();
        let (cos, sin) = rope.compute_freqs(10, DType::F32, &device).unwrap();

        let result = RotaryEmbedding::apply(&x, &cos, &sin).unwrap();
        assert_eq!(result.dims(), x.dims());

        // Channels past the rotary dimension are untouched.
        let tail_diff: f32 = (result.narrow(3, 32, 32).unwrap() - x.narrow(3, 32, 32).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(tail_diff < 1e-6, "unrotated channels changed by {tail_diff}");
    }

    #[test]
    fn apply_preserves_norm_approximately() {
        let rope = RotaryEmbedding::new(32, 10_000.0);
        let device = Device::Cpu;

        let x = Tensor::randn(0.0_f32, 1.0, (1, 4, 32, 32), &device).unwrap();
        let (cos, sin) = rope.compute_freqs(32, DType::F32, &device).unwrap();

        let result = RotaryEmbedding::apply(&x, &cos, &sin).unwrap();

        // Rotation preserves the L2 norm.
        let x_norm: f32 = x.sqr().unwrap().mean_all().unwrap().to_scalar().unwrap();
        let r_norm: f32 = result
            .sqr()
            .unwrap()
            .mean_all()
            .unwrap()
            .to_scalar()
            .unwrap();

        assert!(
            (x_norm - r_norm).abs() < 0.01,
            "RoPE should preserve norm: {x_norm} vs {r_norm}"
        );
    }
}
