//! Fourier-feature timestep embedding.
//!
//! Maps the scalar diffusion time to a learned random-Fourier basis and then
//! through a two-layer MLP:
//!
//! ```text
//! t [B] → f = 2π · t · Wᵀ  (W: [128, 1])
//!       → [cos f, sin f]   [B, 256]
//!       → Linear → SiLU → Linear   [B, embed_dim]
//! ```

use candle_core::{DType, Result, Tensor};
use candle_nn::{self as nn, VarBuilder};

/// Width of the Fourier feature vector.
pub const TIMESTEP_FEATURES_DIM: usize = 256;

/// Learned random Fourier features.
#[derive(Debug, Clone)]
pub struct FourierFeatures {
    weight: Tensor, // [out_features / 2, in_features]
}

impl FourierFeatures {
    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get((out_features / 2, in_features), "weight")?;
        Ok(Self { weight })
    }

    /// `input`: [B, in_features] → [B, out_features].
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let input = input.to_dtype(self.weight.dtype())?;
        let f = (input.matmul(&self.weight.t()?)? * (2.0 * std::f64::consts::PI))?;
        Tensor::cat(&[&f.cos()?, &f.sin()?], 1)
    }
}

/// Timestep features + `to_timestep_embed` MLP.
#[derive(Debug, Clone)]
pub struct TimestepEmbedding {
    features: FourierFeatures,
    linear_1: nn::Linear,
    linear_2: nn::Linear,
}

impl TimestepEmbedding {
    /// `vb` is the DiT root: weights live at `timestep_features.*` and
    /// `to_timestep_embed.{0,2}.*`.
    pub fn new(embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        let features = FourierFeatures::new(1, TIMESTEP_FEATURES_DIM, vb.pp("timestep_features"))?;
        let linear_1 = nn::linear(
            TIMESTEP_FEATURES_DIM,
            embed_dim,
            vb.pp("to_timestep_embed.0"),
        )?;
        let linear_2 = nn::linear(embed_dim, embed_dim, vb.pp("to_timestep_embed.2"))?;
        Ok(Self {
            features,
            linear_1,
            linear_2,
        })
    }

    /// Forward pass: t [B] → [B, embed_dim] in `dtype`.
    pub fn forward(&self, t: &Tensor, dtype: DType) -> Result<Tensor> {
        let t = t.to_dtype(DType::F32)?.unsqueeze(1)?;
        let features = self.features.forward(&t)?.to_dtype(dtype)?;
        features
            .apply(&self.linear_1)?
            .silu()?
            .apply(&self.linear_2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_timestep_embedding_shape() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let te = TimestepEmbedding::new(32, vb).unwrap();
        let t = Tensor::new(&[0.5f32, 0.8], &dev).unwrap();
        let temb = te.forward(&t, DType::F32).unwrap();
        assert_eq!(temb.dims(), &[2, 32]);
    }

    #[test]
    fn fourier_features_are_cos_then_sin() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let ff = FourierFeatures::new(1, 4, vb).unwrap();
        // Overwrite the random init with known frequencies.
        varmap
            .data()
            .lock()
            .unwrap()
            .get("weight")
            .unwrap()
            .set(&Tensor::new(&[[0.25f32], [0.5]], &dev).unwrap())
            .unwrap();

        let t = Tensor::new(&[[1.0f32]], &dev).unwrap();
        let out: Vec<f32> = ff.forward(&t).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let pi = std::f32::consts::PI;
        let expected = [(0.5 * pi).cos(), pi.cos(), (0.5 * pi).sin(), pi.sin()];
        for (a, b) in out.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5, "got {out:?}, expected {expected:?}");
        }
    }

    #[test]
    fn embedding_varies_with_timestep() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let ff = FourierFeatures::new(1, 256, vb).unwrap();
        let weight = Tensor::randn(0f32, 1.0, (128, 1), &dev).unwrap();
        varmap.data().lock().unwrap().get("weight").unwrap().set(&weight).unwrap();

        let t1 = Tensor::new(&[[0.1f32]], &dev).unwrap();
        let t2 = Tensor::new(&[[0.9f32]], &dev).unwrap();
        let diff = (ff.forward(&t1).unwrap() - ff.forward(&t2).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff > 0.1, "embeddings should differ, diff = {diff}");
    }
}
