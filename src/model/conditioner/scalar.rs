//! Integer and float conditioners (e.g. `seconds_start`, `seconds_total`).

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};

use super::ConditionerOutput;
use super::config::{IntOptions, NumberOptions};
use super::value::{ConditionValue, floats, ints};
use crate::Result;

/// Learned lookup of clamped integers, `[B] → [B, 1, output_dim]`.
pub struct IntConditioner {
    embedder: Embedding,
    min_val: i64,
    max_val: i64,
}

impl IntConditioner {
    pub fn new(opts: &IntOptions, vb: VarBuilder) -> Result<Self> {
        let rows = (opts.max_val - opts.min_val + 1) as usize;
        Ok(Self {
            embedder: candle_nn::embedding(rows, opts.output_dim, vb.pp("int_embedder"))?,
            min_val: opts.min_val,
            max_val: opts.max_val,
        })
    }

    pub fn forward(&self, inputs: &[ConditionValue], device: &Device) -> Result<ConditionerOutput> {
        let ids: Vec<u32> = ints(inputs)?
            .into_iter()
            .map(|i| (i.clamp(self.min_val, self.max_val) - self.min_val) as u32)
            .collect();
        let batch = ids.len();
        let ids = Tensor::from_vec(ids, batch, device)?;
        let embeds = self.embedder.forward(&ids)?.unsqueeze(1)?;
        Ok(ConditionerOutput::Paired(
            embeds,
            Tensor::ones((batch, 1), DType::F32, device)?,
        ))
    }
}

/// Width of the learned Fourier basis in [`NumberEmbedder`].
const NUMBER_FEATURES: usize = 256;

/// `x → [x, sin(2πxw), cos(2πxw)] → Linear(257, out)`.
pub struct NumberEmbedder {
    weights: Tensor, // [128]
    linear: Linear,
}

impl NumberEmbedder {
    pub fn new(out_features: usize, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("embedding");
        Ok(Self {
            weights: vb.pp("0").get(NUMBER_FEATURES / 2, "weights")?,
            linear: candle_nn::linear(NUMBER_FEATURES + 1, out_features, vb.pp("1"))?,
        })
    }

    /// `x`: `[B]` → `[B, out_features]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.to_dtype(self.weights.dtype())?.unsqueeze(1)?;
        let freqs = (x.broadcast_mul(&self.weights.unsqueeze(0)?)? * (2.0 * std::f64::consts::PI))?;
        let features = Tensor::cat(&[&x, &freqs.sin()?, &freqs.cos()?], 1)?;
        Ok(self.linear.forward(&features)?)
    }
}

/// Floats clamped to `[min_val, max_val]`, normalised to `[0, 1]`, then embedded.
pub struct NumberConditioner {
    embedder: NumberEmbedder,
    min_val: f64,
    max_val: f64,
}

impl NumberConditioner {
    pub fn new(opts: &NumberOptions, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            embedder: NumberEmbedder::new(opts.output_dim, vb.pp("embedder"))?,
            min_val: opts.min_val,
            max_val: opts.max_val,
        })
    }

    pub fn normalize(&self, x: f64) -> f64 {
        (x.clamp(self.min_val, self.max_val) - self.min_val) / (self.max_val - self.min_val)
    }

    pub fn forward(&self, inputs: &[ConditionValue], device: &Device) -> Result<ConditionerOutput> {
        let values: Vec<f32> = floats(inputs)?
            .into_iter()
            .map(|x| self.normalize(x) as f32)
            .collect();
        let batch = values.len();
        let x = Tensor::from_vec(values, batch, device)?;
        let embeds = self.embedder.forward(&x)?.unsqueeze(1)?;
        Ok(ConditionerOutput::Paired(
            embeds,
            Tensor::ones((batch, 1), DType::F32, device)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn ints_are_clamped_into_table() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let opts = IntOptions {
            output_dim: 4,
            min_val: 0,
            max_val: 10,
        };
        let cond = IntConditioner::new(&opts, vb).unwrap();
        let table = Tensor::arange(0f32, 44.0, &Device::Cpu)
            .unwrap()
            .reshape((11, 4))
            .unwrap();
        varmap
            .data()
            .lock()
            .unwrap()
            .get("int_embedder.weight")
            .unwrap()
            .set(&table)
            .unwrap();

        let inputs = [ConditionValue::Int(-3), ConditionValue::Int(99)];
        let ConditionerOutput::Paired(embeds, mask) = cond.forward(&inputs, &Device::Cpu).unwrap()
        else {
            panic!("expected a pair");
        };
        assert_eq!(embeds.dims(), &[2, 1, 4]);
        assert_eq!(mask.dims(), &[2, 1]);
        let rows: Vec<f32> = embeds.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(rows[0], 0.0, "clamped to the first row");
        assert_eq!(rows[4], 40.0, "clamped to the last row");
    }

    #[test]
    fn numbers_normalize_into_unit_range() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let opts = NumberOptions {
            output_dim: 8,
            min_val: 0.0,
            max_val: 512.0,
        };
        let cond = NumberConditioner::new(&opts, vb).unwrap();
        assert_eq!(cond.normalize(256.0), 0.5);
        assert_eq!(cond.normalize(-1.0), 0.0);
        assert_eq!(cond.normalize(1000.0), 1.0);

        let inputs = [ConditionValue::Float(8.0), ConditionValue::Int(10)];
        let ConditionerOutput::Paired(embeds, _) = cond.forward(&inputs, &Device::Cpu).unwrap()
        else {
            panic!("expected a pair");
        };
        assert_eq!(embeds.dims(), &[2, 1, 8]);
    }

    #[test]
    fn number_embedder_feature_layout() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let embedder = NumberEmbedder::new(257, vb).unwrap();
        {
            let data = varmap.data().lock().unwrap();
            data.get("embedding.0.weights")
                .unwrap()
                .set(&Tensor::zeros(128, DType::F32, &Device::Cpu).unwrap())
                .unwrap();
            data.get("embedding.1.weight")
                .unwrap()
                .set(&Tensor::eye(257, DType::F32, &Device::Cpu).unwrap())
                .unwrap();
            data.get("embedding.1.bias")
                .unwrap()
                .set(&Tensor::zeros(257, DType::F32, &Device::Cpu).unwrap())
                .unwrap();
        }
        let x = Tensor::new(&[0.25f32], &Device::Cpu).unwrap();
        let out: Vec<f32> = embedder.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        // Zero frequencies: [x, sin 0 ..., cos 0 ...]
        assert_eq!(out[0], 0.25);
        assert_eq!(out[1], 0.0);
        assert_eq!(out[129], 1.0);
    }
}
