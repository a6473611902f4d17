//! Conditional diffusion transformer (DiT).
//!
//! ```text
//! x [B, C, T], t [B]
//!   ├─ cross_attn_cond → to_cond_embed (Linear → SiLU → Linear)
//!   ├─ global_cond     → to_global_embed (max-pooled over tokens if 3-D)
//!   ├─ prepend_cond    → to_prepend_embed
//!   ├─ input_concat    → nearest-exact resample, concat on channels
//!   ├─ add_cond        → [SiLU → ConvMLP] → linear resample to T/p
//!   └─ t → Fourier features → MLP, summed into the global embedding
//!
//! x = preprocess_conv(x) + x → [B, T/p, C·p] → backbone → drop prepend → [B, C, T]
//! out = postprocess_conv(out) + out
//! ```
//!
//! The global embedding becomes one prepended token (`prepend`) or modulates
//! every block (`adaLN`). [`DiffusionTransformer::forward`] wraps the single
//! pass with classifier-free guidance.

pub mod attention;
pub mod backbone;
pub mod config;
pub mod layers;
pub mod rope;
pub mod timestep;

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Conv1d, Linear, VarBuilder};

use crate::{Error, Result};
use backbone::{BackboneConfig, BackboneInputs, ContinuousTransformer};
use config::{DiTConfig, GlobalCondType, TransformerType};
use layers::ConvMlp;
use timestep::TimestepEmbedding;

/// Conditioning tensors for one denoiser call.
///
/// - `cross_attn_cond`: `[B, S, cond_token_dim]`, mask `[B, S]`
/// - `global_cond`: `[B, global_cond_dim]` or `[B, S, global_cond_dim]`
/// - `input_concat_cond`: `[B, input_concat_dim, T']`
/// - `prepend_cond`: `[B, S, prepend_cond_dim]`, mask `[B, S]`
/// - `add_cond`: `[B, T', add_token_dim]` (channel-last)
#[derive(Debug, Clone, Default)]
pub struct DiffusionConditioning {
    pub cross_attn_cond: Option<Tensor>,
    pub cross_attn_mask: Option<Tensor>,
    pub global_cond: Option<Tensor>,
    pub input_concat_cond: Option<Tensor>,
    pub prepend_cond: Option<Tensor>,
    pub prepend_cond_mask: Option<Tensor>,
    pub add_cond: Option<Tensor>,
}

/// Negative-prompt conditioning used in place of zeros for the unconditioned half.
#[derive(Debug, Clone, Default)]
pub struct NegativeConditioning {
    pub cross_attn_cond: Option<Tensor>,
    pub cross_attn_mask: Option<Tensor>,
    pub global_cond: Option<Tensor>,
    pub input_concat_cond: Option<Tensor>,
}

impl NegativeConditioning {
    pub fn is_empty(&self) -> bool {
        self.cross_attn_cond.is_none()
            && self.global_cond.is_none()
            && self.input_concat_cond.is_none()
    }
}

/// Guidance settings for [`DiffusionTransformer::forward`].
#[derive(Debug, Clone)]
pub struct GuidanceParams {
    pub cfg_scale: f64,
    /// Per-example probability of zeroing each conditioning modality.
    pub cfg_dropout_prob: f64,
    /// Guidance rescale blend; 0 disables it.
    pub scale_phi: f64,
    pub causal: bool,
    /// Sequence mask `[B, T]`.
    pub mask: Option<Tensor>,
}

impl Default for GuidanceParams {
    fn default() -> Self {
        Self {
            cfg_scale: 1.0,
            cfg_dropout_prob: 0.0,
            scale_phi: 0.0,
            causal: false,
            mask: None,
        }
    }
}

/// `Linear → SiLU → Linear` without biases.
#[derive(Debug, Clone)]
struct ProjectionMlp {
    linear_1: Linear,
    linear_2: Linear,
}

impl ProjectionMlp {
    fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear_1: candle_nn::linear_no_bias(in_dim, out_dim, vb.pp("0"))?,
            linear_2: candle_nn::linear_no_bias(out_dim, out_dim, vb.pp("2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.linear_1.forward(x)?.silu()?.apply(&self.linear_2)?)
    }
}

pub struct DiffusionTransformer {
    config: DiTConfig,
    timestep: TimestepEmbedding,
    to_cond_embed: Option<ProjectionMlp>,
    to_global_embed: Option<ProjectionMlp>,
    to_prepend_embed: Option<ProjectionMlp>,
    to_add_embed: Option<ConvMlp>,
    preprocess_conv: Conv1d,
    postprocess_conv: Conv1d,
    transformer: ContinuousTransformer,
    dtype: DType,
}

impl DiffusionTransformer {
    /// Load from a VarBuilder rooted at the DiT's own prefix.
    pub fn new(config: &DiTConfig, vb: VarBuilder) -> Result<Self> {
        if config.transformer_type == TransformerType::MmTransformer {
            return Err(Error::Config(
                "transformer_type mm_transformer is not supported".into(),
            ));
        }
        if config.num_heads == 0 || config.embed_dim % config.num_heads != 0 {
            return Err(Error::Config(format!(
                "embed_dim {} is not divisible by num_heads {}",
                config.embed_dim, config.num_heads
            )));
        }
        if config.patch_size == 0 {
            return Err(Error::Config("patch_size must be at least 1".into()));
        }

        let to_cond_embed = (config.cond_token_dim > 0)
            .then(|| {
                ProjectionMlp::new(
                    config.cond_token_dim,
                    config.cond_embed_dim(),
                    vb.pp("to_cond_embed"),
                )
            })
            .transpose()?;
        let to_global_embed = (config.global_cond_dim > 0)
            .then(|| {
                ProjectionMlp::new(
                    config.global_cond_dim,
                    config.global_embed_dim(),
                    vb.pp("to_global_embed"),
                )
            })
            .transpose()?;
        let to_prepend_embed = (config.prepend_cond_dim > 0)
            .then(|| {
                ProjectionMlp::new(
                    config.prepend_cond_dim,
                    config.embed_dim,
                    vb.pp("to_prepend_embed"),
                )
            })
            .transpose()?;
        let to_add_embed = (config.add_token_dim > 0 && config.use_mlp)
            .then(|| {
                let dim = config.add_embed_dim();
                ConvMlp::new(dim, dim * 4, vb.pp("to_add_embed").pp("1"))
            })
            .transpose()?;

        let dim_in = config.dim_in();
        let preprocess_conv =
            candle_nn::conv1d_no_bias(dim_in, dim_in, 1, Default::default(), vb.pp("preprocess_conv"))?;
        let postprocess_conv = candle_nn::conv1d_no_bias(
            config.io_channels,
            config.io_channels,
            1,
            Default::default(),
            vb.pp("postprocess_conv"),
        )?;

        let backbone_cfg = BackboneConfig {
            dim: config.embed_dim,
            depth: config.depth,
            dim_heads: config.dim_heads(),
            dim_in: dim_in * config.patch_size,
            dim_out: config.io_channels * config.patch_size,
            ff_mult: config.ff_mult,
            cond_token_dim: (config.cond_token_dim > 0).then(|| config.cond_embed_dim()),
            global_cond_dim: (config.global_cond_type == GlobalCondType::AdaLn)
                .then_some(config.embed_dim),
        };
        let transformer = ContinuousTransformer::new(&backbone_cfg, vb.pp("transformer"))?;

        tracing::debug!(
            depth = config.depth,
            embed_dim = config.embed_dim,
            transformer_type = ?config.transformer_type,
            global_cond_type = ?config.global_cond_type,
            "built diffusion transformer"
        );

        Ok(Self {
            config: config.clone(),
            timestep: TimestepEmbedding::new(config.embed_dim, vb.clone())?,
            to_cond_embed,
            to_global_embed,
            to_prepend_embed,
            to_add_embed,
            preprocess_conv,
            postprocess_conv,
            transformer,
            dtype: vb.dtype(),
        })
    }

    pub fn config(&self) -> &DiTConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Single unguided denoiser pass.
    ///
    /// `x`: `[B, io_channels, T]`, `t`: `[B]`. Returns `[B, io_channels, T]`.
    pub fn forward_unguided(
        &self,
        x: &Tensor,
        t: &Tensor,
        cond: &DiffusionConditioning,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let dtype = self.dtype;
        let x = x.to_dtype(dtype)?;
        let (batch, _, length) = x.dims3()?;
        let device = x.device().clone();

        let cross_attn_cond = match (&cond.cross_attn_cond, &self.to_cond_embed) {
            (Some(c), Some(proj)) => Some(proj.forward(&c.to_dtype(dtype)?)?),
            (Some(c), None) => Some(c.to_dtype(dtype)?),
            (None, _) => None,
        };

        let global_embed = match (&cond.global_cond, &self.to_global_embed) {
            (Some(g), Some(proj)) => {
                let g = proj.forward(&g.to_dtype(dtype)?)?;
                Some(if g.rank() == 3 { g.max(1)? } else { g })
            }
            (Some(g), None) => Some(g.to_dtype(dtype)?),
            (None, _) => None,
        };

        let mut prepend_inputs = match (&cond.prepend_cond, &self.to_prepend_embed) {
            (Some(p), Some(proj)) => Some(proj.forward(&p.to_dtype(dtype)?)?),
            (Some(p), None) => Some(p.to_dtype(dtype)?),
            (None, _) => None,
        };
        let mut prepend_mask = prepend_inputs
            .as_ref()
            .and(cond.prepend_cond_mask.as_ref())
            .map(|m| m.to_dtype(DType::F32))
            .transpose()?;

        let x = match &cond.input_concat_cond {
            Some(c) => {
                let c = c.to_dtype(dtype)?;
                let c = if c.dim(2)? != length {
                    interpolate_nearest_exact(&c, length)?
                } else {
                    c
                };
                Tensor::cat(&[&x, &c], 1)?
            }
            None => x,
        };

        let add_cond = match &cond.add_cond {
            Some(a) => {
                let mut a = a.to_dtype(dtype)?;
                if let Some(mlp) = &self.to_add_embed {
                    a = mlp.forward(&a.silu()?)?;
                }
                let tokens = length / self.config.patch_size;
                if a.dim(1)? != tokens {
                    a = resample_linear(&a, tokens)?;
                }
                Some(a)
            }
            None => None,
        };

        let timestep_embed = self.timestep.forward(t, dtype)?;
        let global_embed = match global_embed {
            Some(g) => (g + timestep_embed)?,
            None => timestep_embed,
        };

        let mut prepend_length = 0;
        if self.config.global_cond_type == GlobalCondType::Prepend {
            let token = global_embed.unsqueeze(1)?;
            let ones = Tensor::ones((batch, 1), DType::F32, &device)?;
            match prepend_inputs.take() {
                None => {
                    prepend_inputs = Some(token);
                    prepend_mask = Some(ones);
                }
                Some(p) => {
                    let existing_mask = match prepend_mask.take() {
                        Some(m) => m,
                        None => Tensor::ones((batch, p.dim(1)?), DType::F32, &device)?,
                    };
                    prepend_inputs = Some(Tensor::cat(&[&p, &token], 1)?);
                    prepend_mask = Some(Tensor::cat(&[&existing_mask, &ones], 1)?);
                }
            }
            if let Some(p) = &prepend_inputs {
                prepend_length = p.dim(1)?;
            }
        } else if let Some(p) = &prepend_inputs {
            prepend_length = p.dim(1)?;
        }

        let x = (self.preprocess_conv.forward(&x)? + &x)?;
        let x = x.transpose(1, 2)?.contiguous()?;
        let x = patchify(&x, self.config.patch_size)?;

        let global_cond = (self.config.global_cond_type == GlobalCondType::AdaLn)
            .then_some(&global_embed);

        let inputs = BackboneInputs {
            prepend_embeds: prepend_inputs.as_ref(),
            prepend_mask: prepend_mask.as_ref(),
            context: cross_attn_cond.as_ref(),
            context_mask: cond.cross_attn_mask.as_ref(),
            add_cond: add_cond.as_ref(),
            global_cond,
            mask,
        };
        let output = self.transformer.forward(&x, &inputs)?;

        let output = output.transpose(1, 2)?;
        let tokens = output.dim(2)?;
        let output = output.narrow(2, prepend_length, tokens - prepend_length)?;
        let output = unpatchify(&output.contiguous()?, self.config.patch_size)?;

        Ok((self.postprocess_conv.forward(&output)? + &output)?)
    }

    /// Denoiser pass with classifier-free guidance.
    ///
    /// When `cfg_scale != 1` and any of cross-attention, prepend, or additive
    /// conditioning is present, the conditioned and unconditioned inputs run as
    /// one doubled batch and are combined as `uncond + (cond - uncond) · scale`.
    pub fn forward(
        &self,
        x: &Tensor,
        t: &Tensor,
        cond: &DiffusionConditioning,
        negative: Option<&NegativeConditioning>,
        guidance: &GuidanceParams,
    ) -> Result<Tensor> {
        if guidance.causal {
            return Err(Error::Invariant(
                "causal mode is not supported by the diffusion transformer".into(),
            ));
        }

        // Cross-attention masks are dropped before the backbone call.
        let mut cond = DiffusionConditioning {
            cross_attn_mask: None,
            ..cond.clone()
        };

        if guidance.cfg_dropout_prob > 0.0 {
            let p = guidance.cfg_dropout_prob;
            cond.cross_attn_cond = cond
                .cross_attn_cond
                .map(|c| dropout_examples(&c, p))
                .transpose()?;
            cond.prepend_cond = cond
                .prepend_cond
                .map(|c| dropout_examples(&c, p))
                .transpose()?;
            cond.add_cond = cond.add_cond.map(|c| dropout_examples(&c, p)).transpose()?;
        }

        let guided = guidance.cfg_scale != 1.0
            && (cond.cross_attn_cond.is_some()
                || cond.prepend_cond.is_some()
                || cond.add_cond.is_some());
        if !guided {
            return self.forward_unguided(x, t, &cond, guidance.mask.as_ref());
        }

        let double = |a: &Tensor| Tensor::cat(&[a, a], 0);
        let batch_x = double(x)?;
        let batch_t = double(t)?;

        let batch_cross = match &cond.cross_attn_cond {
            Some(c) => {
                let null = c.zeros_like()?;
                let uncond = match negative.and_then(|n| n.cross_attn_cond.as_ref()) {
                    Some(neg) => {
                        let neg = neg.to_dtype(c.dtype())?;
                        match negative.and_then(|n| n.cross_attn_mask.as_ref()) {
                            Some(neg_mask) => {
                                let keep = neg_mask
                                    .to_dtype(DType::U8)?
                                    .unsqueeze(2)?
                                    .broadcast_as(neg.shape())?;
                                keep.where_cond(&neg, &null)?
                            }
                            None => neg,
                        }
                    }
                    None => null,
                };
                Some(Tensor::cat(&[c, &uncond], 0)?)
            }
            None => None,
        };

        let batch_prepend = cond
            .prepend_cond
            .as_ref()
            .map(|p| Tensor::cat(&[p, &p.zeros_like()?], 0))
            .transpose()?;
        let batch_prepend_mask = match (&cond.prepend_cond, &cond.prepend_cond_mask) {
            (Some(_), Some(m)) => Some(double(m)?),
            _ => None,
        };
        let batch_add = cond
            .add_cond
            .as_ref()
            .map(|a| Tensor::cat(&[a, &a.zeros_like()?], 0))
            .transpose()?;

        let batch_cond = DiffusionConditioning {
            cross_attn_cond: batch_cross,
            cross_attn_mask: None,
            global_cond: cond.global_cond.as_ref().map(double).transpose()?,
            input_concat_cond: cond.input_concat_cond.as_ref().map(double).transpose()?,
            prepend_cond: batch_prepend,
            prepend_cond_mask: batch_prepend_mask,
            add_cond: batch_add,
        };
        let batch_mask = guidance.mask.as_ref().map(double).transpose()?;

        let batch_output =
            self.forward_unguided(&batch_x, &batch_t, &batch_cond, batch_mask.as_ref())?;
        let halves = batch_output.chunk(2, 0)?;
        let (cond_output, uncond_output) = (&halves[0], &halves[1]);
        combine_guidance(cond_output, uncond_output, guidance.cfg_scale, guidance.scale_phi)
    }
}

/// `uncond + (cond - uncond) · scale`, blended with its channel-std rescale when `scale_phi != 0`.
fn combine_guidance(
    cond_output: &Tensor,
    uncond_output: &Tensor,
    cfg_scale: f64,
    scale_phi: f64,
) -> Result<Tensor> {
    let cfg_output = (uncond_output + ((cond_output - uncond_output)? * cfg_scale)?)?;
    if scale_phi == 0.0 {
        return Ok(cfg_output);
    }
    let cond_std = std_keepdim(cond_output, 1)?;
    let cfg_std = std_keepdim(&cfg_output, 1)?;
    let rescaled = cfg_output.broadcast_mul(&cond_std.broadcast_div(&cfg_std)?)?;
    Ok(((rescaled * scale_phi)? + (cfg_output * (1.0 - scale_phi))?)?)
}

/// `[B, T, C]` → `[B, T/p, C·p]` (`b (t p) c -> b t (c p)`).
fn patchify(x: &Tensor, patch: usize) -> Result<Tensor> {
    if patch == 1 {
        return Ok(x.clone());
    }
    let (b, t, c) = x.dims3()?;
    if t % patch != 0 {
        return Err(Error::Invariant(format!(
            "sequence length {t} is not a multiple of patch size {patch}"
        )));
    }
    Ok(x
        .reshape((b, t / patch, patch, c))?
        .transpose(2, 3)?
        .contiguous()?
        .reshape((b, t / patch, c * patch))?)
}

/// `[B, C·p, T/p]` → `[B, C, T]` (`b (c p) t -> b c (t p)`).
fn unpatchify(x: &Tensor, patch: usize) -> Result<Tensor> {
    if patch == 1 {
        return Ok(x.clone());
    }
    let (b, cp, t) = x.dims3()?;
    let c = cp / patch;
    Ok(x
        .reshape((b, c, patch, t))?
        .transpose(2, 3)?
        .contiguous()?
        .reshape((b, c, t * patch))?)
}

/// Nearest-exact resize of the last axis: source index `floor((i + 0.5) · in / out)`.
fn interpolate_nearest_exact(x: &Tensor, out_len: usize) -> Result<Tensor> {
    let in_len = x.dim(D::Minus1)?;
    if in_len == 0 {
        return Err(Error::Invariant("cannot resize an empty conditioning sequence".into()));
    }
    let scale = in_len as f64 / out_len as f64;
    let idx: Vec<u32> = (0..out_len)
        .map(|i| (((i as f64 + 0.5) * scale).floor() as usize).min(in_len - 1) as u32)
        .collect();
    let idx = Tensor::from_vec(idx, out_len, x.device())?;
    Ok(x.index_select(&idx, x.rank() - 1)?)
}

/// Linear resize of the time axis of `[B, T, C]` (half-pixel centres, edges clamped).
fn resample_linear(x: &Tensor, out_len: usize) -> Result<Tensor> {
    let in_len = x.dim(1)?;
    if in_len == 0 {
        return Err(Error::Invariant("cannot resample an empty conditioning sequence".into()));
    }
    let scale = in_len as f64 / out_len as f64;
    let mut lo = Vec::with_capacity(out_len);
    let mut hi = Vec::with_capacity(out_len);
    let mut frac = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src = ((i as f64 + 0.5) * scale - 0.5).max(0.0);
        let l = (src.floor() as usize).min(in_len - 1);
        lo.push(l as u32);
        hi.push((l + 1).min(in_len - 1) as u32);
        frac.push((src - l as f64).clamp(0.0, 1.0) as f32);
    }
    let device = x.device();
    let lo = x.index_select(&Tensor::from_vec(lo, out_len, device)?, 1)?;
    let hi = x.index_select(&Tensor::from_vec(hi, out_len, device)?, 1)?;
    let w = Tensor::from_vec(frac, (1, out_len, 1), device)?.to_dtype(x.dtype())?;
    // lo + (hi - lo) · w
    Ok(lo.broadcast_add(&(hi - &lo)?.broadcast_mul(&w)?)?)
}

/// Unbiased standard deviation over `dim`, keeping the axis.
fn std_keepdim(x: &Tensor, dim: usize) -> Result<Tensor> {
    let n = x.dim(dim)?;
    let x32 = x.to_dtype(DType::F32)?;
    let mean = x32.mean_keepdim(dim)?;
    let var = (x32.broadcast_sub(&mean)?.sqr()?.sum_keepdim(dim)? / (n.max(2) - 1) as f64)?;
    Ok(var.sqrt()?.to_dtype(x.dtype())?)
}

/// Zero whole examples with probability `p`.
fn dropout_examples(x: &Tensor, p: f64) -> Result<Tensor> {
    let batch = x.dim(0)?;
    let keep: Vec<f32> = (0..batch)
        .map(|_| if rand::random_bool(p) { 0.0 } else { 1.0 })
        .collect();
    let mut shape = vec![1usize; x.rank()];
    shape[0] = batch;
    let keep = Tensor::from_vec(keep, shape, x.device())?.to_dtype(x.dtype())?;
    Ok(x.broadcast_mul(&keep)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn small_config() -> DiTConfig {
        DiTConfig {
            io_channels: 4,
            embed_dim: 32,
            depth: 2,
            num_heads: 2,
            cond_token_dim: 8,
            global_cond_dim: 16,
            ff_mult: 2.0,
            transformer_type: TransformerType::ContinuousTransformer,
            global_cond_type: GlobalCondType::Prepend,
            ..DiTConfig::default()
        }
    }

    /// Random weights so every branch contributes.
    fn random_model(config: &DiTConfig) -> DiffusionTransformer {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = DiffusionTransformer::new(config, vb).unwrap();
        for var in varmap.all_vars() {
            let r = Tensor::randn(0f32, 0.2, var.shape(), &dev).unwrap();
            var.set(&r).unwrap();
        }
        model
    }

    fn conditioning(batch: usize) -> DiffusionConditioning {
        let dev = Device::Cpu;
        DiffusionConditioning {
            cross_attn_cond: Some(Tensor::randn(0f32, 1.0, (batch, 3, 8), &dev).unwrap()),
            cross_attn_mask: Some(Tensor::ones((batch, 3), DType::F32, &dev).unwrap()),
            global_cond: Some(Tensor::randn(0f32, 1.0, (batch, 16), &dev).unwrap()),
            ..Default::default()
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn output_matches_input_shape() {
        let config = small_config();
        let model = random_model(&config);
        let x = Tensor::randn(0f32, 1.0, (2, 4, 10), &Device::Cpu).unwrap();
        let t = Tensor::new(&[0.3f32, 0.7], &Device::Cpu).unwrap();
        let out = model
            .forward_unguided(&x, &t, &conditioning(2), None)
            .unwrap();
        assert_eq!(out.dims(), &[2, 4, 10]);
    }

    #[test]
    fn unit_cfg_scale_equals_single_pass() {
        let config = small_config();
        let model = random_model(&config);
        let x = Tensor::randn(0f32, 1.0, (2, 4, 10), &Device::Cpu).unwrap();
        let t = Tensor::new(&[0.3f32, 0.7], &Device::Cpu).unwrap();
        let cond = conditioning(2);

        let guided = model
            .forward(&x, &t, &cond, None, &GuidanceParams::default())
            .unwrap();
        let single = model
            .forward_unguided(
                &x,
                &t,
                &DiffusionConditioning {
                    cross_attn_mask: None,
                    ..cond
                },
                None,
            )
            .unwrap();

        let g: Vec<f32> = guided.flatten_all().unwrap().to_vec1().unwrap();
        let s: Vec<f32> = single.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(g, s);
    }

    #[test]
    fn guidance_without_rescale_is_linear_combination() {
        let config = small_config();
        let model = random_model(&config);
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 10), &dev).unwrap();
        let t = Tensor::new(&[0.5f32], &dev).unwrap();
        let cond = conditioning(1);
        let scale = 6.0;

        let guided = model
            .forward(
                &x,
                &t,
                &cond,
                None,
                &GuidanceParams {
                    cfg_scale: scale,
                    ..Default::default()
                },
            )
            .unwrap();

        // Both halves run in one doubled batch; reproduce that exactly.
        let batch_x = Tensor::cat(&[&x, &x], 0).unwrap();
        let batch_t = Tensor::cat(&[&t, &t], 0).unwrap();
        let c = cond.cross_attn_cond.clone().unwrap();
        let g = cond.global_cond.clone().unwrap();
        let batch_cond = DiffusionConditioning {
            cross_attn_cond: Some(Tensor::cat(&[&c, &c.zeros_like().unwrap()], 0).unwrap()),
            global_cond: Some(Tensor::cat(&[&g, &g], 0).unwrap()),
            ..Default::default()
        };
        let out = model
            .forward_unguided(&batch_x, &batch_t, &batch_cond, None)
            .unwrap();
        let cond_out = out.narrow(0, 0, 1).unwrap();
        let uncond_out = out.narrow(0, 1, 1).unwrap();
        let expected =
            (&uncond_out + ((&cond_out - &uncond_out).unwrap() * scale).unwrap()).unwrap();

        assert!(max_abs_diff(&guided, &expected) < 1e-6);
    }

    #[test]
    fn rescale_changes_guided_output() {
        let config = small_config();
        let model = random_model(&config);
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 10), &dev).unwrap();
        let t = Tensor::new(&[0.5f32], &dev).unwrap();
        let cond = conditioning(1);

        let plain = GuidanceParams {
            cfg_scale: 7.0,
            ..Default::default()
        };
        let rescaled = GuidanceParams {
            scale_phi: 0.75,
            ..plain.clone()
        };
        let a = model.forward(&x, &t, &cond, None, &plain).unwrap();
        let b = model.forward(&x, &t, &cond, None, &rescaled).unwrap();
        assert_eq!(b.dims(), a.dims());
        assert!(max_abs_diff(&a, &b) > 0.0);
    }

    /// Unbiased std over the channel axis of `[C][T]` values, per time step.
    fn channel_std(v: &[Vec<f32>]) -> Vec<f32> {
        let c = v.len() as f32;
        (0..v[0].len())
            .map(|j| {
                let mean = v.iter().map(|row| row[j]).sum::<f32>() / c;
                let var = v.iter().map(|row| (row[j] - mean).powi(2)).sum::<f32>() / (c - 1.0);
                var.sqrt()
            })
            .collect()
    }

    #[test]
    fn rescale_matches_hand_computed_blend() {
        let dev = Device::Cpu;
        let cond_v = vec![
            vec![1.0f32, -2.0, 0.5],
            vec![3.0, 0.0, -1.5],
            vec![-1.0, 4.0, 2.0],
        ];
        let uncond_v = vec![
            vec![0.5f32, -1.0, 0.0],
            vec![1.0, 0.5, -0.5],
            vec![0.0, 1.0, 1.0],
        ];
        let cond_out = Tensor::from_vec(cond_v.concat(), (1, 3, 3), &dev).unwrap();
        let uncond_out = Tensor::from_vec(uncond_v.concat(), (1, 3, 3), &dev).unwrap();
        let (scale, phi) = (4.0f32, 0.7f32);

        let cfg: Vec<Vec<f32>> = cond_v
            .iter()
            .zip(&uncond_v)
            .map(|(c, u)| c.iter().zip(u).map(|(c, u)| u + (c - u) * scale).collect())
            .collect();
        let cond_std = channel_std(&cond_v);
        let cfg_std = channel_std(&cfg);
        let expected: Vec<f32> = cfg
            .iter()
            .flat_map(|row| {
                row.iter().enumerate().map(|(j, v)| {
                    let rescaled = v * cond_std[j] / cfg_std[j];
                    phi * rescaled + (1.0 - phi) * v
                })
            })
            .collect();

        let got: Vec<f32> = combine_guidance(&cond_out, &uncond_out, scale as f64, phi as f64)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for (g, e) in got.iter().zip(&expected) {
            assert!((g - e).abs() < 1e-4, "{g} vs {e}");
        }

        let unscaled: Vec<f32> = combine_guidance(&cond_out, &uncond_out, scale as f64, 0.0)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for (g, e) in unscaled.iter().zip(cfg.concat()) {
            assert!((g - e).abs() < 1e-5, "phi 0 is plain guidance: {g} vs {e}");
        }
    }

    #[test]
    fn causal_mode_is_rejected() {
        let config = small_config();
        let model = random_model(&config);
        let dev = Device::Cpu;
        let x = Tensor::zeros((1, 4, 8), DType::F32, &dev).unwrap();
        let t = Tensor::new(&[0.5f32], &dev).unwrap();
        let err = model
            .forward(
                &x,
                &t,
                &conditioning(1),
                None,
                &GuidanceParams {
                    causal: true,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn mm_transformer_is_rejected() {
        let config = DiTConfig {
            transformer_type: TransformerType::MmTransformer,
            ..small_config()
        };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            DiffusionTransformer::new(&config, vb),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn adaln_with_patching_and_extra_inputs() {
        let config = DiTConfig {
            io_channels: 4,
            embed_dim: 32,
            depth: 1,
            num_heads: 2,
            patch_size: 2,
            input_concat_dim: 3,
            prepend_cond_dim: 6,
            add_token_dim: 32,
            use_mlp: true,
            global_cond_type: GlobalCondType::AdaLn,
            ..DiTConfig::default()
        };
        let model = random_model(&config);
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 12), &dev).unwrap();
        let t = Tensor::new(&[0.2f32], &dev).unwrap();
        let cond = DiffusionConditioning {
            input_concat_cond: Some(Tensor::randn(0f32, 1.0, (1, 3, 5), &dev).unwrap()),
            prepend_cond: Some(Tensor::randn(0f32, 1.0, (1, 2, 6), &dev).unwrap()),
            prepend_cond_mask: Some(Tensor::ones((1, 2), DType::F32, &dev).unwrap()),
            add_cond: Some(Tensor::randn(0f32, 1.0, (1, 9, 32), &dev).unwrap()),
            ..Default::default()
        };
        let out = model.forward_unguided(&x, &t, &cond, None).unwrap();
        assert_eq!(out.dims(), &[1, 4, 12]);
    }

    #[test]
    fn patchify_inverts_unpatchify() {
        let dev = Device::Cpu;
        // [B, T, C] with T = 6, p = 3
        let x = Tensor::arange(0f32, 12.0, &dev)
            .unwrap()
            .reshape((1, 6, 2))
            .unwrap();
        let patched = patchify(&x, 3).unwrap();
        assert_eq!(patched.dims(), &[1, 2, 6]);
        // back through channel-first layout
        let restored = unpatchify(&patched.transpose(1, 2).unwrap().contiguous().unwrap(), 3)
            .unwrap()
            .transpose(1, 2)
            .unwrap();
        assert_eq!(max_abs_diff(&restored, &x), 0.0);
    }

    #[test]
    fn nearest_exact_picks_centre_samples() {
        let x = Tensor::new(&[[[0f32, 1.0, 2.0, 3.0]]], &Device::Cpu).unwrap();
        let y: Vec<f32> = interpolate_nearest_exact(&x, 2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(y, vec![1.0, 3.0]);
    }

    #[test]
    fn empty_sequences_cannot_be_resized() {
        let dev = Device::Cpu;
        let channel_first = Tensor::zeros((1, 3, 0), DType::F32, &dev).unwrap();
        assert!(matches!(
            interpolate_nearest_exact(&channel_first, 8),
            Err(Error::Invariant(_))
        ));
        let channel_last = Tensor::zeros((1, 0, 3), DType::F32, &dev).unwrap();
        assert!(matches!(
            resample_linear(&channel_last, 8),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn linear_resample_interpolates_midpoints() {
        let x = Tensor::new(&[[[0f32], [2.0]]], &Device::Cpu).unwrap();
        let y: Vec<f32> = resample_linear(&x, 4)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(y, vec![0.0, 0.5, 1.5, 2.0]);
    }
}
