//! Conditional generation.
//!
//! [`generate_diffusion_cond`] runs the full sampling path:
//! 1. Resolve the output length (latent frames for latent models)
//! 2. Seed the generator and draw the initial noise
//! 3. Condition (metadata through the conditioner, or precomputed tensors)
//! 4. Prepare init audio for variations / inpainting
//! 5. Sample with the objective's schedule and classifier-free guidance
//! 6. Decode latents through the pretransform

pub mod mask;
pub mod sampler;

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::audio::prepare_audio;
use crate::model::conditioner::{ConditioningBatch, Metadata};
use crate::model::transformer::{GuidanceParams, NegativeConditioning};
use crate::model::wrapper::ConditionedDiffusionModel;
use crate::{Error, Result};

pub use mask::{MaskArgs, build_mask, crop_paste};
pub use sampler::{Denoiser, InitLatents, sample};

/// Where conditioning comes from.
#[derive(Clone, Copy)]
pub enum Conditioning<'a> {
    /// One metadata map per batch item, run through the model's conditioner.
    Metadata(&'a [Metadata]),
    /// Conditioner outputs computed earlier.
    Tensors(&'a ConditioningBatch),
}

/// Audio to start from, at its own sample rate.
#[derive(Debug, Clone)]
pub struct InitAudio {
    pub sample_rate: u32,
    /// `[T]` or `[C, T]`.
    pub audio: Tensor,
}

/// Parameters for [`generate_diffusion_cond`].
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub steps: usize,
    pub cfg_scale: f64,
    /// Guidance rescale blend; 0 disables it.
    pub scale_phi: f64,
    pub batch_size: usize,
    /// Output length in audio samples. `None` uses the model's default.
    pub sample_size: Option<usize>,
    /// `None` draws a random seed, which is logged.
    pub seed: Option<u64>,
    pub init_audio: Option<InitAudio>,
    /// Starting noise level for variations (init audio without a mask).
    pub init_noise_level: f64,
    /// Inpainting / outpainting arguments; only used with init audio.
    pub mask_args: Option<MaskArgs>,
    /// Skip pretransform decoding.
    pub return_latents: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            steps: 250,
            cfg_scale: 6.0,
            scale_phi: 0.0,
            batch_size: 1,
            sample_size: None,
            seed: None,
            init_audio: None,
            init_noise_level: 1.0,
            mask_args: None,
            return_latents: false,
        }
    }
}

/// Result of [`generate_diffusion_cond`].
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// `[B, audio_channels, samples]`, or `[B, io_channels, frames]` for latents.
    pub samples: Tensor,
    pub seed: u64,
    /// `samples` are undecoded latents.
    pub is_latent: bool,
}

/// Standard-normal noise `[b, c, t]` from a seeded ChaCha8 stream.
pub fn seeded_noise(seed: u64, shape: (usize, usize, usize), device: &Device) -> Result<Tensor> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let (b, c, t) = shape;
    let values: Vec<f32> = (0..b * c * t).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

/// Generate audio (or latents) conditioned on `conditioning`.
///
/// `negative` supplies the unconditional half of classifier-free guidance;
/// without it the unconditional inputs are zeros.
pub fn generate_diffusion_cond(
    model: &mut ConditionedDiffusionModel,
    conditioning: Option<Conditioning<'_>>,
    negative: Option<Conditioning<'_>>,
    params: &GenerationParams,
    device: &Device,
) -> Result<GenerationOutput> {
    let audio_sample_size = params.sample_size.unwrap_or(model.sample_size);
    let sample_size = match &model.pretransform {
        Some(p) => audio_sample_size / p.downsampling_ratio(),
        None => audio_sample_size,
    };
    if params.batch_size == 0 || sample_size == 0 {
        return Err(Error::Invariant(format!(
            "nothing to generate: batch {} x {sample_size} frames",
            params.batch_size
        )));
    }

    let seed = params
        .seed
        .unwrap_or_else(|| rand::rng().random_range(0..u32::MAX as u64));
    tracing::info!(seed, "Generation seed");
    let noise = seeded_noise(
        seed,
        (params.batch_size, model.io_channels, sample_size),
        device,
    )?;

    #[cfg(feature = "cuda")]
    if device.is_cuda() {
        candle_core::cuda::set_gemm_reduced_precision_f16(false);
        candle_core::cuda::set_gemm_reduced_precision_bf16(false);
        candle_core::cuda::set_gemm_reduced_precision_f32(false);
    }

    let Some(conditioning) = conditioning else {
        return Err(Error::Invariant(
            "either conditioning metadata or conditioning tensors must be provided".into(),
        ));
    };
    let positive = resolve(model, conditioning, device)?;
    let cond = model.get_conditioning_inputs(&positive)?;

    let negative = match negative {
        Some(n) => {
            let batch = resolve(model, n, device)?;
            model.get_negative_conditioning_inputs(&batch)?
        }
        None => NegativeConditioning::default(),
    };

    let init = match &params.init_audio {
        Some(init) => Some(prepare_init(model, init, audio_sample_size, params.batch_size, device)?),
        None => None,
    };

    // Crop/paste and mask only apply with init audio; init without a mask is a variation.
    let (init, mask, noise_level) = match (init, &params.mask_args) {
        (Some(init), Some(args)) => {
            let init = crop_paste(&init, args)?;
            let mask = build_mask(sample_size, args, device)?;
            (Some(init), Some(mask), None)
        }
        (Some(init), None) => (Some(init), None, Some(params.init_noise_level)),
        (None, _) => (None, None, None),
    };

    let mut scheduler = model.diffusion_objective.scheduler(noise_level);
    let guidance = GuidanceParams {
        cfg_scale: params.cfg_scale,
        scale_phi: params.scale_phi,
        ..Default::default()
    };
    tracing::info!(
        steps = params.steps,
        cfg_scale = params.cfg_scale,
        objective = %model.diffusion_objective,
        frames = sample_size,
        inpaint = mask.is_some(),
        variation = noise_level.is_some(),
        "Sampling"
    );

    let init_latents = init.as_ref().map(|latents| InitLatents {
        latents,
        mask: mask.as_ref(),
    });
    let sampled = sample(
        &model.model,
        scheduler.as_mut(),
        &noise,
        init_latents,
        params.steps,
        &cond,
        (!negative.is_empty()).then_some(&negative),
        &guidance,
    )?;

    let (samples, is_latent) = match &model.pretransform {
        Some(p) if !params.return_latents => (p.decode(&sampled.to_dtype(p.dtype())?)?, false),
        Some(_) => (sampled, true),
        None => (sampled, false),
    };
    Ok(GenerationOutput {
        samples,
        seed,
        is_latent,
    })
}

fn resolve(
    model: &mut ConditionedDiffusionModel,
    conditioning: Conditioning<'_>,
    device: &Device,
) -> Result<ConditioningBatch> {
    match conditioning {
        Conditioning::Metadata(batch) => model.condition(batch, device),
        Conditioning::Tensors(tensors) => Ok(tensors.clone()),
    }
}

/// Resample, channel-adapt, encode, and repeat init audio to `[B, C, frames]`.
fn prepare_init(
    model: &ConditionedDiffusionModel,
    init: &InitAudio,
    audio_sample_size: usize,
    batch_size: usize,
    device: &Device,
) -> Result<Tensor> {
    let io_channels = match &model.pretransform {
        Some(p) => p.io_channels(),
        None => model.io_channels,
    };
    let audio = prepare_audio(
        &init.audio,
        init.sample_rate,
        model.sample_rate,
        audio_sample_size,
        io_channels,
        device,
    )?;
    let audio = match &model.pretransform {
        Some(p) => p.encode(&audio.to_dtype(p.dtype())?)?,
        None => audio,
    };
    Ok(audio.repeat((batch_size, 1, 1))?)
}
