//! Guided sampling loop shared by both diffusion objectives.

use candle_core::{DType, Tensor};

use crate::model::transformer::{
    DiffusionConditioning, DiffusionTransformer, GuidanceParams, NegativeConditioning,
};
use crate::scheduler::Scheduler;
use crate::{Error, Result};

/// A model evaluated once per sampling step.
pub trait Denoiser {
    /// `x`: `[B, C, T]`, `t`: `[B]`. Returns the objective's prediction, shaped like `x`.
    fn denoise(
        &self,
        x: &Tensor,
        t: &Tensor,
        cond: &DiffusionConditioning,
        negative: Option<&NegativeConditioning>,
        guidance: &GuidanceParams,
    ) -> Result<Tensor>;

    fn dtype(&self) -> DType;
}

impl Denoiser for DiffusionTransformer {
    fn denoise(
        &self,
        x: &Tensor,
        t: &Tensor,
        cond: &DiffusionConditioning,
        negative: Option<&NegativeConditioning>,
        guidance: &GuidanceParams,
    ) -> Result<Tensor> {
        self.forward(x, t, cond, negative, guidance)
    }

    fn dtype(&self) -> DType {
        DiffusionTransformer::dtype(self)
    }
}

/// Init signal for variations and inpainting.
pub struct InitLatents<'a> {
    /// `[B, C, T]`, same shape as the noise.
    pub latents: &'a Tensor,
    /// Soft mask `[T]`; `None` makes this a variation.
    pub mask: Option<&'a Tensor>,
}

/// Run `steps` denoiser evaluations from `noise` down to `t = 0`.
///
/// With an init signal the start is the init noised to the first level. With a
/// mask, after step `i` every position whose mask exceeds `i / steps` is reset
/// to the init noised to the next level, reusing `noise`.
pub fn sample(
    model: &impl Denoiser,
    scheduler: &mut dyn Scheduler,
    noise: &Tensor,
    init: Option<InitLatents<'_>>,
    steps: usize,
    cond: &DiffusionConditioning,
    negative: Option<&NegativeConditioning>,
    guidance: &GuidanceParams,
) -> Result<Tensor> {
    if steps == 0 {
        return Err(Error::Invariant("sampling needs at least one step".into()));
    }
    let dtype = model.dtype();
    let noise = noise.to_dtype(dtype)?;
    let (batch, _, length) = noise.dims3()?;
    let device = noise.device().clone();

    scheduler.set_timesteps(steps);

    let init_latents = init.as_ref().map(|i| i.latents.to_dtype(dtype)).transpose()?;
    let keep_masks = match init.as_ref().and_then(|i| i.mask) {
        Some(mask) => {
            if mask.dims1()? != length {
                return Err(Error::Invariant(format!(
                    "mask length {} does not match signal length {length}",
                    mask.dims1()?
                )));
            }
            let mask = mask.to_device(&device)?.to_dtype(DType::F32)?;
            Some(mask.reshape((1, 1, length))?.broadcast_as(noise.shape())?)
        }
        None => None,
    };

    let mut x = match &init_latents {
        Some(latents) => scheduler.add_noise(latents, &noise, 0)?,
        None => noise.clone(),
    };

    for i in 0..steps {
        let t_value = scheduler.timesteps()[i];
        let t = Tensor::full(t_value as f32, batch, &device)?.to_dtype(dtype)?;
        let out = model.denoise(&x, &t, cond, negative, guidance)?;
        x = scheduler.step(&out, &x, i)?;

        if let (Some(latents), Some(mask)) = (&init_latents, &keep_masks) {
            let keep = mask.gt(i as f64 / steps as f64)?;
            let reference = scheduler.add_noise(latents, &noise, i + 1)?;
            x = keep.where_cond(&reference, &x)?;
        }
        tracing::trace!(step = i, t = t_value, "sampling step");
    }
    Ok(x)
}
