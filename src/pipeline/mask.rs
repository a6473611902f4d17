//! Soft inpainting masks and the crop/paste outpainting transform.
//!
//! Mask arguments are percentages of the diffused length. A mask value of 1
//! keeps the init signal, 0 generates freely, anything between releases the
//! position partway through sampling.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Inpainting / outpainting arguments, all positions in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskArgs {
    pub maskstart: f64,
    pub maskend: f64,
    #[serde(rename = "softnessL", default)]
    pub softness_l: f64,
    #[serde(rename = "softnessR", default)]
    pub softness_r: f64,
    #[serde(default)]
    pub marination: f64,
    #[serde(default)]
    pub cropfrom: f64,
    #[serde(default)]
    pub pastefrom: f64,
    #[serde(default = "default_pasteto")]
    pub pasteto: f64,
}

fn default_pasteto() -> f64 {
    100.0
}

impl Default for MaskArgs {
    fn default() -> Self {
        Self {
            maskstart: 0.0,
            maskend: 100.0,
            softness_l: 0.0,
            softness_r: 0.0,
            marination: 0.0,
            cropfrom: 0.0,
            pastefrom: 0.0,
            pasteto: default_pasteto(),
        }
    }
}

fn percent_floor(p: f64, len: usize) -> usize {
    (p / 100.0 * len as f64).floor().max(0.0) as usize
}

fn percent_ceil(p: f64, len: usize) -> usize {
    (p / 100.0 * len as f64).ceil().max(0.0) as usize
}

fn percent_round(p: f64, len: usize) -> usize {
    (p / 100.0 * len as f64).round().max(0.0) as usize
}

/// Symmetric Hann window of length `n`.
fn hann(n: usize) -> Vec<f32> {
    if n <= 1 {
        return vec![1.0; n];
    }
    let denom = (n - 1) as f64;
    (0..n)
        .map(|i| (0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / denom).cos()) as f32)
        .collect()
}

/// Soft mask of length `sample_size`.
///
/// Ones over `[maskstart, maskend)`, a rising half-Hann ramp of width
/// `softnessL` at the start, a falling one of width `softnessR` at the end,
/// then scaled by `1 - marination`.
pub fn build_mask_values(sample_size: usize, args: &MaskArgs) -> Vec<f32> {
    let start = percent_floor(args.maskstart, sample_size).min(sample_size);
    let end = percent_ceil(args.maskend, sample_size).min(sample_size);
    let soft_l = percent_round(args.softness_l, sample_size);
    let soft_r = percent_round(args.softness_r, sample_size);

    let mut mask = vec![0f32; sample_size];
    if start < end {
        mask[start..end].fill(1.0);
    }

    let rising = &hann(soft_l * 2)[..soft_l];
    for (k, w) in rising.iter().enumerate() {
        if let Some(m) = mask.get_mut(start + k) {
            *m = *w;
        }
    }

    let falling = &hann(soft_r * 2)[soft_r..];
    for (k, w) in falling.iter().enumerate() {
        let pos = end as isize - soft_r as isize + k as isize;
        if pos >= 0
            && let Some(m) = mask.get_mut(pos as usize)
        {
            *m = *w;
        }
    }

    if args.marination > 0.0 {
        let keep = (1.0 - args.marination) as f32;
        mask.iter_mut().for_each(|m| *m *= keep);
    }
    mask
}

/// [`build_mask_values`] as an `f32` tensor `[sample_size]` on `device`.
pub fn build_mask(sample_size: usize, args: &MaskArgs, device: &Device) -> Result<Tensor> {
    let values = build_mask_values(sample_size, args);
    Ok(Tensor::from_vec(values, sample_size, device)?)
}

/// Frame ranges `(cropfrom..cropto, pastefrom..pasteto)` for a signal of `len` frames.
pub fn crop_paste_ranges(
    len: usize,
    args: &MaskArgs,
) -> Result<(std::ops::Range<usize>, std::ops::Range<usize>)> {
    let cropfrom = percent_floor(args.cropfrom, len);
    let pastefrom = percent_floor(args.pastefrom, len);
    let pasteto = percent_ceil(args.pasteto, len);
    if pastefrom >= pasteto {
        return Err(Error::Invariant(format!(
            "paste start {pastefrom} must be before paste end {pasteto}"
        )));
    }

    let croplen = (pasteto - pastefrom)
        .min(len.saturating_sub(cropfrom))
        .min(len.saturating_sub(pastefrom));
    Ok((cropfrom..cropfrom + croplen, pastefrom..pastefrom + croplen))
}

/// Move `init[..., cropfrom..cropto]` to `pastefrom..pasteto` on a zero background.
///
/// `init`: `[B, C, T]`.
pub fn crop_paste(init: &Tensor, args: &MaskArgs) -> Result<Tensor> {
    let (b, c, len) = init.dims3()?;
    let (crop, paste) = crop_paste_ranges(len, args)?;
    if crop.is_empty() {
        return Ok(init.zeros_like()?);
    }

    let zeros = |n: usize| Tensor::zeros((b, c, n), init.dtype(), init.device());
    let mut parts = Vec::with_capacity(3);
    if paste.start > 0 {
        parts.push(zeros(paste.start)?);
    }
    parts.push(init.narrow(2, crop.start, crop.len())?);
    if paste.end < len {
        parts.push(zeros(len - paste.end)?);
    }
    Ok(Tensor::cat(&parts, 2)?)
}
