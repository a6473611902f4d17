//! Audio utilities.
//!
//! - WAV read/write on planar tensors, peak normalization
//! - FFT resampling (rubato)
//! - [`set_audio_channels`] / [`prepare_audio`] — shape init audio for a model

mod resample;
mod wav;

use candle_core::{Device, Tensor};

pub use resample::{resample, resample_planar};
pub use wav::{peak_normalize, read_wav, write_wav};

use crate::{Error, Result};

/// Adapt `[B, C, T]` audio to `target_channels`.
///
/// Mono targets average all channels. Stereo targets duplicate a mono input
/// and drop channels beyond the second. Other targets pass through.
pub fn set_audio_channels(audio: &Tensor, target_channels: usize) -> Result<Tensor> {
    let (_, channels, _) = audio.dims3()?;
    let out = match target_channels {
        1 => audio.mean_keepdim(1)?,
        2 if channels == 1 => Tensor::cat(&[audio, audio], 1)?,
        2 if channels > 2 => audio.narrow(1, 0, 2)?,
        _ => audio.clone(),
    };
    Ok(out)
}

/// Crop or right-pad the last axis with zeros to exactly `target_length`.
pub fn pad_crop(audio: &Tensor, target_length: usize) -> Result<Tensor> {
    let axis = audio.rank() - 1;
    let length = audio.dim(axis)?;
    let out = if length >= target_length {
        audio.narrow(axis, 0, target_length)?
    } else {
        audio.pad_with_zeros(axis, 0, target_length - length)?
    };
    Ok(out)
}

/// Bring init audio to the model's rate, length, and channel layout.
///
/// `audio` is `[T]` or `[C, T]` at `in_sr`. Returns `[1, target_channels, target_length]`
/// on `device`.
pub fn prepare_audio(
    audio: &Tensor,
    in_sr: u32,
    target_sr: u32,
    target_length: usize,
    target_channels: usize,
    device: &Device,
) -> Result<Tensor> {
    let audio = audio.to_device(device)?;
    let planar = match audio.rank() {
        1 => audio.unsqueeze(0)?,
        2 => audio,
        3 if audio.dim(0)? == 1 => audio.squeeze(0)?,
        rank => {
            return Err(Error::Audio(format!(
                "init audio must be [T] or [C, T], got rank {rank}"
            )));
        }
    };

    let planar = resample_planar(&planar, in_sr, target_sr)?;
    let planar = pad_crop(&planar, target_length)?;
    set_audio_channels(&planar.unsqueeze(0)?, target_channels)
}
