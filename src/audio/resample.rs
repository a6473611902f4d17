//! Sample-rate conversion with rubato's FFT resampler.

use candle_core::Tensor;
use rubato::Resampler;

use crate::{Error, Result};

const CHUNK_SIZE: usize = 1024;

/// Resample one channel of PCM from `sr_in` to `sr_out`.
pub fn resample(pcm_in: &[f32], sr_in: u32, sr_out: u32) -> Result<Vec<f32>> {
    if sr_in == sr_out {
        return Ok(pcm_in.to_vec());
    }

    let mut pcm_out =
        Vec::with_capacity((pcm_in.len() as f64 * sr_out as f64 / sr_in as f64) as usize + 1024);

    let mut resampler =
        rubato::FftFixedInOut::<f32>::new(sr_in as usize, sr_out as usize, CHUNK_SIZE, 1)
            .map_err(|e| Error::Audio(format!("resampler {sr_in}->{sr_out}: {e}")))?;
    let mut output_buffer = resampler.output_buffer_allocate(true);
    let mut pos_in = 0;
    while pos_in + resampler.input_frames_next() < pcm_in.len() {
        let (in_len, out_len) = resampler
            .process_into_buffer(&[&pcm_in[pos_in..]], &mut output_buffer, None)
            .map_err(|e| Error::Audio(e.to_string()))?;
        pos_in += in_len;
        pcm_out.extend_from_slice(&output_buffer[0][..out_len]);
    }

    if pos_in < pcm_in.len() {
        let (_in_len, out_len) = resampler
            .process_partial_into_buffer(Some(&[&pcm_in[pos_in..]]), &mut output_buffer, None)
            .map_err(|e| Error::Audio(e.to_string()))?;
        pcm_out.extend_from_slice(&output_buffer[0][..out_len]);
    }

    Ok(pcm_out)
}

/// Resample every channel of a planar `[C, T]` tensor.
pub fn resample_planar(audio: &Tensor, sr_in: u32, sr_out: u32) -> Result<Tensor> {
    if sr_in == sr_out {
        return Ok(audio.clone());
    }
    let dtype = audio.dtype();
    let device = audio.device();
    let channels = audio.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;

    let mut resampled = Vec::with_capacity(channels.len());
    for channel in &channels {
        resampled.push(resample(channel, sr_in, sr_out)?);
    }
    let frames = resampled.iter().map(Vec::len).min().unwrap_or(0);

    let rows = resampled
        .iter()
        .map(|c| Tensor::from_slice(&c[..frames], frames, device))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::stack(&rows, 0)?.to_dtype(dtype)?)
}
