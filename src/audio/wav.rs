//! WAV I/O on planar `[C, T]` tensors.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::{Error, Result};

/// Read a WAV file as planar `f32` audio in `[-1, 1]`, returning `([C, T], sample_rate)`.
pub fn read_wav(path: impl AsRef<Path>, device: &Device) -> Result<(Tensor, u32)> {
    let reader = WavReader::open(path)?;
    let WavSpec {
        channels,
        sample_rate,
        bits_per_sample,
        sample_format,
    } = reader.spec();

    let interleaved = match sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            let full_scale = (1u64 << (bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / full_scale))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };
    Ok((deinterleave(&interleaved, channels, device)?, sample_rate))
}

/// Write planar `[C, T]` audio as a 32-bit float WAV file.
pub fn write_wav(path: impl AsRef<Path>, audio: &Tensor, sample_rate: u32) -> Result<()> {
    let (channels, _) = audio.dims2()?;
    let spec = WavSpec {
        channels: channels as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for sample in interleave(audio)? {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Scale so the loudest sample sits at ±1, then clamp. Silence is left alone.
pub fn peak_normalize(audio: &Tensor) -> Result<Tensor> {
    let audio = audio.to_dtype(DType::F32)?;
    let peak = audio.abs()?.max_all()?.to_scalar::<f32>()?;
    if peak <= 1e-8 {
        return Ok(audio);
    }
    Ok((audio / f64::from(peak))?.clamp(-1f32, 1f32)?)
}

fn deinterleave(samples: &[f32], channels: u16, device: &Device) -> Result<Tensor> {
    let channels = usize::from(channels);
    if channels == 0 || samples.len() % channels != 0 {
        return Err(Error::Audio(format!(
            "{} samples do not split into {channels} channels",
            samples.len()
        )));
    }
    let frames = samples.len() / channels;
    let planar = Tensor::from_slice(samples, (frames, channels), device)?;
    Ok(planar.t()?.contiguous()?)
}

fn interleave(audio: &Tensor) -> Result<Vec<f32>> {
    let frames = audio.to_dtype(DType::F32)?.t()?.contiguous()?;
    Ok(frames.flatten_all()?.to_vec1::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn normalize_scales_to_unit_peak() {
        let audio = Tensor::new(&[[0.5f32, -0.25], [0.1, 0.0]], &Device::Cpu).unwrap();
        let out = values(&peak_normalize(&audio).unwrap());
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!((out[1] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_silence() {
        let audio = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(values(&peak_normalize(&audio).unwrap()), vec![0.0; 8]);
    }

    #[test]
    fn stereo_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        let audio = Tensor::new(&[[0.0f32, 0.5, 1.0], [-0.5, -1.0, 0.25]], &Device::Cpu).unwrap();
        write_wav(&path, &audio, 44100).unwrap();

        let (loaded, sr) = read_wav(&path, &Device::Cpu).unwrap();
        assert_eq!(sr, 44100);
        assert_eq!(loaded.dims(), &[2, 3]);
        let left: Vec<f32> = loaded.get(0).unwrap().to_vec1().unwrap();
        assert_eq!(left, vec![0.0, 0.5, 1.0], "channels stay planar");
        assert_eq!(values(&loaded), values(&audio));
    }

    #[test]
    fn integer_wavs_are_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pcm16.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for s in [0i16, 16384, -32768] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let (loaded, _) = read_wav(&path, &Device::Cpu).unwrap();
        assert_eq!(values(&loaded), vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn ragged_interleaving_is_rejected() {
        let err = deinterleave(&[0.0, 1.0, 2.0], 2, &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::Audio(_)));
    }
}
