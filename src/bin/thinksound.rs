//! ThinkSound CLI — conditional audio generation from a model directory.
//!
//! Loads `model_config.json` + `model.safetensors` from a local directory or a
//! Hugging Face repo, conditions on JSON metadata, samples, and writes either a
//! WAV file or `.npy` latents.
//!
//! # Metadata
//!
//! `--metadata` is a JSON object (one batch item, repeated to `--batch-size`)
//! or an array of objects. Strings are text or feature-file paths:
//!
//! ```json
//! {"metaclip_features": "feats/demo.npz", "caption_cot": "A dog barks twice."}
//! ```
//!
//! # Output
//!
//! Writes `--output` (batch items beyond the first get a `_<i>` suffix) and
//! prints a one-line JSON summary to stdout.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use clap::Parser;
use thinksound_rs::{
    audio::{peak_normalize, read_wav, write_wav},
    checkpoint::ModelSource,
    model::{
        conditioner::{Backbones, ConditionValue, Metadata},
        wrapper::ConditionedDiffusionModel,
    },
    pipeline::{Conditioning, GenerationParams, InitAudio, MaskArgs, generate_diffusion_cond},
};

#[derive(Parser, Debug)]
#[command(
    name = "thinksound",
    about = "ThinkSound conditional audio generation",
    long_about = "Generate audio (or latents) from conditioning metadata.\n\
                  Output is written to --output; a JSON summary line is printed to stdout."
)]
struct Args {
    /// Model directory or Hugging Face repo id (`org/name`).
    #[arg(long, short = 'm')]
    model: String,

    /// JSON file with conditioning metadata.
    #[arg(long)]
    metadata: PathBuf,

    /// JSON file with negative conditioning metadata.
    #[arg(long)]
    negative_metadata: Option<PathBuf>,

    /// Directory holding pretrained backbones (T5 checkpoints).
    #[arg(long)]
    backbones: Option<PathBuf>,

    /// Output path: `.wav`, or `.npy` with --return-latents.
    #[arg(long, short = 'o')]
    output: PathBuf,

    #[arg(long, default_value_t = 24)]
    steps: usize,

    #[arg(long, default_value_t = 5.0)]
    cfg_scale: f64,

    /// Guidance rescale blend (0 disables).
    #[arg(long, default_value_t = 0.0)]
    scale_phi: f64,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Output duration in seconds. Defaults to the model's sample size.
    #[arg(long, short = 'd')]
    duration: Option<f64>,

    /// Random seed. Omit for a random seed each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// WAV file to start from (variation, or inpainting with --mask).
    #[arg(long)]
    init_audio: Option<PathBuf>,

    /// Noise level for variations of --init-audio.
    #[arg(long, default_value_t = 1.0)]
    init_noise_level: f64,

    /// Inpainting arguments as JSON, e.g. `{"maskstart": 50, "maskend": 100}`.
    #[arg(long)]
    mask: Option<String>,

    /// Write latents instead of decoded audio.
    #[arg(long)]
    return_latents: bool,

    /// Weight dtype: f32, f16 or bf16.
    #[arg(long, default_value = "f32")]
    dtype: String,

    /// Force CPU even when CUDA is available.
    #[arg(long)]
    cpu: bool,
}

fn read_metadata(path: &Path, batch_size: usize) -> anyhow::Result<Vec<Metadata>> {
    let text = std::fs::read_to_string(path)?;
    let json: serde_json::Value = serde_json::from_str(&text)?;
    let batch = match &json {
        serde_json::Value::Array(items) => items
            .iter()
            .map(ConditionValue::metadata_from_json)
            .collect::<Result<Vec<_>, _>>()?,
        single => vec![ConditionValue::metadata_from_json(single)?; batch_size],
    };
    if batch.len() != batch_size {
        anyhow::bail!(
            "{} holds {} metadata entries but --batch-size is {batch_size}",
            path.display(),
            batch.len()
        );
    }
    Ok(batch)
}

fn read_init_audio(path: &Path, device: &Device) -> anyhow::Result<InitAudio> {
    let (audio, sample_rate) = read_wav(path, device)?;
    Ok(InitAudio { sample_rate, audio })
}

fn numbered(path: &Path, index: usize) -> PathBuf {
    if index == 0 {
        return path.to_path_buf();
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("out");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("wav");
    path.with_file_name(format!("{stem}_{index}.{ext}"))
}

fn write_outputs(
    samples: &Tensor,
    output: &Path,
    sample_rate: u32,
    latents: bool,
) -> anyhow::Result<Vec<PathBuf>> {
    if latents {
        samples.to_dtype(DType::F32)?.write_npy(output)?;
        return Ok(vec![output.to_path_buf()]);
    }
    let batch = samples.dim(0)?;
    let mut written = Vec::with_capacity(batch);
    for i in 0..batch {
        let path = numbered(output, i);
        write_wav(&path, &peak_normalize(&samples.get(i)?)?, sample_rate)?;
        written.push(path);
    }
    Ok(written)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.batch_size == 0 {
        anyhow::bail!("--batch-size must be at least 1");
    }
    if let Some(d) = args.duration
        && !(d > 0.0 && d.is_finite())
    {
        anyhow::bail!("duration must be a positive number of seconds, got {d}");
    }
    let want_ext = if args.return_latents { "npy" } else { "wav" };
    let ext = args.output.extension().and_then(|e| e.to_str()).unwrap_or("");
    if !ext.eq_ignore_ascii_case(want_ext) {
        anyhow::bail!("output must be a .{want_ext} file, got {}", args.output.display());
    }
    let mask_args = args
        .mask
        .as_deref()
        .map(serde_json::from_str::<MaskArgs>)
        .transpose()?;
    if mask_args.is_some() && args.init_audio.is_none() {
        anyhow::bail!("--mask needs --init-audio");
    }

    if let Some(parent) = args.output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    let dtype: DType = args
        .dtype
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid --dtype {}: {e}", args.dtype))?;
    tracing::info!("Using device: {:?}, dtype: {:?}", device, dtype);

    let mut backbones = Backbones::new();
    if let Some(dir) = &args.backbones {
        backbones = backbones.with_dir(dir);
    }
    let source = ModelSource::parse(&args.model);
    tracing::info!("Loading model from {source}...");
    let mut model = ConditionedDiffusionModel::from_pretrained(&source, &mut backbones, &device, dtype)
        .map_err(|e| anyhow::anyhow!("failed to load model: {e}"))?;

    let metadata = read_metadata(&args.metadata, args.batch_size)?;
    let negative = args
        .negative_metadata
        .as_deref()
        .map(|p| read_metadata(p, args.batch_size))
        .transpose()?;

    let params = GenerationParams {
        steps: args.steps,
        cfg_scale: args.cfg_scale,
        scale_phi: args.scale_phi,
        batch_size: args.batch_size,
        sample_size: args
            .duration
            .map(|d| (d * model.sample_rate as f64).round() as usize),
        seed: args.seed,
        init_audio: args
            .init_audio
            .as_deref()
            .map(|p| read_init_audio(p, &device))
            .transpose()?,
        init_noise_level: args.init_noise_level,
        mask_args,
        return_latents: args.return_latents,
    };

    let out = generate_diffusion_cond(
        &mut model,
        Some(Conditioning::Metadata(&metadata)),
        negative.as_deref().map(Conditioning::Metadata),
        &params,
        &device,
    )
    .map_err(|e| anyhow::anyhow!("generation failed: {e}"))?;

    let written = write_outputs(&out.samples, &args.output, model.sample_rate, out.is_latent)?;

    println!(
        "{}",
        serde_json::json!({
            "paths": written,
            "seed": out.seed,
            "shape": out.samples.dims(),
            "sample_rate": model.sample_rate,
            "latents": out.is_latent,
        })
    );

    Ok(())
}
