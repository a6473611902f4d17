//! ThinkSound demo — add generated audio to a video.
//!
//! Runs feature extraction and inference as two Python stages from a ThinkSound
//! project checkout, then muxes the generated WAV into the video with ffmpeg.
//! Prints a one-line JSON summary with the output path on success.

use std::path::PathBuf;

use clap::Parser;
use thinksound_rs::demo::{DemoConfig, DemoRequest, StageStatus, run_demo};

#[derive(Parser, Debug)]
#[command(name = "thinksound-demo", about = "Video-to-audio demo pipeline")]
struct Args {
    /// Input video.
    #[arg(long, short = 'i')]
    video: PathBuf,

    /// Short title / caption for the clip.
    #[arg(long, short = 't', default_value = "")]
    title: String,

    /// Chain-of-thought description of the expected sound.
    #[arg(long, short = 'd', default_value = "")]
    description: String,

    /// Project directory containing extract_latents.py and predict.py.
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Parent directory for the per-run session (default: system temp dir).
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Run feature extraction in half precision.
    #[arg(long)]
    use_half: bool,

    #[arg(long, default_value = "python")]
    python: String,

    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,

    #[arg(long, default_value = "ffprobe")]
    ffprobe: String,
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

    if !args.video.is_file() {
        anyhow::bail!("video not found: {}", args.video.display());
    }

    let mut config = DemoConfig::new(&args.project_dir);
    if let Some(dir) = args.work_dir {
        config.work_dir = dir;
    }
    config.python = args.python;
    config.ffmpeg = args.ffmpeg;
    config.ffprobe = args.ffprobe;

    let request = DemoRequest {
        video: args.video,
        title: args.title,
        description: args.description,
        use_half: args.use_half,
    };

    let output = run_demo(&request, &config, |status| match status {
        StageStatus::Started(stage) => tracing::info!("{stage}..."),
        StageStatus::Finished(_) => {}
        StageStatus::Failed(stage, _) => tracing::error!("{stage} failed"),
    })
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    println!("{}", serde_json::json!({ "path": output }));
    Ok(())
}
