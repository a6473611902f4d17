//! Video → audio demo: two external inference stages plus ffmpeg plumbing.
//!
//! Stages, in order, each reported through a status callback:
//!
//! ```text
//! validate → stage video (transcode to mp4) → probe duration → write cot.csv
//!   → extract features (extract_latents.py) → infer (predict.py)
//!   → locate <results>/<MMDD>_batch_size1/demo.wav → mux → clean up
//! ```
//!
//! The first failing stage stops the run with [`Error::Demo`] carrying the
//! captured tool output.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use rand::Rng;

use crate::{Error, Result};

/// User inputs for one demo run.
#[derive(Debug, Clone)]
pub struct DemoRequest {
    pub video: PathBuf,
    pub title: String,
    pub description: String,
    /// Run feature extraction in half precision.
    pub use_half: bool,
}

/// Where the tools and scripts live.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    /// Directory holding `extract_latents.py` and `predict.py`; working directory for both.
    pub project_dir: PathBuf,
    /// Parent of the per-run session directory.
    pub work_dir: PathBuf,
    pub python: String,
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl DemoConfig {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            work_dir: std::env::temp_dir(),
            python: "python".into(),
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoStage {
    Validate,
    StageVideo,
    ProbeDuration,
    WriteCaptions,
    ExtractFeatures,
    Infer,
    LocateAudio,
    Mux,
    Cleanup,
}

impl fmt::Display for DemoStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validate => "validating inputs",
            Self::StageVideo => "staging video",
            Self::ProbeDuration => "measuring duration",
            Self::WriteCaptions => "writing captions",
            Self::ExtractFeatures => "extracting features",
            Self::Infer => "inferring",
            Self::LocateAudio => "locating generated audio",
            Self::Mux => "combining audio and video",
            Self::Cleanup => "cleaning up",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageStatus {
    Started(DemoStage),
    Finished(DemoStage),
    Failed(DemoStage, String),
}

/// Per-run directory tree.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub root: PathBuf,
    pub videos_dir: PathBuf,
    pub cot_dir: PathBuf,
    pub results_dir: PathBuf,
}

impl Session {
    pub fn create(work_dir: &Path) -> Result<Self> {
        let id = format!("{:08x}", rand::rng().random::<u32>());
        let root = work_dir.join(format!("thinksound_{id}"));
        let session = Self {
            videos_dir: root.join("videos"),
            cot_dir: root.join("cot_coarse"),
            results_dir: root.join("results").join("audios"),
            root,
            id,
        };
        for dir in [&session.videos_dir, &session.cot_dir, &session.results_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(session)
    }
}

/// Blank fields become a single space; all-digit fields are rejected.
pub fn normalize_fields(title: &str, description: &str) -> Result<(String, String)> {
    let fill = |s: &str| if s.is_empty() { " ".to_string() } else { s.to_string() };
    let (title, description) = (fill(title), fill(description));
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if all_digits(&title) || all_digits(&description) {
        return Err(Error::Demo(
            "title and description must not consist only of digits".into(),
        ));
    }
    Ok((title, description))
}

/// `id,caption,caption_cot` with a single `demo` row.
pub fn captions_csv(title: &str, description: &str) -> String {
    let cot = description.replace('"', "'");
    format!("id,caption,caption_cot\ndemo,{title},\"{cot}\"\n")
}

/// Where the inference stage leaves its audio for runs started on `date`.
pub fn generated_audio_path(results_dir: &Path, date: chrono::NaiveDate) -> PathBuf {
    results_dir
        .join(format!("{}_batch_size1", date.format("%m%d")))
        .join("demo.wav")
}

pub fn extract_features_args(
    duration_sec: f64,
    videos_dir: &Path,
    csv_path: &Path,
    results_dir: &Path,
    use_half: bool,
) -> Vec<String> {
    let mut args = vec![
        "extract_latents.py".to_string(),
        "--duration_sec".into(),
        duration_sec.to_string(),
        "--root".into(),
        videos_dir.display().to_string(),
        "--tsv_path".into(),
        csv_path.display().to_string(),
        "--save-dir".into(),
        results_dir.display().to_string(),
    ];
    if use_half {
        args.push("--use_half".into());
    }
    args
}

pub fn predict_args(duration_sec: f64, results_dir: &Path) -> Vec<String> {
    vec![
        "predict.py".to_string(),
        "--duration-sec".into(),
        duration_sec.to_string(),
        "--results-dir".into(),
        results_dir.display().to_string(),
    ]
}

pub fn transcode_args(input: &Path, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-i".into(), input.display().to_string()];
    args.extend(
        ["-c:v", "libx264", "-preset", "fast", "-c:a", "aac", "-strict", "experimental"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(output.display().to_string());
    args
}

pub fn mux_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-i".into(), video.display().to_string()];
    args.extend(["-i".into(), audio.display().to_string()]);
    args.extend(
        [
            "-c:v", "copy", "-c:a", "aac", "-strict", "experimental", "-map", "0:v:0", "-map",
            "1:a:0", "-shortest",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(output.display().to_string());
    args
}

/// Run a tool to completion, returning its combined stdout and stderr.
fn run_tool(stage: DemoStage, program: &str, args: &[String], cwd: Option<&Path>) -> Result<String> {
    let mut command = Command::new(program);
    command.args(args);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    tracing::debug!(%stage, program, ?args, "running");
    let output = command
        .output()
        .map_err(|e| Error::Demo(format!("{stage}: failed to start {program}: {e}")))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    for line in text.lines() {
        tracing::debug!(%stage, "{line}");
    }
    if !output.status.success() {
        return Err(Error::Demo(format!("{stage} failed ({}):\n{text}", output.status)));
    }
    Ok(text)
}

fn probe_duration(config: &DemoConfig, video: &Path) -> Result<f64> {
    let args: Vec<String> = [
        "-v",
        "error",
        "-show_entries",
        "format=duration",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain([video.display().to_string()])
    .collect();
    let out = run_tool(DemoStage::ProbeDuration, &config.ffprobe, &args, None)?;
    out.trim()
        .lines()
        .next()
        .and_then(|l| l.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| Error::Demo(format!("could not read a duration from ffprobe output {out:?}")))
}

/// Run every stage and return the path of the muxed video.
pub fn run_demo(
    request: &DemoRequest,
    config: &DemoConfig,
    mut on_status: impl FnMut(&StageStatus),
) -> Result<PathBuf> {
    let mut run_stage = |stage: DemoStage, f: &mut dyn FnMut() -> Result<()>| -> Result<()> {
        on_status(&StageStatus::Started(stage));
        match f() {
            Ok(()) => {
                on_status(&StageStatus::Finished(stage));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%stage, error = %e, "demo stage failed");
                on_status(&StageStatus::Failed(stage, e.to_string()));
                Err(e)
            }
        }
    };

    let mut fields = (String::new(), String::new());
    run_stage(DemoStage::Validate, &mut || {
        fields = normalize_fields(&request.title, &request.description)?;
        Ok(())
    })?;
    let (title, description) = fields;

    let session = Session::create(&config.work_dir)?;
    let staged = session.videos_dir.join("demo.mp4");
    run_stage(DemoStage::StageVideo, &mut || {
        let is_mp4 = request
            .video
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mp4"));
        if is_mp4 {
            std::fs::copy(&request.video, &staged)?;
        } else {
            run_tool(
                DemoStage::StageVideo,
                &config.ffmpeg,
                &transcode_args(&request.video, &staged),
                None,
            )?;
        }
        Ok(())
    })?;

    let mut duration = 0.0;
    run_stage(DemoStage::ProbeDuration, &mut || {
        duration = probe_duration(config, &staged)?;
        tracing::info!(duration, "video duration");
        Ok(())
    })?;

    let csv_path = session.cot_dir.join("cot.csv");
    run_stage(DemoStage::WriteCaptions, &mut || {
        std::fs::write(&csv_path, captions_csv(&title, &description))?;
        Ok(())
    })?;

    run_stage(DemoStage::ExtractFeatures, &mut || {
        let args = extract_features_args(
            duration,
            &session.videos_dir,
            &csv_path,
            &session.results_dir,
            request.use_half,
        );
        run_tool(DemoStage::ExtractFeatures, &config.python, &args, Some(&config.project_dir))?;
        Ok(())
    })?;

    run_stage(DemoStage::Infer, &mut || {
        let args = predict_args(duration, &session.results_dir);
        run_tool(DemoStage::Infer, &config.python, &args, Some(&config.project_dir))?;
        Ok(())
    })?;

    let audio = generated_audio_path(&session.results_dir, chrono::Local::now().date_naive());
    run_stage(DemoStage::LocateAudio, &mut || {
        if audio.is_file() {
            Ok(())
        } else {
            Err(Error::Demo(format!("generated audio not found at {}", audio.display())))
        }
    })?;

    let stem = request
        .video
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video");
    let combined = session
        .results_dir
        .join(format!("{stem}_{}_with_audio.mp4", session.id));
    run_stage(DemoStage::Mux, &mut || {
        run_tool(DemoStage::Mux, &config.ffmpeg, &mux_args(&staged, &audio, &combined), None)?;
        Ok(())
    })?;

    run_stage(DemoStage::Cleanup, &mut || {
        std::fs::remove_dir_all(&session.videos_dir)?;
        Ok(())
    })?;

    tracing::info!(output = %combined.display(), "demo finished");
    Ok(combined)
}
