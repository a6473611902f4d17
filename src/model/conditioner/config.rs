//! Conditioning configuration: the `conditioning` section of a model config.
//!
//! Entries are read as raw `{id, type, config}` triples and resolved into the
//! closed [`ConditionerKind`] set before any conditioner is built, so an
//! unknown `type` fails the whole construction.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::model::pretransform::PretransformConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditioningConfig {
    /// Output width shared by every conditioner unless an entry overrides `output_dim`.
    pub cond_dim: usize,
    /// Fallback metadata keys, `conditioner id -> metadata key`.
    #[serde(default)]
    pub default_keys: HashMap<String, String>,
    pub configs: Vec<ConditionerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionerEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl ConditionerEntry {
    /// Resolve the entry into its typed options, injecting `output_dim = cond_dim`
    /// unless the entry sets its own.
    pub fn resolve(&self, cond_dim: usize) -> Result<ConditionerKind> {
        let mut config = match &self.config {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => Default::default(),
            other => {
                return Err(Error::Config(format!(
                    "conditioner {}: config must be an object, got {other}",
                    self.id
                )));
            }
        };
        config
            .entry("output_dim")
            .or_insert_with(|| serde_json::Value::from(cond_dim));
        let config = serde_json::Value::Object(config);

        let kind = match self.kind.as_str() {
            "t5" => ConditionerKind::T5(self.options(config)?),
            "clap_text" => ConditionerKind::ClapText(self.options(config)?),
            "clip_text" => ConditionerKind::ClipText(self.options(config)?),
            "metaclip_text" => ConditionerKind::MetaClipText(self.options(config)?),
            "clap_audio" => ConditionerKind::ClapAudio(self.options(config)?),
            "video_linear" => ConditionerKind::VideoLinear(self.options(config)?),
            "video_global" => ConditionerKind::VideoGlobal(self.options(config)?),
            "video_sync" => ConditionerKind::VideoSync(self.options(config)?),
            "text_linear" => ConditionerKind::TextLinear(self.options(config)?),
            "video_clip" => ConditionerKind::VideoClip(self.options(config)?),
            "video_hiera" => ConditionerKind::VideoHiera(self.options(config)?),
            "int" => ConditionerKind::Int(self.options(config)?),
            "number" => ConditionerKind::Number(self.options(config)?),
            "phoneme" => ConditionerKind::Phoneme(self.options(config)?),
            "lut" => ConditionerKind::Lut(self.options(config)?),
            "pretransform" => {
                let opts: PretransformOptions = self.options(config)?;
                if opts.sample_rate.is_none() {
                    return Err(Error::Config(format!(
                        "conditioner {}: sample_rate must be specified for pretransform conditioners",
                        self.id
                    )));
                }
                ConditionerKind::Pretransform(opts)
            }
            "mm_unchang" => ConditionerKind::MmUnchanged(self.options(config)?),
            other => return Err(Error::UnknownConditioner(other.to_string())),
        };
        kind.validate(&self.id)?;
        Ok(kind)
    }

    fn options<T: DeserializeOwned>(&self, config: serde_json::Value) -> Result<T> {
        serde_json::from_value(config)
            .map_err(|e| Error::Config(format!("conditioner {} ({}): {e}", self.id, self.kind)))
    }
}

/// Every supported conditioner kind with its options.
#[derive(Debug, Clone)]
pub enum ConditionerKind {
    T5(T5Options),
    ClapText(ClapTextOptions),
    ClipText(ClipTextOptions),
    MetaClipText(ClipTextOptions),
    ClapAudio(ClapAudioOptions),
    VideoLinear(FeatureOptions),
    VideoGlobal(VideoGlobalOptions),
    VideoSync(FeatureOptions),
    TextLinear(FeatureOptions),
    VideoClip(VideoClipOptions),
    VideoHiera(HieraOptions),
    Int(IntOptions),
    Number(NumberOptions),
    Phoneme(PhonemeOptions),
    Lut(LutOptions),
    Pretransform(PretransformOptions),
    MmUnchanged(FeatureOptions),
}

impl ConditionerKind {
    /// The config `type` tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::T5(_) => "t5",
            Self::ClapText(_) => "clap_text",
            Self::ClipText(_) => "clip_text",
            Self::MetaClipText(_) => "metaclip_text",
            Self::ClapAudio(_) => "clap_audio",
            Self::VideoLinear(_) => "video_linear",
            Self::VideoGlobal(_) => "video_global",
            Self::VideoSync(_) => "video_sync",
            Self::TextLinear(_) => "text_linear",
            Self::VideoClip(_) => "video_clip",
            Self::VideoHiera(_) => "video_hiera",
            Self::Int(_) => "int",
            Self::Number(_) => "number",
            Self::Phoneme(_) => "phoneme",
            Self::Lut(_) => "lut",
            Self::Pretransform(_) => "pretransform",
            Self::MmUnchanged(_) => "mm_unchang",
        }
    }

    /// Tensor name read from torch (`.pth`) feature archives, for kinds that load them.
    pub fn pth_key(&self) -> Option<&'static str> {
        match self {
            Self::VideoLinear(_) | Self::VideoGlobal(_) | Self::MmUnchanged(_) => {
                Some("metaclip_features")
            }
            Self::VideoSync(_) => Some("sync_features"),
            Self::TextLinear(_) => Some("metaclip_text_features"),
            _ => None,
        }
    }

    fn validate(&self, id: &str) -> Result<()> {
        match self {
            Self::T5(o) if t5_width(&o.t5_model_name).is_none() => Err(Error::Config(format!(
                "conditioner {id}: unknown T5 model name {}",
                o.t5_model_name
            ))),
            Self::VideoClip(o) if clip_width(&o.clip_model_name).is_none() => {
                Err(Error::Config(format!(
                    "conditioner {id}: unknown CLIP model name {}",
                    o.clip_model_name
                )))
            }
            Self::Int(o) if o.max_val < o.min_val => Err(Error::Config(format!(
                "conditioner {id}: max_val {} is below min_val {}",
                o.max_val, o.min_val
            ))),
            Self::Number(o) if o.max_val <= o.min_val => Err(Error::Config(format!(
                "conditioner {id}: max_val {} must exceed min_val {}",
                o.max_val, o.min_val
            ))),
            _ => Ok(()),
        }
    }
}

/// Hidden width of a supported T5 encoder.
pub fn t5_width(name: &str) -> Option<usize> {
    let width = match name {
        "t5-small" | "google/flan-t5-small" => 512,
        "t5-base" | "google/flan-t5-base" => 768,
        "t5-large" | "t5-3b" | "t5-11b" | "google/flan-t5-large" => 1024,
        "t5-v1_1-xl" | "google/flan-t5-xl" => 2048,
        "google/t5-v1_1-xxl" | "google/flan-t5-xxl" => 4096,
        _ => return None,
    };
    Some(width)
}

/// Image-feature width of a supported MetaCLIP vision model.
pub fn clip_width(name: &str) -> Option<usize> {
    match name {
        "metaclip-base" | "metaclip-b16" => Some(512),
        "metaclip-large" => Some(768),
        "metaclip-huge" => Some(1024),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct T5Options {
    pub output_dim: usize,
    #[serde(default = "default_t5_model")]
    pub t5_model_name: String,
    #[serde(default = "default_text_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub enable_grad: bool,
    #[serde(default)]
    pub project_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClapTextOptions {
    pub output_dim: usize,
    #[serde(default)]
    pub clap_ckpt_path: Option<String>,
    #[serde(default)]
    pub use_text_features: bool,
    #[serde(default = "default_feature_layer")]
    pub feature_layer_ix: i64,
    #[serde(default = "default_clap_model")]
    pub audio_model_type: String,
    #[serde(default = "default_true")]
    pub enable_fusion: bool,
    #[serde(default)]
    pub project_out: bool,
    #[serde(default)]
    pub finetune: bool,
}

impl ClapTextOptions {
    /// Token features come from the 768-wide text branch, pooled embeddings are 512-wide.
    pub fn width(&self) -> usize {
        if self.use_text_features { 768 } else { 512 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipTextOptions {
    pub output_dim: usize,
    #[serde(default = "default_text_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub enable_grad: bool,
    #[serde(default)]
    pub project_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClapAudioOptions {
    pub output_dim: usize,
    #[serde(default)]
    pub clap_ckpt_path: Option<String>,
    #[serde(default = "default_clap_model")]
    pub audio_model_type: String,
    #[serde(default = "default_true")]
    pub enable_fusion: bool,
    #[serde(default)]
    pub project_out: bool,
}

/// Precomputed feature projection (`video_linear`, `video_sync`, `text_linear`, `mm_unchang`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureOptions {
    pub dim: usize,
    pub output_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoGlobalOptions {
    pub dim: usize,
    pub output_dim: usize,
    #[serde(default = "default_global_dim")]
    pub global_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoClipOptions {
    /// Ignored; the feature width follows `clip_model_name`.
    #[serde(default)]
    pub dim: usize,
    pub output_dim: usize,
    #[serde(default = "default_clip_model")]
    pub clip_model_name: String,
    #[serde(default)]
    pub enable_grad: bool,
    #[serde(default)]
    pub project_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HieraOptions {
    pub output_dim: usize,
    #[serde(default)]
    pub hiera_ckpt_path: Option<String>,
    #[serde(default)]
    pub project_out: bool,
    #[serde(default)]
    pub finetune: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntOptions {
    pub output_dim: usize,
    #[serde(default)]
    pub min_val: i64,
    #[serde(default = "default_int_max")]
    pub max_val: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberOptions {
    pub output_dim: usize,
    #[serde(default)]
    pub min_val: f64,
    #[serde(default = "default_number_max")]
    pub max_val: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhonemeOptions {
    pub output_dim: usize,
    #[serde(default = "default_long_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub project_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LutOptions {
    pub tokenizer_name: String,
    pub output_dim: usize,
    #[serde(default = "default_long_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub project_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PretransformOptions {
    pub output_dim: usize,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    pub pretransform_config: PretransformConfig,
    #[serde(default)]
    pub pretransform_ckpt_path: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_t5_model() -> String {
    "t5-base".to_string()
}
fn default_clip_model() -> String {
    "metaclip-huge".to_string()
}
fn default_clap_model() -> String {
    "HTSAT-base".to_string()
}
fn default_text_max_length() -> usize {
    77
}
fn default_long_max_length() -> usize {
    1024
}
fn default_feature_layer() -> i64 {
    -1
}
fn default_global_dim() -> usize {
    1536
}
fn default_int_max() -> i64 {
    512
}
fn default_number_max() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: &str, config: serde_json::Value) -> ConditionerEntry {
        ConditionerEntry {
            id: "cond".into(),
            kind: kind.into(),
            config,
        }
    }

    #[test]
    fn torch_archive_keys_per_kind() {
        let key = |kind: &str| {
            entry(kind, serde_json::json!({"dim": 8}))
                .resolve(4)
                .unwrap()
                .pth_key()
        };
        assert_eq!(key("video_linear"), Some("metaclip_features"));
        assert_eq!(key("video_global"), Some("metaclip_features"));
        assert_eq!(key("video_sync"), Some("sync_features"));
        assert_eq!(key("text_linear"), Some("metaclip_text_features"));
        assert_eq!(key("mm_unchang"), Some("metaclip_features"));
        assert_eq!(key("int"), None);
    }

    #[test]
    fn parses_thinksound_style_config() {
        let json = r#"{
            "cond_dim": 768,
            "default_keys": {"caption_t5": "caption_cot"},
            "configs": [
                {"id": "metaclip_features", "type": "mm_unchang", "config": {"dim": 1024, "output_dim": 1024}},
                {"id": "sync_features", "type": "video_sync", "config": {"dim": 768}},
                {"id": "caption_t5", "type": "t5", "config": {"t5_model_name": "t5-v1_1-xl", "max_length": 512}}
            ]
        }"#;
        let cfg: ConditioningConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.configs.len(), 3);
        assert_eq!(cfg.default_keys["caption_t5"], "caption_cot");

        let kinds: Vec<_> = cfg
            .configs
            .iter()
            .map(|e| e.resolve(cfg.cond_dim).unwrap())
            .collect();
        match &kinds[1] {
            ConditionerKind::VideoSync(o) => {
                assert_eq!(o.dim, 768);
                assert_eq!(o.output_dim, 768, "cond_dim is injected");
            }
            other => panic!("unexpected kind {}", other.tag()),
        }
        match &kinds[2] {
            ConditionerKind::T5(o) => {
                assert_eq!(o.max_length, 512);
                assert_eq!(t5_width(&o.t5_model_name), Some(2048));
            }
            other => panic!("unexpected kind {}", other.tag()),
        }
    }

    #[test]
    fn entry_output_dim_overrides_cond_dim() {
        let kind = entry("mm_unchang", serde_json::json!({"dim": 8, "output_dim": 8}))
            .resolve(768)
            .unwrap();
        let ConditionerKind::MmUnchanged(o) = kind else {
            panic!("expected mm_unchang");
        };
        assert_eq!(o.output_dim, 8);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = entry("wavlm", serde_json::json!({})).resolve(768).unwrap_err();
        assert!(matches!(err, Error::UnknownConditioner(ref t) if t == "wavlm"));
    }

    #[test]
    fn defaults_are_filled() {
        let kind = entry("int", serde_json::json!({})).resolve(16).unwrap();
        let ConditionerKind::Int(o) = kind else {
            panic!("expected int");
        };
        assert_eq!((o.min_val, o.max_val), (0, 512));

        let kind = entry("video_global", serde_json::json!({"dim": 1024}))
            .resolve(16)
            .unwrap();
        let ConditionerKind::VideoGlobal(o) = kind else {
            panic!("expected video_global");
        };
        assert_eq!(o.global_dim, 1536);
    }

    #[test]
    fn pretransform_requires_sample_rate() {
        let config = serde_json::json!({
            "pretransform_config": {"type": "patched", "config": {"channels": 2, "patch_size": 4}}
        });
        assert!(matches!(
            entry("pretransform", config).resolve(16),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn unknown_t5_model_is_rejected() {
        let config = serde_json::json!({"t5_model_name": "t5-gigantic"});
        assert!(matches!(entry("t5", config).resolve(16), Err(Error::Config(_))));
    }
}
