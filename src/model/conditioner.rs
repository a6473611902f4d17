//! Conditioners: metadata values → `(tokens, mask)` tensors.
//!
//! Each [`Conditioner`] turns a batch of raw values (captions, feature file
//! paths, scalars, audio) into embeddings of a common width. A
//! [`MultiConditioner`] owns one conditioner per configured id and produces a
//! [`ConditioningBatch`] keyed by those ids.
//!
//! ## Submodules
//!
//! - [`config`] — the `conditioning` config section and its closed type set
//! - [`value`] — raw metadata values and feature-file loading
//! - [`backbone`] — pretrained encoder traits and the [`Backbones`] registry
//! - `features` / `scalar` / `text` / `media` — the conditioner implementations

pub mod backbone;
pub mod config;
mod features;
mod media;
mod scalar;
mod text;
pub mod value;

use std::collections::BTreeMap;

use candle_core::{Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

pub use backbone::{
    AudioEncoder, BackboneOwnership, Backbones, ImageEncoder, Phonemizer, T5TextEncoder,
    TextEncoder, VideoEncoder,
};
pub use config::{ConditionerEntry, ConditionerKind, ConditioningConfig};
pub use scalar::NumberEmbedder;
pub use value::{ConditionValue, Metadata, load_feature_file};

use features::{GlobalVideoFeatures, LinearFeatures, PassthroughFeatures};
use media::{ClapAudioConditioner, HieraConditioner, PretransformConditioner, VideoClipConditioner};
use scalar::{IntConditioner, NumberConditioner};
use text::{ClapTextConditioner, ClipTextConditioner, LutConditioner, PhonemeConditioner, T5Conditioner};

use crate::{Error, Result};

/// Optional output projection: `Linear(dim, output_dim)` when the widths differ
/// or projection is forced, otherwise identity.
pub struct ProjOut(Option<Linear>);

impl ProjOut {
    pub fn new(dim: usize, output_dim: usize, project_out: bool, vb: VarBuilder) -> Result<Self> {
        if dim != output_dim || project_out {
            Ok(Self(Some(candle_nn::linear(dim, output_dim, vb.pp("proj_out"))?)))
        } else {
            Ok(Self(None))
        }
    }

    pub fn is_identity(&self) -> bool {
        self.0.is_none()
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.0 {
            Some(linear) => Ok(linear.forward(x)?),
            None => Ok(x.clone()),
        }
    }
}

/// What one conditioner returns for a batch.
#[derive(Debug, Clone)]
pub enum ConditionerOutput {
    /// A bare tensor (e.g. passthrough features).
    Single(Tensor),
    /// Embeddings and their mask.
    Paired(Tensor, Tensor),
    /// Embeddings, mask, global vector and its mask.
    PairedWithGlobal(Tensor, Tensor, Tensor, Tensor),
}

/// One entry of a [`ConditioningBatch`].
#[derive(Debug, Clone)]
pub enum CondTensors {
    Raw(Tensor),
    Masked { tokens: Tensor, mask: Tensor },
}

impl CondTensors {
    pub fn tokens(&self) -> &Tensor {
        match self {
            Self::Raw(t) => t,
            Self::Masked { tokens, .. } => tokens,
        }
    }

    pub fn mask(&self) -> Option<&Tensor> {
        match self {
            Self::Raw(_) => None,
            Self::Masked { mask, .. } => Some(mask),
        }
    }
}

/// Conditioner outputs keyed by conditioner id. A conditioner that also yields
/// a global vector contributes a second entry under `"{id}_g"`.
#[derive(Debug, Clone, Default)]
pub struct ConditioningBatch(pub BTreeMap<String, CondTensors>);

impl ConditioningBatch {
    pub fn get(&self, key: &str) -> Option<&CondTensors> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: CondTensors) {
        self.0.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// A single conditioner of one of the supported kinds.
pub enum Conditioner {
    T5(T5Conditioner),
    ClapText(ClapTextConditioner),
    ClipText(ClipTextConditioner),
    ClapAudio(ClapAudioConditioner),
    LinearFeatures(LinearFeatures),
    GlobalVideo(GlobalVideoFeatures),
    VideoClip(VideoClipConditioner),
    Hiera(HieraConditioner),
    Int(IntConditioner),
    Number(NumberConditioner),
    Phoneme(PhonemeConditioner),
    Lut(LutConditioner),
    Pretransform(PretransformConditioner),
    Passthrough(PassthroughFeatures),
}

impl Conditioner {
    /// Build the conditioner for `kind`. Weights are read from `vb`, pretrained
    /// backbones are taken from `backbones` under `id`.
    pub fn new(
        kind: &ConditionerKind,
        id: &str,
        vb: VarBuilder,
        backbones: &mut Backbones,
        device: &Device,
    ) -> Result<Self> {
        let cond = match kind {
            ConditionerKind::T5(o) => Self::T5(T5Conditioner::new(o, id, vb, backbones, device)?),
            ConditionerKind::ClapText(o) => {
                Self::ClapText(ClapTextConditioner::new(o, id, vb, backbones)?)
            }
            ConditionerKind::ClipText(o) | ConditionerKind::MetaClipText(o) => {
                Self::ClipText(ClipTextConditioner::new(o, id, vb, backbones)?)
            }
            ConditionerKind::ClapAudio(o) => {
                Self::ClapAudio(ClapAudioConditioner::new(o, id, vb, backbones)?)
            }
            ConditionerKind::VideoLinear(o)
            | ConditionerKind::VideoSync(o)
            | ConditionerKind::TextLinear(o) => {
                Self::LinearFeatures(LinearFeatures::new(o, kind.pth_key(), vb)?)
            }
            ConditionerKind::VideoGlobal(o) => {
                Self::GlobalVideo(GlobalVideoFeatures::new(o, kind.pth_key(), vb)?)
            }
            ConditionerKind::VideoClip(o) => {
                Self::VideoClip(VideoClipConditioner::new(o, id, vb, backbones)?)
            }
            ConditionerKind::VideoHiera(o) => {
                Self::Hiera(HieraConditioner::new(o, id, vb, backbones)?)
            }
            ConditionerKind::Int(o) => Self::Int(IntConditioner::new(o, vb)?),
            ConditionerKind::Number(o) => Self::Number(NumberConditioner::new(o, vb)?),
            ConditionerKind::Phoneme(o) => {
                Self::Phoneme(PhonemeConditioner::new(o, id, vb, backbones)?)
            }
            ConditionerKind::Lut(o) => Self::Lut(LutConditioner::new(o, id, vb, backbones)?),
            ConditionerKind::Pretransform(o) => {
                Self::Pretransform(PretransformConditioner::new(o, id, vb, backbones)?)
            }
            ConditionerKind::MmUnchanged(o) => {
                Self::Passthrough(PassthroughFeatures::new(o, kind.pth_key(), vb))
            }
        };
        Ok(cond)
    }

    /// Encode one batch of raw values.
    pub fn forward(&mut self, inputs: &[ConditionValue], device: &Device) -> Result<ConditionerOutput> {
        match self {
            Self::T5(c) => c.forward(inputs, device),
            Self::ClapText(c) => c.forward(inputs, device),
            Self::ClipText(c) => c.forward(inputs, device),
            Self::ClapAudio(c) => c.forward(inputs, device),
            Self::LinearFeatures(c) => c.forward(inputs, device),
            Self::GlobalVideo(c) => c.forward(inputs, device),
            Self::VideoClip(c) => c.forward(inputs, device),
            Self::Hiera(c) => c.forward(inputs, device),
            Self::Int(c) => c.forward(inputs, device),
            Self::Number(c) => c.forward(inputs, device),
            Self::Phoneme(c) => c.forward(inputs, device),
            Self::Lut(c) => c.forward(inputs, device),
            Self::Pretransform(c) => c.forward(inputs, device),
            Self::Passthrough(c) => c.forward(inputs, device),
        }
    }

    /// Ownership of the wrapped pretrained backbone, if there is one.
    pub fn backbone_ownership(&self) -> Option<BackboneOwnership> {
        match self {
            Self::T5(c) => Some(c.ownership()),
            Self::ClapText(c) => Some(c.ownership()),
            Self::ClipText(c) => Some(c.ownership()),
            Self::ClapAudio(_) => Some(BackboneOwnership::Frozen),
            Self::VideoClip(c) => Some(c.ownership()),
            Self::Hiera(c) => Some(c.ownership()),
            Self::Phoneme(_) | Self::Pretransform(_) => Some(BackboneOwnership::Frozen),
            Self::LinearFeatures(_)
            | Self::GlobalVideo(_)
            | Self::Int(_)
            | Self::Number(_)
            | Self::Lut(_)
            | Self::Passthrough(_) => None,
        }
    }
}

/// One conditioner per configured id, applied to a batch of metadata.
pub struct MultiConditioner {
    conditioners: Vec<(String, Conditioner)>,
    default_keys: std::collections::HashMap<String, String>,
}

impl MultiConditioner {
    /// Build every conditioner in `config`. All entries are resolved first, so
    /// an unknown type fails before any weights or backbones are loaded.
    pub fn new(
        config: &ConditioningConfig,
        vb: VarBuilder,
        backbones: &mut Backbones,
        device: &Device,
    ) -> Result<Self> {
        let kinds = config
            .configs
            .iter()
            .map(|entry| Ok((entry.id.clone(), entry.resolve(config.cond_dim)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut conditioners = Vec::with_capacity(kinds.len());
        for (id, kind) in kinds {
            tracing::debug!("Building {} conditioner {id}", kind.tag());
            let cond = Conditioner::new(&kind, &id, vb.pp(&id), backbones, device)?;
            conditioners.push((id, cond));
        }
        tracing::info!("Built {} conditioners", conditioners.len());

        Ok(Self {
            conditioners,
            default_keys: config.default_keys.clone(),
        })
    }

    /// Assemble from already-built conditioners.
    pub fn from_parts(
        conditioners: Vec<(String, Conditioner)>,
        default_keys: std::collections::HashMap<String, String>,
    ) -> Self {
        Self {
            conditioners,
            default_keys,
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.conditioners.iter().map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.conditioners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditioners.is_empty()
    }

    /// Encode a batch of per-example metadata.
    ///
    /// Each conditioner reads the value under its id, falling back to its
    /// entry in `default_keys`. Single-element lists are unwrapped.
    pub fn forward(&mut self, batch: &[Metadata], device: &Device) -> Result<ConditioningBatch> {
        let mut out = ConditioningBatch::default();
        for (id, cond) in &mut self.conditioners {
            let default_key = self.default_keys.get(id.as_str());
            let inputs = batch
                .iter()
                .map(|meta| {
                    meta.get(id.as_str())
                        .or_else(|| default_key.and_then(|k| meta.get(k)))
                        .map(|v| v.unwrap_single().clone())
                        .ok_or_else(|| Error::MissingConditioningKey { key: id.clone() })
                })
                .collect::<Result<Vec<_>>>()?;

            match cond.forward(&inputs, device)? {
                ConditionerOutput::Single(t) => out.insert(id.clone(), CondTensors::Raw(t)),
                ConditionerOutput::Paired(tokens, mask) => {
                    out.insert(id.clone(), CondTensors::Masked { tokens, mask })
                }
                ConditionerOutput::PairedWithGlobal(tokens, mask, global, global_mask) => {
                    out.insert(id.clone(), CondTensors::Masked { tokens, mask });
                    out.insert(
                        format!("{id}_g"),
                        CondTensors::Masked {
                            tokens: global,
                            mask: global_mask,
                        },
                    );
                }
            }
        }
        Ok(out)
    }

    /// Ids of conditioners whose backbone is trainable.
    pub fn trainable_backbones(&self) -> Vec<&str> {
        self.conditioners
            .iter()
            .filter(|(_, c)| c.backbone_ownership() == Some(BackboneOwnership::Trainable))
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn config(json: serde_json::Value) -> ConditioningConfig {
        serde_json::from_value(json).unwrap()
    }

    fn feature_config() -> ConditioningConfig {
        config(serde_json::json!({
            "cond_dim": 8,
            "default_keys": {"seconds_total": "duration"},
            "configs": [
                {"id": "metaclip_features", "type": "video_global", "config": {"dim": 12, "global_dim": 16}},
                {"id": "sync_features", "type": "video_sync", "config": {"dim": 6}},
                {"id": "seconds_total", "type": "number", "config": {"max_val": 10.0}}
            ]
        }))
    }

    fn example(with_seconds: bool) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert(
            "metaclip_features".into(),
            Tensor::zeros((4, 12), DType::F32, &Device::Cpu).unwrap().into(),
        );
        meta.insert(
            "sync_features".into(),
            ConditionValue::List(vec![
                Tensor::zeros((10, 6), DType::F32, &Device::Cpu).unwrap().into(),
            ]),
        );
        if with_seconds {
            meta.insert("seconds_total".into(), ConditionValue::Float(8.0));
        } else {
            meta.insert("duration".into(), ConditionValue::Int(5));
        }
        meta
    }

    fn build(cfg: &ConditioningConfig) -> MultiConditioner {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        MultiConditioner::new(cfg, vb, &mut Backbones::new(), &Device::Cpu).unwrap()
    }

    #[test]
    fn outputs_one_entry_per_conditioner_plus_globals() {
        let mut multi = build(&feature_config());
        assert_eq!(multi.len(), 3);
        let out = multi
            .forward(&[example(true), example(true)], &Device::Cpu)
            .unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out.get("metaclip_features").unwrap().tokens().dims(), &[2, 4, 8]);
        assert_eq!(out.get("metaclip_features_g").unwrap().tokens().dims(), &[2, 16]);
        assert_eq!(out.get("sync_features").unwrap().tokens().dims(), &[2, 10, 8]);
        assert_eq!(out.get("seconds_total").unwrap().tokens().dims(), &[2, 1, 8]);
    }

    #[test]
    fn default_key_is_used_per_example() {
        let mut multi = build(&feature_config());
        let out = multi
            .forward(&[example(true), example(false)], &Device::Cpu)
            .unwrap();
        assert_eq!(out.get("seconds_total").unwrap().tokens().dim(0).unwrap(), 2);
    }

    #[test]
    fn missing_key_names_the_conditioner() {
        let mut multi = build(&feature_config());
        let mut meta = example(true);
        meta.remove("sync_features");
        let err = multi.forward(&[meta], &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::MissingConditioningKey { ref key } if key == "sync_features"));
    }

    #[test]
    fn unknown_type_fails_construction() {
        let cfg = config(serde_json::json!({
            "cond_dim": 8,
            "configs": [
                {"id": "sync_features", "type": "video_sync", "config": {"dim": 6}},
                {"id": "mystery", "type": "beats", "config": {}}
            ]
        }));
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let result = MultiConditioner::new(&cfg, vb, &mut Backbones::new(), &Device::Cpu);
        assert!(matches!(result, Err(Error::UnknownConditioner(ref t)) if t == "beats"));
    }

    #[test]
    fn passthrough_output_has_no_mask() {
        let cfg = config(serde_json::json!({
            "cond_dim": 8,
            "configs": [{"id": "metaclip_features", "type": "mm_unchang", "config": {"dim": 12}}]
        }));
        let mut multi = build(&cfg);
        let out = multi.forward(&[example(true)], &Device::Cpu).unwrap();
        assert!(out.get("metaclip_features").unwrap().mask().is_none());
        assert!(multi.trainable_backbones().is_empty());
    }

    #[test]
    fn proj_out_is_identity_for_equal_widths() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(ProjOut::new(8, 8, false, vb.clone()).unwrap().is_identity());
        assert!(!ProjOut::new(8, 8, true, vb.clone()).unwrap().is_identity());
        assert!(!ProjOut::new(4, 8, false, vb).unwrap().is_identity());
    }
}
