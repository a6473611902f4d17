//! Pretrained backbones consumed by conditioners.
//!
//! Conditioners see their encoders only through the traits here. T5 has a
//! native candle adapter; CLAP, CLIP/MetaCLIP, Hiera and G2P encoders are
//! registered by the caller in [`Backbones`] under the conditioner id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::t5;
use tokenizers::Tokenizer;

use crate::checkpoint::ModelSource;
use crate::model::pretransform::Pretransform;
use crate::{Error, Result};

/// Whether a conditioner's backbone belongs to the trainable parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneOwnership {
    Frozen,
    Trainable,
}

impl BackboneOwnership {
    pub fn from_flag(trainable: bool) -> Self {
        if trainable {
            Self::Trainable
        } else {
            Self::Frozen
        }
    }
}

/// Text encoder exposing token-level hidden states.
pub trait TextEncoder: Send {
    /// Hidden width of [`TextEncoder::hidden_states`].
    fn width(&self) -> usize;

    /// Token hidden states `[B, L, D]` and attention mask `[B, L]` (f32, 1 = token).
    ///
    /// - `max_length`: pad/truncate every text to exactly this length; `None` pads to the longest
    /// - `layer_ix`: hidden-state layer (negative counts from the end); `None` is the final layer
    fn hidden_states(
        &mut self,
        texts: &[String],
        max_length: Option<usize>,
        layer_ix: Option<i64>,
        device: &Device,
    ) -> Result<(Tensor, Tensor)>;

    /// Pooled sentence embedding `[B, D]`.
    fn pooled(&mut self, _texts: &[String], _device: &Device) -> Result<Tensor> {
        Err(Error::Config(
            "text encoder does not provide pooled embeddings".into(),
        ))
    }
}

/// Image encoder producing one feature vector per image: `[N, C, H, W] → [N, D]`.
pub trait ImageEncoder: Send {
    fn width(&self) -> usize;
    fn image_features(&mut self, images: &Tensor) -> Result<Tensor>;
}

/// Audio encoder producing pooled embeddings: mono `[B, T] → [B, D]`.
pub trait AudioEncoder: Send {
    fn width(&self) -> usize;
    fn embed(&mut self, mono: &Tensor) -> Result<Tensor>;
}

/// Video encoder producing a token sequence: `[B, ...] → [B, S, D]`.
pub trait VideoEncoder: Send {
    fn width(&self) -> usize;
    fn encode(&mut self, videos: &Tensor) -> Result<Tensor>;
}

/// Grapheme-to-phoneme converter.
pub trait Phonemizer: Send {
    fn phonemize(&mut self, text: &str) -> Result<Vec<String>>;
    /// Index of a phoneme symbol in the inventory.
    fn symbol_index(&self, phoneme: &str) -> Option<usize>;
    fn num_symbols(&self) -> usize;
}

/// Backbones available to conditioner construction, keyed by conditioner id.
///
/// Anything not registered is loaded natively where an adapter exists,
/// from `<dir>/<model name>` or the Hugging Face Hub.
#[derive(Default)]
pub struct Backbones {
    dir: Option<PathBuf>,
    text: HashMap<String, Box<dyn TextEncoder>>,
    image: HashMap<String, Box<dyn ImageEncoder>>,
    audio: HashMap<String, Box<dyn AudioEncoder>>,
    video: HashMap<String, Box<dyn VideoEncoder>>,
    phonemizers: HashMap<String, Box<dyn Phonemizer>>,
    pretransforms: HashMap<String, Arc<dyn Pretransform>>,
    tokenizers: HashMap<String, Tokenizer>,
}

impl Backbones {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory holding pretrained backbones (`<dir>/t5-base/...`).
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_text_encoder(mut self, id: &str, encoder: Box<dyn TextEncoder>) -> Self {
        self.text.insert(id.to_string(), encoder);
        self
    }

    pub fn with_image_encoder(mut self, id: &str, encoder: Box<dyn ImageEncoder>) -> Self {
        self.image.insert(id.to_string(), encoder);
        self
    }

    pub fn with_audio_encoder(mut self, id: &str, encoder: Box<dyn AudioEncoder>) -> Self {
        self.audio.insert(id.to_string(), encoder);
        self
    }

    pub fn with_video_encoder(mut self, id: &str, encoder: Box<dyn VideoEncoder>) -> Self {
        self.video.insert(id.to_string(), encoder);
        self
    }

    pub fn with_phonemizer(mut self, id: &str, phonemizer: Box<dyn Phonemizer>) -> Self {
        self.phonemizers.insert(id.to_string(), phonemizer);
        self
    }

    pub fn with_pretransform(mut self, id: &str, pretransform: Arc<dyn Pretransform>) -> Self {
        self.pretransforms.insert(id.to_string(), pretransform);
        self
    }

    pub fn with_tokenizer(mut self, id: &str, tokenizer: Tokenizer) -> Self {
        self.tokenizers.insert(id.to_string(), tokenizer);
        self
    }

    fn source(&self, name: &str) -> ModelSource {
        match &self.dir {
            Some(dir) => ModelSource::Local(dir.join(name)),
            None => ModelSource::Hub(name.to_string()),
        }
    }

    fn missing(id: &str, what: &str) -> Error {
        Error::Config(format!(
            "conditioner {id}: no {what} registered; supply one through Backbones"
        ))
    }

    /// The injected text encoder for `id`, or a native T5 encoder for `t5_model`.
    pub(crate) fn take_text(
        &mut self,
        id: &str,
        t5_model: Option<&str>,
        device: &Device,
        dtype: DType,
    ) -> Result<Box<dyn TextEncoder>> {
        if let Some(encoder) = self.text.remove(id) {
            return Ok(encoder);
        }
        match t5_model {
            Some(name) => Ok(Box::new(T5TextEncoder::load(
                &self.source(name),
                device,
                dtype,
            )?)),
            None => Err(Self::missing(id, "text encoder")),
        }
    }

    pub(crate) fn take_image(&mut self, id: &str) -> Result<Box<dyn ImageEncoder>> {
        self.image.remove(id).ok_or_else(|| Self::missing(id, "image encoder"))
    }

    pub(crate) fn take_audio(&mut self, id: &str) -> Result<Box<dyn AudioEncoder>> {
        self.audio.remove(id).ok_or_else(|| Self::missing(id, "audio encoder"))
    }

    pub(crate) fn take_video(&mut self, id: &str) -> Result<Box<dyn VideoEncoder>> {
        self.video.remove(id).ok_or_else(|| Self::missing(id, "video encoder"))
    }

    pub(crate) fn take_phonemizer(&mut self, id: &str) -> Result<Box<dyn Phonemizer>> {
        self.phonemizers
            .remove(id)
            .ok_or_else(|| Self::missing(id, "phonemizer"))
    }

    pub(crate) fn take_pretransform(&mut self, id: &str) -> Option<Arc<dyn Pretransform>> {
        self.pretransforms.remove(id)
    }

    /// The injected tokenizer for `id`, or `tokenizer.json` from `name`.
    pub(crate) fn take_tokenizer(&mut self, id: &str, name: &str) -> Result<Tokenizer> {
        if let Some(tokenizer) = self.tokenizers.remove(id) {
            return Ok(tokenizer);
        }
        let path = self.source(name).resolve("tokenizer.json")?;
        tracing::info!("Loading tokenizer for {id} from {:?}", path);
        Ok(Tokenizer::from_file(&path)?)
    }
}

/// Tokenize a batch, truncating to `max_length` (keeping the final special
/// token) and right-padding with `pad_id`.
///
/// Returns `(ids [B, L], mask [B, L])` with mask 1.0 on real tokens.
pub(crate) fn tokenize_padded(
    tokenizer: &Tokenizer,
    texts: &[String],
    max_length: Option<usize>,
    pad_id: u32,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let mut rows = Vec::with_capacity(texts.len());
    for text in texts {
        let encoding = tokenizer.encode(text.as_str(), true)?;
        let mut ids = encoding.get_ids().to_vec();
        if let Some(max) = max_length
            && ids.len() > max
        {
            let last = ids[ids.len() - 1];
            ids.truncate(max.saturating_sub(1));
            if max > 0 {
                ids.push(last);
            }
        }
        rows.push(ids);
    }

    let length = match max_length {
        Some(max) => max,
        None => rows.iter().map(Vec::len).max().unwrap_or(0),
    };
    let batch = rows.len();
    let mut ids = Vec::with_capacity(batch * length);
    let mut mask = Vec::with_capacity(batch * length);
    for row in &rows {
        ids.extend_from_slice(row);
        ids.extend(std::iter::repeat_n(pad_id, length - row.len()));
        mask.extend(std::iter::repeat_n(1f32, row.len()));
        mask.extend(std::iter::repeat_n(0f32, length - row.len()));
    }
    Ok((
        Tensor::from_vec(ids, (batch, length), device)?,
        Tensor::from_vec(mask, (batch, length), device)?,
    ))
}

/// Native T5 encoder (`config.json`, `model.safetensors`, `tokenizer.json`).
pub struct T5TextEncoder {
    model: t5::T5EncoderModel,
    tokenizer: Tokenizer,
    width: usize,
    pad_id: u32,
}

impl T5TextEncoder {
    pub fn load(source: &ModelSource, device: &Device, dtype: DType) -> Result<Self> {
        let config_path = source.resolve("config.json")?;
        let weights_path = source.resolve("model.safetensors")?;
        let tokenizer_path = source.resolve("tokenizer.json")?;

        let config: t5::Config = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;

        tracing::info!("Loading T5 encoder weights from {:?}", weights_path);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)
                .map_err(|e| Error::WeightLoad(format!("T5 weights: {e}")))?
        };
        let model = t5::T5EncoderModel::load(vb, &config)
            .map_err(|e| Error::WeightLoad(format!("T5 model init: {e}")))?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| Error::WeightLoad(format!("T5 tokenizer load: {e}")))?;

        Ok(Self {
            model,
            tokenizer,
            width: config.d_model,
            pad_id: config.pad_token_id as u32,
        })
    }
}

impl TextEncoder for T5TextEncoder {
    fn width(&self) -> usize {
        self.width
    }

    fn hidden_states(
        &mut self,
        texts: &[String],
        max_length: Option<usize>,
        _layer_ix: Option<i64>,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        let (ids, mask) = tokenize_padded(&self.tokenizer, texts, max_length, self.pad_id, device)?;
        // The candle encoder takes no attention mask; padded positions are zeroed by the caller.
        let hidden = self.model.forward(&ids)?;
        Ok((hidden, mask))
    }
}
