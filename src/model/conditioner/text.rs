//! Text conditioners: T5, CLAP text, CLIP/MetaCLIP text, token lookup, phonemes.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, VarBuilder};
use tokenizers::Tokenizer;

use super::backbone::{BackboneOwnership, Backbones, Phonemizer, TextEncoder, tokenize_padded};
use super::config::{ClapTextOptions, ClipTextOptions, LutOptions, PhonemeOptions, T5Options};
use super::value::{ConditionValue, texts};
use super::{ConditionerOutput, ProjOut};
use crate::Result;

/// Zero the embeddings of padded positions: `[B, L, D] * mask[B, L, 1]`.
fn apply_mask(embeds: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = mask.to_dtype(embeds.dtype())?.unsqueeze(2)?;
    Ok(embeds.broadcast_mul(&mask)?)
}

/// T5 encoder hidden states, projected and masked.
pub struct T5Conditioner {
    encoder: Box<dyn TextEncoder>,
    proj_out: ProjOut,
    max_length: usize,
    ownership: BackboneOwnership,
    dtype: DType,
}

impl T5Conditioner {
    pub fn new(
        opts: &T5Options,
        id: &str,
        vb: VarBuilder,
        backbones: &mut Backbones,
        device: &Device,
    ) -> Result<Self> {
        let encoder = backbones.take_text(id, Some(&opts.t5_model_name), device, vb.dtype())?;
        let proj_out = ProjOut::new(encoder.width(), opts.output_dim, opts.project_out, vb.clone())?;
        Ok(Self {
            encoder,
            proj_out,
            max_length: opts.max_length,
            ownership: BackboneOwnership::from_flag(opts.enable_grad),
            dtype: vb.dtype(),
        })
    }

    pub fn ownership(&self) -> BackboneOwnership {
        self.ownership
    }

    pub fn forward(
        &mut self,
        inputs: &[ConditionValue],
        device: &Device,
    ) -> Result<ConditionerOutput> {
        let texts = texts(inputs)?;
        let (hidden, mask) =
            self.encoder
                .hidden_states(&texts, Some(self.max_length), None, device)?;
        let embeds = self.proj_out.forward(&hidden.to_dtype(self.dtype)?)?;
        let embeds = apply_mask(&embeds, &mask)?;
        Ok(ConditionerOutput::Paired(embeds, mask))
    }
}

/// CLAP text branch: token features from a hidden layer, or the pooled embedding.
pub struct ClapTextConditioner {
    encoder: Box<dyn TextEncoder>,
    proj_out: ProjOut,
    use_text_features: bool,
    feature_layer_ix: i64,
    ownership: BackboneOwnership,
    dtype: DType,
}

impl ClapTextConditioner {
    pub fn new(
        opts: &ClapTextOptions,
        id: &str,
        vb: VarBuilder,
        backbones: &mut Backbones,
    ) -> Result<Self> {
        let encoder = backbones.take_text(id, None, vb.device(), vb.dtype())?;
        let proj_out = ProjOut::new(opts.width(), opts.output_dim, opts.project_out, vb.clone())?;
        Ok(Self {
            encoder,
            proj_out,
            use_text_features: opts.use_text_features,
            feature_layer_ix: opts.feature_layer_ix,
            ownership: BackboneOwnership::from_flag(opts.finetune),
            dtype: vb.dtype(),
        })
    }

    pub fn ownership(&self) -> BackboneOwnership {
        self.ownership
    }

    pub fn forward(
        &mut self,
        inputs: &[ConditionValue],
        device: &Device,
    ) -> Result<ConditionerOutput> {
        let mut texts = texts(inputs)?;
        let batch = texts.len();
        // CLAP's text branch misbehaves on a batch of one; pad with an empty prompt.
        if batch == 1 {
            texts.push(String::new());
        }

        if self.use_text_features {
            let (hidden, mask) =
                self.encoder
                    .hidden_states(&texts, None, Some(self.feature_layer_ix), device)?;
            let hidden = hidden.narrow(0, 0, batch)?.to_dtype(self.dtype)?;
            let mask = mask.narrow(0, 0, batch)?;
            let embeds = self.proj_out.forward(&hidden)?;
            Ok(ConditionerOutput::Paired(embeds, mask))
        } else {
            let pooled = self.encoder.pooled(&texts, device)?;
            let pooled = pooled.narrow(0, 0, batch)?.to_dtype(self.dtype)?;
            let embeds = self.proj_out.forward(&pooled.unsqueeze(1)?)?;
            Ok(ConditionerOutput::Paired(
                embeds,
                Tensor::ones((batch, 1), DType::F32, device)?,
            ))
        }
    }
}

/// CLIP or MetaCLIP text hidden states, projected.
pub struct ClipTextConditioner {
    encoder: Box<dyn TextEncoder>,
    proj_out: ProjOut,
    max_length: usize,
    ownership: BackboneOwnership,
    dtype: DType,
}

impl ClipTextConditioner {
    pub fn new(
        opts: &ClipTextOptions,
        id: &str,
        vb: VarBuilder,
        backbones: &mut Backbones,
    ) -> Result<Self> {
        let encoder = backbones.take_text(id, None, vb.device(), vb.dtype())?;
        let proj_out = ProjOut::new(encoder.width(), opts.output_dim, opts.project_out, vb.clone())?;
        Ok(Self {
            encoder,
            proj_out,
            max_length: opts.max_length,
            ownership: BackboneOwnership::from_flag(opts.enable_grad),
            dtype: vb.dtype(),
        })
    }

    pub fn ownership(&self) -> BackboneOwnership {
        self.ownership
    }

    pub fn forward(
        &mut self,
        inputs: &[ConditionValue],
        device: &Device,
    ) -> Result<ConditionerOutput> {
        let texts = texts(inputs)?;
        let (hidden, _) =
            self.encoder
                .hidden_states(&texts, Some(self.max_length), None, device)?;
        let embeds = self.proj_out.forward(&hidden.to_dtype(self.dtype)?)?;
        let batch = embeds.dim(0)?;
        Ok(ConditionerOutput::Paired(
            embeds,
            Tensor::ones((batch, 1), DType::F32, device)?,
        ))
    }
}

/// Learned lookup table over a pretrained tokenizer's vocabulary.
pub struct LutConditioner {
    tokenizer: Tokenizer,
    token_embedder: Embedding,
    proj_out: ProjOut,
    max_length: usize,
    pad_id: u32,
}

impl LutConditioner {
    pub fn new(
        opts: &LutOptions,
        id: &str,
        vb: VarBuilder,
        backbones: &mut Backbones,
    ) -> Result<Self> {
        let tokenizer = backbones.take_tokenizer(id, &opts.tokenizer_name)?;
        let vocab = tokenizer.get_vocab_size(true);
        let pad_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| tokenizer.token_to_id("<pad>"))
            .unwrap_or(0);
        Ok(Self {
            token_embedder: candle_nn::embedding(vocab, opts.output_dim, vb.pp("token_embedder"))?,
            proj_out: ProjOut::new(opts.output_dim, opts.output_dim, opts.project_out, vb)?,
            tokenizer,
            max_length: opts.max_length,
            pad_id,
        })
    }

    pub fn forward(
        &mut self,
        inputs: &[ConditionValue],
        device: &Device,
    ) -> Result<ConditionerOutput> {
        let texts = texts(inputs)?;
        let (ids, mask) = tokenize_padded(
            &self.tokenizer,
            &texts,
            Some(self.max_length),
            self.pad_id,
            device,
        )?;
        let embeds = self.proj_out.forward(&self.token_embedder.forward(&ids)?)?;
        let embeds = apply_mask(&embeds, &mask)?;
        Ok(ConditionerOutput::Paired(embeds, mask))
    }
}

/// Padding id in the phoneme table.
const PHONEME_PAD: u32 = 0;
/// Id of phonemes missing from the inventory.
const PHONEME_UNKNOWN: u32 = 1;

fn is_separator(phoneme: &str) -> bool {
    phoneme == " " || (phoneme.len() == 1 && phoneme.chars().all(|c| c.is_ascii_punctuation()))
}

/// Phoneme sequences from a G2P backbone, embedded through a learned table.
pub struct PhonemeConditioner {
    phonemizer: Box<dyn Phonemizer>,
    phoneme_embedder: Embedding,
    proj_out: ProjOut,
    max_length: usize,
}

impl PhonemeConditioner {
    pub fn new(
        opts: &PhonemeOptions,
        id: &str,
        vb: VarBuilder,
        backbones: &mut Backbones,
    ) -> Result<Self> {
        let phonemizer = backbones.take_phonemizer(id)?;
        let rows = phonemizer.num_symbols() + 2;
        Ok(Self {
            phoneme_embedder: candle_nn::embedding(
                rows,
                opts.output_dim,
                vb.pp("phoneme_embedder"),
            )?,
            proj_out: ProjOut::new(opts.output_dim, opts.output_dim, opts.project_out, vb)?,
            phonemizer,
            max_length: opts.max_length,
        })
    }

    /// Phoneme ids for one text: inventory index + 2, or [`PHONEME_UNKNOWN`].
    /// Spaces and punctuation are folded into the `_` separator symbol.
    fn phoneme_ids(&mut self, text: &str) -> Result<Vec<u32>> {
        let phonemes = self.phonemizer.phonemize(text)?;
        let mut ids: Vec<u32> = phonemes
            .iter()
            .map(|p| {
                let symbol = if is_separator(p) { "_" } else { p.as_str() };
                self.phonemizer
                    .symbol_index(symbol)
                    .map_or(PHONEME_UNKNOWN, |i| i as u32 + 2)
            })
            .collect();
        ids.truncate(self.max_length);
        Ok(ids)
    }

    pub fn forward(
        &mut self,
        inputs: &[ConditionValue],
        device: &Device,
    ) -> Result<ConditionerOutput> {
        let rows = texts(inputs)?
            .iter()
            .map(|t| self.phoneme_ids(t))
            .collect::<Result<Vec<_>>>()?;
        let batch = rows.len();
        let length = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let mut ids = Vec::with_capacity(batch * length);
        for row in &rows {
            ids.extend_from_slice(row);
            ids.extend(std::iter::repeat_n(PHONEME_PAD, length - row.len()));
        }
        let ids = Tensor::from_vec(ids, (batch, length), device)?;
        let embeds = self.proj_out.forward(&self.phoneme_embedder.forward(&ids)?)?;
        Ok(ConditionerOutput::Paired(
            embeds,
            Tensor::ones((batch, length), DType::F32, device)?,
        ))
    }
}
