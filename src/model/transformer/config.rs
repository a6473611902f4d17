//! Diffusion transformer configuration.

use serde::{Deserialize, Serialize};

/// Backbone selection for the diffusion transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformerType {
    #[serde(rename = "x-transformers")]
    XTransformers,
    #[serde(rename = "continuous_transformer")]
    ContinuousTransformer,
    #[serde(rename = "mm_transformer")]
    MmTransformer,
}

/// Where the (timestep-fused) global embedding enters the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalCondType {
    /// One extra prepended token.
    #[serde(rename = "prepend")]
    Prepend,
    /// Adaptive layer-norm scale/shift/gate in every block.
    #[serde(rename = "adaLN")]
    AdaLn,
}

/// Configuration for [`super::DiffusionTransformer`].
///
/// Dimensions set to 0 disable the corresponding conditioning path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiTConfig {
    /// Channels of the diffused signal (latent channels for latent diffusion).
    #[serde(default = "default_io_channels")]
    pub io_channels: usize,

    /// Timesteps merged into one token by patchify.
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,

    /// Transformer width.
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,

    /// Width of cross-attention conditioning tokens.
    #[serde(default)]
    pub cond_token_dim: usize,

    /// Project cross-attention tokens to `embed_dim` (otherwise keep `cond_token_dim`).
    #[serde(default = "default_true")]
    pub project_cond_tokens: bool,

    /// Width of the global conditioning vector.
    #[serde(default)]
    pub global_cond_dim: usize,

    /// Project global conditioning to `embed_dim`.
    #[serde(default = "default_true")]
    pub project_global_cond: bool,

    /// Channels concatenated onto the input before the backbone.
    #[serde(default)]
    pub input_concat_dim: usize,

    /// Width of prepended conditioning tokens.
    #[serde(default)]
    pub prepend_cond_dim: usize,

    /// Width of additive conditioning (frame-aligned features summed into the sequence).
    #[serde(default)]
    pub add_token_dim: usize,

    /// Run additive conditioning through SiLU + gated ConvMLP first.
    #[serde(default)]
    pub use_mlp: bool,

    /// Number of transformer blocks.
    #[serde(default = "default_depth")]
    pub depth: usize,

    /// Number of attention heads.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    /// Feed-forward expansion ratio.
    #[serde(default = "default_ff_mult")]
    pub ff_mult: f64,

    #[serde(default = "default_transformer_type")]
    pub transformer_type: TransformerType,

    #[serde(default = "default_global_cond_type")]
    pub global_cond_type: GlobalCondType,
}

impl Default for DiTConfig {
    fn default() -> Self {
        Self {
            io_channels: default_io_channels(),
            patch_size: default_patch_size(),
            embed_dim: default_embed_dim(),
            cond_token_dim: 0,
            project_cond_tokens: true,
            global_cond_dim: 0,
            project_global_cond: true,
            input_concat_dim: 0,
            prepend_cond_dim: 0,
            add_token_dim: 0,
            use_mlp: false,
            depth: default_depth(),
            num_heads: default_num_heads(),
            ff_mult: default_ff_mult(),
            transformer_type: default_transformer_type(),
            global_cond_type: default_global_cond_type(),
        }
    }
}

impl DiTConfig {
    /// Per-head width.
    pub fn dim_heads(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// Width of cross-attention tokens after `to_cond_embed`.
    pub fn cond_embed_dim(&self) -> usize {
        if self.project_cond_tokens {
            self.embed_dim
        } else {
            self.cond_token_dim
        }
    }

    /// Width of the global embedding after `to_global_embed`.
    pub fn global_embed_dim(&self) -> usize {
        if self.project_global_cond {
            self.embed_dim
        } else {
            self.global_cond_dim
        }
    }

    /// Width of additive conditioning after the optional ConvMLP.
    pub fn add_embed_dim(&self) -> usize {
        if self.project_cond_tokens {
            self.embed_dim
        } else {
            self.add_token_dim
        }
    }

    /// Channels entering the pre-processing conv.
    pub fn dim_in(&self) -> usize {
        self.io_channels + self.input_concat_dim
    }
}

fn default_io_channels() -> usize {
    64
}
fn default_patch_size() -> usize {
    1
}
fn default_embed_dim() -> usize {
    768
}
fn default_true() -> bool {
    true
}
fn default_depth() -> usize {
    12
}
fn default_num_heads() -> usize {
    8
}
fn default_ff_mult() -> f64 {
    4.0
}
fn default_transformer_type() -> TransformerType {
    TransformerType::XTransformers
}
fn default_global_cond_type() -> GlobalCondType {
    GlobalCondType::Prepend
}
