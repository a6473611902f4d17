//! ThinkSound video-to-audio generation in pure Rust.
//!
//! A candle-based implementation of the ThinkSound conditioning and guided
//! sampling core: heterogeneous conditioning (video features, captions,
//! chain-of-thought text, scalars) is encoded into token sequences, fused by a
//! diffusion transformer with classifier-free guidance, and integrated from
//! noise by a rectified-flow or v-objective sampler.
//!
//! ## Architecture
//!
//! ```text
//! metadata ─→ MultiConditioner ─→ {key → (tokens, mask)}
//!                                        ↓ get_conditioning_inputs
//!                    cross-attn / global / prepend / concat / add
//!                                        ↓
//! noise ─→ sampler loop ─→ DiffusionTransformer (CFG, rescale) ─→ latents
//!              ↑ inpainting mask                                    ↓
//!         init audio ─→ pretransform.encode         pretransform.decode ─→ audio
//! ```
//!
//! ## Modules
//!
//! - [`audio`] — WAV I/O, resampling, channel adaption
//! - [`config`] — model / diffusion / pretransform configuration
//! - [`checkpoint`] — model file resolution (local or Hugging Face Hub)
//! - [`model`] — conditioners, diffusion transformer, pretransform, model wrapper
//! - [`scheduler`] — rectified-flow and v-objective step schedules
//! - [`pipeline`] — `generate_diffusion_cond`, inpainting masks, sampling loop
//! - [`demo`] — two-stage video → audio demo orchestration

pub mod audio;
pub mod checkpoint;
pub mod config;
pub mod demo;
pub mod model;
pub mod pipeline;
pub mod scheduler;

mod error;

pub use error::{Error, Result, TokenizerError};
