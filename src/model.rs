//! Model components for ThinkSound.
//!
//! ## Components
//!
//! - [`conditioner`] — metadata → conditioning tokens (features, text, scalars, audio)
//! - [`transformer`] — the conditional diffusion transformer with classifier-free guidance
//! - [`pretransform`] — waveform ↔ latent maps around the diffusion model
//! - [`wrapper`] — conditioner + transformer + pretransform, and the routing between them

pub mod conditioner;
pub mod pretransform;
pub mod transformer;
pub mod wrapper;
