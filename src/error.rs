//! Error types for thinksound-rs.

use std::fmt;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Tensor op or VarBuilder lookup failure.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Text tokenization (T5, LUT conditioners).
    #[error("tokenizer: {0}")]
    Tokenizer(TokenizerError),

    /// Audio processing error (resampling, WAV I/O).
    #[error("audio: {0}")]
    Audio(String),

    /// Missing or malformed checkpoint / feature tensors.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// A conditioner `type` tag that is not part of the closed set.
    #[error("unknown conditioner type: {0}")]
    UnknownConditioner(String),

    /// A conditioning key missing from batch metadata with no default registered.
    #[error("conditioner key {key} not found in batch metadata")]
    MissingConditioningKey { key: String },

    /// Violated call contract (no conditioning, paste range, causal mode, ...).
    #[error("invariant: {0}")]
    Invariant(String),

    /// Demo orchestration failure, carrying captured stage output.
    #[error("demo: {0}")]
    Demo(String),

    /// Filesystem error (model files, feature files, demo session dirs).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed backbone JSON (T5 `config.json`).
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Hub download failure.
    #[error("hf-hub: {0}")]
    HfHub(String),
}

/// Wrapper for tokenizer errors (tokenizers::Error doesn't impl std::error::Error).
#[derive(Debug)]
pub struct TokenizerError(pub String);

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<tokenizers::Error> for Error {
    fn from(error: tokenizers::Error) -> Self {
        Error::Tokenizer(TokenizerError(error.to_string()))
    }
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}

impl From<hf_hub::api::sync::ApiError> for Error {
    fn from(error: hf_hub::api::sync::ApiError) -> Self {
        Error::HfHub(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_names_the_key() {
        let err = Error::MissingConditioningKey {
            key: "video_features".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("video_features"), "message was {msg}");
    }

    #[test]
    fn hound_errors_become_audio_errors() {
        let err: Error = hound::Error::Unsupported.into();
        assert!(matches!(err, Error::Audio(_)));
    }
}
