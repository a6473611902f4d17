//! Where model files come from: a local directory or a Hugging Face Hub repo.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::api::sync::Api;

use crate::{Error, Result};

/// A directory-like source of model files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    /// Hub repo id, e.g. `google-t5/t5-base`. Files are cached by hf-hub.
    Hub(String),
}

impl ModelSource {
    /// Treat `spec` as a local path when it exists, otherwise as a Hub repo id.
    pub fn parse(spec: &str) -> Self {
        let path = Path::new(spec);
        if path.exists() {
            Self::Local(path.to_path_buf())
        } else {
            Self::Hub(spec.to_string())
        }
    }

    /// Local path of `file`, downloading it first for Hub sources.
    pub fn resolve(&self, file: &str) -> Result<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(file);
                if path.exists() {
                    Ok(path)
                } else {
                    Err(Error::WeightLoad(format!("missing {}", path.display())))
                }
            }
            Self::Hub(repo) => {
                tracing::info!("Fetching {file} from {repo}");
                let api = Api::new()?;
                Ok(api.model(repo.clone()).get(file)?)
            }
        }
    }

    /// Memory-map safetensors `files` into a VarBuilder.
    pub fn var_builder(
        &self,
        files: &[&str],
        dtype: DType,
        device: &Device,
    ) -> Result<VarBuilder<'static>> {
        let paths = files
            .iter()
            .map(|f| self.resolve(f))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!("Loading weights from {:?}", paths);
        // SAFETY: the files are treated as read-only for the VarBuilder's lifetime.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&paths, dtype, device)
                .map_err(|e| Error::WeightLoad(format!("{self}: {e}")))?
        };
        Ok(vb)
    }
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(dir) => write!(f, "{}", dir.display()),
            Self::Hub(repo) => write!(f, "hf://{repo}"),
        }
    }
}
