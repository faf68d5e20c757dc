// src/config/model.rs
//! `model_configs.json`: named model entries, one of which is selected at startup.
//!
//! ```json
//! {
//!   "lstmcnn": {
//!     "model_name": "lstmcnn_model",
//!     "params": { "weights_path": "lstmcnn/head.json", "vocab_path": "lstmcnn/vocab.json" }
//!   }
//! }
//! ```
//! Relative paths are resolved against the directory of the configs file.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::inference::{ModelBundle, ModelFamily, ModelParams};

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfigEntry {
    pub model_name: String,
    #[serde(default)]
    pub model_lib: Option<String>,
    pub params: ModelParams,
}

pub fn load_model_configs(path: &Path) -> Result<HashMap<String, ModelConfigEntry>> {
    let raw = fs::read_to_string(path).map_err(|e| {
        PipelineError::ModelLoadFailure(format!("reading {}: {e}", path.display()))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        PipelineError::ModelLoadFailure(format!("parsing {}: {e}", path.display()))
    })
}

/// Pick `key` from the configs file and validate its family.
pub fn load_model_bundle(path: &Path, key: &str) -> Result<ModelBundle> {
    let mut configs = load_model_configs(path)?;
    let entry = configs.remove(key).ok_or_else(|| {
        PipelineError::ModelLoadFailure(format!(
            "model '{key}' not found in {}",
            path.display()
        ))
    })?;
    let family: ModelFamily = entry.model_name.parse()?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut params = entry.params;
    params.weights_path = resolve(base, &params.weights_path);
    params.vocab_path = params.vocab_path.map(|p| resolve(base, &p));
    params.ticker_vocab_path = params.ticker_vocab_path.map(|p| resolve(base, &p));
    Ok(ModelBundle::new(key, family, params))
}

fn resolve(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}
