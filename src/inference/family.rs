// src/inference/family.rs
//! Model families and the parameter bundle each one is loaded from.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use super::loader::{Loader, SequenceLoader, SubwordLoader};
use crate::error::PipelineError;

/// Closed set of supported model families. Names match the keys used in `model_configs.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFamily {
    /// Fixed vocabulary, padded token sequence plus a ticker index.
    #[serde(rename = "lstmcnn_model")]
    SequenceCnn,
    /// Subword tokenizer (`tokenizer.json`) input.
    #[serde(rename = "transformer_model")]
    Transformer,
}

impl ModelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::SequenceCnn => "lstmcnn_model",
            ModelFamily::Transformer => "transformer_model",
        }
    }

    pub(crate) fn loader(&self) -> Box<dyn Loader> {
        match self {
            ModelFamily::SequenceCnn => Box::new(SequenceLoader),
            ModelFamily::Transformer => Box::new(SubwordLoader),
        }
    }

    pub(crate) fn default_max_len(&self) -> usize {
        match self {
            ModelFamily::SequenceCnn => 30,
            ModelFamily::Transformer => 512,
        }
    }
}

impl FromStr for ModelFamily {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lstmcnn_model" => Ok(ModelFamily::SequenceCnn),
            "transformer_model" => Ok(ModelFamily::Transformer),
            other => Err(PipelineError::ModelLoadFailure(format!(
                "model family '{other}' is not registered"
            ))),
        }
    }
}

fn default_num_classes() -> usize {
    3
}

/// Family-specific parameters. Paths are opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Classifier checkpoint (JSON).
    pub weights_path: PathBuf,
    /// Word index JSON for the sequence family, `tokenizer.json` for the transformer family.
    #[serde(default)]
    pub vocab_path: Option<PathBuf>,
    #[serde(default)]
    pub ticker_vocab_path: Option<PathBuf>,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default)]
    pub max_len: Option<usize>,
    #[serde(default)]
    pub pad_token: u32,
    /// Optional human labels, one per class.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Class reported by the neutral fallback; defaults to the middle class.
    #[serde(default)]
    pub neutral_class: Option<usize>,
}

impl ModelParams {
    pub fn new(weights_path: impl Into<PathBuf>) -> Self {
        Self {
            weights_path: weights_path.into(),
            vocab_path: None,
            ticker_vocab_path: None,
            num_classes: default_num_classes(),
            max_len: None,
            pad_token: 0,
            labels: Vec::new(),
            neutral_class: None,
        }
    }

    pub fn neutral_class(&self) -> usize {
        self.neutral_class
            .filter(|c| *c < self.num_classes)
            .unwrap_or(self.num_classes / 2)
    }
}

/// Model identifier + family + parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    pub name: String,
    pub family: ModelFamily,
    pub params: ModelParams,
}

impl ModelBundle {
    pub fn new(name: impl Into<String>, family: ModelFamily, params: ModelParams) -> Self {
        Self {
            name: name.into(),
            family,
            params,
        }
    }
}
