// src/inference/loader.rs
//! Loading model artifacts from a [`ModelBundle`].

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::family::{ModelBundle, ModelParams};
use super::predict::{Predictor, SequencePredictor, SubwordPredictor};
use super::preprocess::{Preprocessor, SequenceEncoder, SubwordEncoder};
use crate::error::{PipelineError, Result};

/// Classifier checkpoint: per-token class logits plus bias, optional ticker rows.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassifierHead {
    pub num_classes: usize,
    pub token_logits: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
    #[serde(default)]
    pub ticker_logits: Vec<Vec<f32>>,
}

impl ClassifierHead {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            PipelineError::ModelLoadFailure(format!("weight file {}: {e}", path.display()))
        })?;
        let head: ClassifierHead = serde_json::from_str(&raw).map_err(|e| {
            PipelineError::ModelLoadFailure(format!(
                "malformed checkpoint {}: {e}",
                path.display()
            ))
        })?;
        head.validate()?;
        Ok(head)
    }

    fn validate(&self) -> Result<()> {
        let c = self.num_classes;
        if c < 2 {
            return Err(PipelineError::ModelLoadFailure(format!(
                "checkpoint declares {c} classes"
            )));
        }
        if self.bias.len() != c {
            return Err(PipelineError::ModelLoadFailure(format!(
                "bias has {} entries, expected {c}",
                self.bias.len()
            )));
        }
        if self.token_logits.is_empty() {
            return Err(PipelineError::ModelLoadFailure(
                "checkpoint has no token rows".into(),
            ));
        }
        let bad_row = self
            .token_logits
            .iter()
            .chain(self.ticker_logits.iter())
            .position(|row| row.len() != c);
        if let Some(i) = bad_row {
            return Err(PipelineError::ModelLoadFailure(format!(
                "row {i} does not have {c} columns"
            )));
        }
        Ok(())
    }

    pub fn vocab_rows(&self) -> usize {
        self.token_logits.len()
    }
}

/// Read-only, shared state of a loaded model.
pub struct LoadedModel {
    pub bundle: ModelBundle,
    pub head: ClassifierHead,
    /// Cashtag -> ticker row. Empty for families without ticker input.
    pub ticker_index: HashMap<String, usize>,
    pub(crate) preprocessor: Box<dyn Preprocessor>,
    pub(crate) predictor: Box<dyn Predictor>,
}

impl LoadedModel {
    pub fn name(&self) -> &str {
        &self.bundle.name
    }

    pub fn num_classes(&self) -> usize {
        self.head.num_classes
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.bundle.name)
            .field("family", &self.bundle.family)
            .field("num_classes", &self.head.num_classes)
            .finish()
    }
}

pub trait Loader: Send + Sync {
    fn load(&self, bundle: &ModelBundle) -> Result<LoadedModel>;
}

fn load_head(params: &ModelParams) -> Result<ClassifierHead> {
    let head = ClassifierHead::from_file(&params.weights_path)?;
    if head.num_classes != params.num_classes {
        return Err(PipelineError::ModelLoadFailure(format!(
            "checkpoint has {} classes, bundle declares {}",
            head.num_classes, params.num_classes
        )));
    }
    if !params.labels.is_empty() && params.labels.len() != params.num_classes {
        return Err(PipelineError::ModelLoadFailure(format!(
            "{} labels for {} classes",
            params.labels.len(),
            params.num_classes
        )));
    }
    Ok(head)
}

fn load_json_map<V: serde::de::DeserializeOwned>(path: &Path) -> Result<HashMap<String, V>> {
    let raw = fs::read_to_string(path).map_err(|e| {
        PipelineError::ModelLoadFailure(format!("vocabulary {}: {e}", path.display()))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        PipelineError::ModelLoadFailure(format!("malformed vocabulary {}: {e}", path.display()))
    })
}

/// Fixed-vocabulary sequence family.
pub struct SequenceLoader;

impl Loader for SequenceLoader {
    fn load(&self, bundle: &ModelBundle) -> Result<LoadedModel> {
        let params = &bundle.params;
        let head = load_head(params)?;

        let vocab_path = params.vocab_path.as_deref().ok_or_else(|| {
            PipelineError::ModelLoadFailure("sequence model needs vocab_path".into())
        })?;
        let word_to_index: HashMap<String, u32> = load_json_map(vocab_path)?;
        let max_len = params
            .max_len
            .unwrap_or_else(|| bundle.family.default_max_len());
        let encoder = SequenceEncoder::new(word_to_index, max_len, params.pad_token);
        if let Some(max) = encoder.max_index() {
            if max as usize >= head.vocab_rows() {
                return Err(PipelineError::ModelLoadFailure(format!(
                    "vocabulary index {max} exceeds {} checkpoint rows",
                    head.vocab_rows()
                )));
            }
        }

        let ticker_index: HashMap<String, usize> = match params.ticker_vocab_path.as_deref() {
            Some(p) => load_json_map::<usize>(p)?
                .into_iter()
                .map(|(k, v)| (crate::record::normalize_ticker(&k), v))
                .collect(),
            None => HashMap::new(),
        };
        if let Some(max) = ticker_index.values().max() {
            if *max >= head.ticker_logits.len() {
                return Err(PipelineError::ModelLoadFailure(format!(
                    "ticker index {max} exceeds {} ticker rows",
                    head.ticker_logits.len()
                )));
            }
        }

        debug!(target: "inference", tickers = ticker_index.len(), max_len, "sequence vocabulary loaded");
        Ok(LoadedModel {
            bundle: bundle.clone(),
            head,
            ticker_index,
            preprocessor: Box::new(encoder),
            predictor: Box::new(SequencePredictor),
        })
    }
}

/// Subword tokenizer family.
pub struct SubwordLoader;

impl Loader for SubwordLoader {
    fn load(&self, bundle: &ModelBundle) -> Result<LoadedModel> {
        let params = &bundle.params;
        let head = load_head(params)?;

        let tok_path = match params.vocab_path.clone() {
            Some(p) => p,
            None => params
                .weights_path
                .parent()
                .map(|d| d.join("tokenizer.json"))
                .ok_or_else(|| {
                    PipelineError::ModelLoadFailure("cannot locate tokenizer.json".into())
                })?,
        };
        let tokenizer = tokenizers::Tokenizer::from_file(&tok_path).map_err(|e| {
            PipelineError::ModelLoadFailure(format!("tokenizer {}: {e}", tok_path.display()))
        })?;
        let max_len = params
            .max_len
            .unwrap_or_else(|| bundle.family.default_max_len());
        let encoder = SubwordEncoder::new(tokenizer, max_len);
        if encoder.vocab_size() > head.vocab_rows() {
            return Err(PipelineError::ModelLoadFailure(format!(
                "tokenizer has {} ids but checkpoint only {} rows",
                encoder.vocab_size(),
                head.vocab_rows()
            )));
        }

        info!(target: "inference", path = %tok_path.display(), "tokenizer loaded");
        Ok(LoadedModel {
            bundle: bundle.clone(),
            head,
            ticker_index: HashMap::new(),
            preprocessor: Box::new(encoder),
            predictor: Box::new(SubwordPredictor),
        })
    }
}
