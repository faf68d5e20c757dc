// src/inference/preprocess.rs
//! Text -> model input encoders.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::error::{PipelineError, Result};

/// Model-ready input: token ids plus a mask of positions that carry content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub ids: Vec<u32>,
    pub mask: Vec<u8>,
}

impl Encoded {
    pub fn attended(&self) -> usize {
        self.mask.iter().filter(|m| **m != 0).count()
    }
}

pub trait Preprocessor: Send + Sync {
    fn preprocess(&self, text: &str) -> Result<Encoded>;
}

static RE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"http\S+").expect("url regex"));
static RE_HASHTAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"#\w+").expect("hashtag regex"));
static RE_NON_ALPHA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z\s]").expect("alpha regex"));
static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").expect("spaces regex"));

/// Fixed-vocabulary encoder: word lookup, pad/truncate to `max_len`.
#[derive(Debug, Clone)]
pub struct SequenceEncoder {
    word_to_index: HashMap<String, u32>,
    max_len: usize,
    pad_token: u32,
}

impl SequenceEncoder {
    pub fn new(word_to_index: HashMap<String, u32>, max_len: usize, pad_token: u32) -> Self {
        Self {
            word_to_index,
            max_len,
            pad_token,
        }
    }

    pub fn max_index(&self) -> Option<u32> {
        self.word_to_index.values().copied().max()
    }

    /// Lowercase, drop URLs and hashtags, keep letters only.
    pub fn clean_text(text: &str) -> String {
        let lower = text.to_lowercase();
        let s = RE_URL.replace_all(&lower, "");
        let s = RE_HASHTAG.replace_all(&s, "");
        let s = RE_NON_ALPHA.replace_all(&s, "");
        let s = RE_SPACES.replace_all(&s, " ");
        s.trim().to_string()
    }
}

impl Preprocessor for SequenceEncoder {
    fn preprocess(&self, text: &str) -> Result<Encoded> {
        let cleaned = Self::clean_text(text);
        let mut ids: Vec<u32> = cleaned
            .split_whitespace()
            .map(|w| *self.word_to_index.get(w).unwrap_or(&self.pad_token))
            .take(self.max_len)
            .collect();
        ids.resize(self.max_len, self.pad_token);
        let mask = ids.iter().map(|id| u8::from(*id != self.pad_token)).collect();
        Ok(Encoded { ids, mask })
    }
}

/// Subword encoder backed by a HuggingFace `tokenizer.json`.
pub struct SubwordEncoder {
    tokenizer: tokenizers::Tokenizer,
    max_len: usize,
}

impl SubwordEncoder {
    pub fn new(tokenizer: tokenizers::Tokenizer, max_len: usize) -> Self {
        Self { tokenizer, max_len }
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

impl Preprocessor for SubwordEncoder {
    fn preprocess(&self, text: &str) -> Result<Encoded> {
        let enc = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| PipelineError::InferenceFailure(format!("tokenizer: {e}")))?;
        let n = enc.get_ids().len().min(self.max_len);
        let ids = enc.get_ids()[..n].to_vec();
        let mask = enc.get_attention_mask()[..n]
            .iter()
            .map(|m| u8::from(*m != 0))
            .collect();
        Ok(Encoded { ids, mask })
    }
}
