// src/inference/predict.rs
//! Encoded input + loaded model -> [`InferenceResult`].

use super::loader::LoadedModel;
use super::preprocess::Encoded;
use super::InferenceResult;
use crate::error::{PipelineError, Result};

pub trait Predictor: Send + Sync {
    fn predict(
        &self,
        model: &LoadedModel,
        input: &Encoded,
        ticker: Option<&str>,
    ) -> Result<InferenceResult>;
}

/// Sequence family: token rows plus the ticker row.
pub struct SequencePredictor;

impl Predictor for SequencePredictor {
    fn predict(
        &self,
        model: &LoadedModel,
        input: &Encoded,
        ticker: Option<&str>,
    ) -> Result<InferenceResult> {
        let mut logits = pooled_logits(model, input)?;
        if !model.head.ticker_logits.is_empty() {
            // 0 is the unknown ticker
            let idx = ticker
                .and_then(|t| model.ticker_index.get(&crate::record::normalize_ticker(t)))
                .copied()
                .unwrap_or(0);
            let row = model.head.ticker_logits.get(idx).ok_or_else(|| {
                PipelineError::InferenceFailure(format!("ticker index {idx} out of range"))
            })?;
            for (l, r) in logits.iter_mut().zip(row) {
                *l += r;
            }
        }
        finish(model, &logits)
    }
}

/// Subword family: token rows only, ticker ignored.
pub struct SubwordPredictor;

impl Predictor for SubwordPredictor {
    fn predict(
        &self,
        model: &LoadedModel,
        input: &Encoded,
        _ticker: Option<&str>,
    ) -> Result<InferenceResult> {
        let logits = pooled_logits(model, input)?;
        finish(model, &logits)
    }
}

/// bias + mean of attended token rows.
fn pooled_logits(model: &LoadedModel, input: &Encoded) -> Result<Vec<f32>> {
    if input.ids.len() != input.mask.len() {
        return Err(PipelineError::InferenceFailure(format!(
            "{} ids but {} mask entries",
            input.ids.len(),
            input.mask.len()
        )));
    }
    let c = model.head.num_classes;
    let mut acc = vec![0f32; c];
    let mut n = 0usize;
    for (id, m) in input.ids.iter().zip(&input.mask) {
        if *m == 0 {
            continue;
        }
        let row = model.head.token_logits.get(*id as usize).ok_or_else(|| {
            PipelineError::InferenceFailure(format!("token id {id} out of range"))
        })?;
        for (a, r) in acc.iter_mut().zip(row) {
            *a += r;
        }
        n += 1;
    }
    let denom = n.max(1) as f32;
    Ok(acc
        .iter()
        .zip(&model.head.bias)
        .map(|(a, b)| a / denom + b)
        .collect())
}

/// Shared normalization: softmax across classes, arg-max class.
fn finish(model: &LoadedModel, logits: &[f32]) -> Result<InferenceResult> {
    let probabilities = softmax(logits)?;
    let class = argmax(&probabilities);
    Ok(InferenceResult {
        class,
        label: model.bundle.params.labels.get(class).cloned(),
        probabilities,
        model: model.name().to_string(),
        fallback: false,
    })
}

pub fn softmax(logits: &[f32]) -> Result<Vec<f32>> {
    if logits.is_empty() || logits.iter().any(|l| !l.is_finite()) {
        return Err(PipelineError::InferenceFailure(
            "non-finite or empty logits".into(),
        ));
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    Ok(exps.into_iter().map(|e| e / sum).collect())
}

/// First index of the maximum.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(p.len(), 3);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(p.iter().all(|x| (0.0..=1.0).contains(x)));
        assert_eq!(argmax(&p), 2);
    }

    #[test]
    fn softmax_is_stable_for_large_logits() {
        let p = softmax(&[1000.0, 1000.0]).unwrap();
        assert!((p[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn softmax_rejects_nan() {
        assert!(softmax(&[f32::NAN, 1.0]).is_err());
        assert!(softmax(&[]).is_err());
    }

    #[test]
    fn argmax_prefers_first_tie() {
        assert_eq!(argmax(&[0.4, 0.4, 0.2]), 0);
    }
}
