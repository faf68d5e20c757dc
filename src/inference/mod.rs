// src/inference/mod.rs
//! Inference service: one loaded model shared by every prediction.
//!
//! The model is loaded once at startup and read concurrently afterwards.
//! `reload` takes the write side of the lock for the whole load, so new
//! predictions wait until the swap is complete. A failed reload keeps the
//! previous model.

pub mod family;
pub mod loader;
pub mod predict;
pub mod preprocess;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{PipelineError, Result};
pub use family::{ModelBundle, ModelFamily, ModelParams};
pub use loader::{ClassifierHead, LoadedModel};

/// Model output for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub class: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub probabilities: Vec<f32>,
    pub model: String,
    /// True when the neutral fallback replaced a failed prediction.
    #[serde(default)]
    pub fallback: bool,
}

impl InferenceResult {
    /// Uniform distribution over `num_classes`, reporting `class`.
    pub fn neutral(model: &str, num_classes: usize, class: usize, label: Option<String>) -> Self {
        let n = num_classes.max(1);
        Self {
            class: class.min(n - 1),
            label,
            probabilities: vec![1.0 / n as f32; n],
            model: model.to_string(),
            fallback: true,
        }
    }
}

const UNLOADED_CLASSES: usize = 3;

#[derive(Debug, Default)]
pub struct InferenceService {
    model: RwLock<Option<LoadedModel>>,
}

impl InferenceService {
    /// Empty service; predictions fail until a model is loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct and load in one step.
    pub fn with_bundle(bundle: &ModelBundle) -> Result<Self> {
        let svc = Self::new();
        svc.reload(bundle)?;
        Ok(svc)
    }

    /// Load (or replace) the model. Blocks predictions for the duration.
    pub fn reload(&self, bundle: &ModelBundle) -> Result<()> {
        let mut guard = self.model.write();
        match bundle.family.loader().load(bundle) {
            Ok(m) => {
                info!(
                    target: "inference",
                    model = %bundle.name,
                    family = bundle.family.as_str(),
                    classes = m.num_classes(),
                    "model loaded"
                );
                *guard = Some(m);
                Ok(())
            }
            Err(e) => {
                error!(target: "inference", model = %bundle.name, error = %e, "model load failed");
                Err(e)
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.read().is_some()
    }

    pub fn model_name(&self) -> Option<String> {
        self.model.read().as_ref().map(|m| m.name().to_string())
    }

    pub fn num_classes(&self) -> usize {
        self.model
            .read()
            .as_ref()
            .map(|m| m.num_classes())
            .unwrap_or(UNLOADED_CLASSES)
    }

    /// preprocess -> predict under the shared lock.
    pub fn infer(&self, text: &str, ticker: Option<&str>) -> Result<InferenceResult> {
        let guard = self.model.read();
        let model = guard
            .as_ref()
            .ok_or_else(|| PipelineError::InferenceFailure("no model loaded".into()))?;
        let encoded = model.preprocessor.preprocess(text)?;
        let result = model.predictor.predict(model, &encoded, ticker)?;
        if result.probabilities.len() != model.num_classes() {
            return Err(PipelineError::InferenceFailure(format!(
                "model produced {} probabilities for {} classes",
                result.probabilities.len(),
                model.num_classes()
            )));
        }
        Ok(result)
    }

    /// Result used when a prediction fails.
    pub fn neutral(&self) -> InferenceResult {
        match self.model.read().as_ref() {
            Some(m) => {
                let params = &m.bundle.params;
                let class = params.neutral_class();
                InferenceResult::neutral(
                    m.name(),
                    m.num_classes(),
                    class,
                    params.labels.get(class).cloned(),
                )
            }
            None => InferenceResult::neutral("unloaded", UNLOADED_CLASSES, 1, None),
        }
    }
}
