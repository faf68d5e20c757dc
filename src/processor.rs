// src/processor.rs
//! Record processor: record -> scored record, with optional persistence.

use anyhow::{Context, Result as AnyResult};
use metrics::counter;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::inference::{InferenceResult, InferenceService};
use crate::metrics::{INFERENCE_FALLBACK, PERSIST_ERRORS};
use crate::record::{Record, ScoredRecord};

/// Persistence collaborator.
#[async_trait::async_trait]
pub trait PostSink: Send + Sync {
    async fn save(&self, scored: &ScoredRecord) -> AnyResult<()>;
}

#[derive(Clone)]
pub struct RecordProcessor {
    inference: Arc<InferenceService>,
    sink: Arc<dyn PostSink>,
}

impl RecordProcessor {
    pub fn new(inference: Arc<InferenceService>, sink: Arc<dyn PostSink>) -> Self {
        Self { inference, sink }
    }

    pub fn inference(&self) -> &Arc<InferenceService> {
        &self.inference
    }

    /// Never fails: an inference error becomes the neutral result.
    pub fn score(&self, record: &Record) -> InferenceResult {
        match self.inference.infer(&record.text, Some(&record.ticker)) {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "processor", ticker = %record.ticker, error = %e, "prediction failed, using neutral result");
                counter!(INFERENCE_FALLBACK).increment(1);
                self.inference.neutral()
            }
        }
    }

    /// Failures are logged and counted, not retried.
    pub async fn persist(&self, scored: &ScoredRecord) -> bool {
        match self.sink.save(scored).await {
            Ok(()) => {
                debug!(target: "processor", ticker = %scored.record.ticker, class = scored.result.class, "record saved");
                true
            }
            Err(e) => {
                warn!(target: "processor", ticker = %scored.record.ticker, error = ?e, "failed to save record");
                counter!(PERSIST_ERRORS).increment(1);
                false
            }
        }
    }

    /// Direct, synchronous evaluation outside the broker.
    pub async fn evaluate(&self, record: Record, with_save: bool) -> Result<ScoredRecord> {
        record.validate()?;
        let result = self.score(&record);
        let scored = ScoredRecord { record, result };
        if with_save {
            self.persist(&scored).await;
        }
        Ok(scored)
    }
}

impl std::fmt::Debug for RecordProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordProcessor")
            .field("model", &self.inference.model_name())
            .finish()
    }
}

/// Append-only JSON lines file.
pub struct JsonlSink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait::async_trait]
impl PostSink for JsonlSink {
    async fn save(&self, scored: &ScoredRecord) -> AnyResult<()> {
        let mut line = serde_json::to_string(scored)?;
        line.push('\n');
        let _guard = self.lock.lock().await;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.ok();
        }
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        f.write_all(line.as_bytes()).await?;
        f.flush().await?;
        Ok(())
    }
}

/// In-memory sink for tests and embedding.
#[derive(Default)]
pub struct MemorySink {
    saved: Mutex<Vec<ScoredRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<ScoredRecord> {
        self.saved.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.saved.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.saved.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl PostSink for MemorySink {
    async fn save(&self, scored: &ScoredRecord) -> AnyResult<()> {
        self.saved.lock().push(scored.clone());
        Ok(())
    }
}
