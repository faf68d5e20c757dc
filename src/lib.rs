// src/lib.rs
// Public library surface for the binary and the integration tests.

pub mod broker;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod processor;
pub mod record;
pub mod scraper;

// ---- Re-exports for stable public API ----
pub use crate::broker::{BrokerConfig, WorkBroker};
pub use crate::context::AppContext;
pub use crate::control::{Command, Control, Reply};
pub use crate::error::{ErrorKind, PipelineError, Result};
pub use crate::inference::{InferenceResult, InferenceService};
pub use crate::processor::{JsonlSink, MemorySink, PostSink, RecordProcessor};
pub use crate::record::{Record, RequestId, ScoredRecord, WorkItem};
pub use crate::scraper::{ScraperState, Supervisor};
