// src/error.rs
//! Error taxonomy shared by the supervisor, the broker and the inference service.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::scraper::lifecycle::ScraperState;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("no scraper registered for source '{0}'")]
    NotFound(String),

    #[error("scraper for source '{0}' is already running")]
    AlreadyExists(String),

    #[error("scraper limit of {ceiling} reached, cannot start '{name}'")]
    CapacityExceeded { name: String, ceiling: usize },

    #[error("cannot {op} while {from:?}")]
    InvalidTransition { op: &'static str, from: ScraperState },

    #[error("setup failed: {0}")]
    SetupFailure(String),

    #[error("login failed: {0}")]
    AuthFailure(String),

    #[error("model load failed: {0}")]
    ModelLoadFailure(String),

    #[error("inference failed: {0}")]
    InferenceFailure(String),

    #[error("no result within {0:?}")]
    TimedOut(Duration),

    #[error("unknown request id {0}")]
    UnknownRequest(uuid::Uuid),

    #[error("malformed queue item: {0}")]
    QueueItemError(String),

    #[error("broker is shut down")]
    BrokerClosed,

    #[error("config error: {0}")]
    Config(String),
}

/// Flat, wire-friendly discriminant of [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    CapacityExceeded,
    InvalidTransition,
    SetupFailure,
    AuthFailure,
    ModelLoadFailure,
    InferenceFailure,
    TimedOut,
    UnknownRequest,
    QueueItemError,
    BrokerClosed,
    Config,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            PipelineError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            PipelineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            PipelineError::SetupFailure(_) => ErrorKind::SetupFailure,
            PipelineError::AuthFailure(_) => ErrorKind::AuthFailure,
            PipelineError::ModelLoadFailure(_) => ErrorKind::ModelLoadFailure,
            PipelineError::InferenceFailure(_) => ErrorKind::InferenceFailure,
            PipelineError::TimedOut(_) => ErrorKind::TimedOut,
            PipelineError::UnknownRequest(_) => ErrorKind::UnknownRequest,
            PipelineError::QueueItemError(_) => ErrorKind::QueueItemError,
            PipelineError::BrokerClosed => ErrorKind::BrokerClosed,
            PipelineError::Config(_) => ErrorKind::Config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let e = PipelineError::CapacityExceeded {
            name: "x".into(),
            ceiling: 2,
        };
        assert_eq!(e.kind(), ErrorKind::CapacityExceeded);
        let s = serde_json::to_string(&e.kind()).unwrap();
        assert_eq!(s, "\"capacity_exceeded\"");
        assert!(e.to_string().contains("limit of 2"));
    }
}
