// src/control.rs
//! Control surface: a closed set of commands mapped onto supervisor, broker
//! and inference operations. Every call yields a structured [`Reply`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::model::load_model_bundle;
use crate::config::ScraperConfig;
use crate::context::AppContext;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::record::{Record, RequestId};
use crate::scraper::{CommandOutput, ScraperCommand, StartOutcome};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// With `exclusive`, starting a source that is already running is an
    /// `already_exists` error instead of an `already_running` outcome.
    Start {
        source: String,
        #[serde(default)]
        exclusive: bool,
    },
    Stop {
        source: String,
    },
    Restart {
        source: String,
    },
    Pause {
        source: String,
    },
    Resume {
        source: String,
    },
    GetState {
        source: String,
    },
    UpdateConfig {
        source: String,
        config: ScraperConfig,
    },
    ListSources,
    /// Enqueue on the interactive lane.
    Submit {
        record: Record,
    },
    Await {
        request_id: RequestId,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Submit and wait in one call.
    Predict {
        record: Record,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Score outside the broker.
    Evaluate {
        record: Record,
        #[serde(default)]
        save: bool,
    },
    ReloadModel {
        model: String,
    },
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyError {
    pub kind: ErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl Reply {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(e: &PipelineError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ReplyError {
                kind: e.kind(),
                detail: e.to_string(),
            }),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

impl From<Result<Value>> for Reply {
    fn from(r: Result<Value>) -> Self {
        match r {
            Ok(v) => Reply::ok(v),
            Err(e) => Reply::err(&e),
        }
    }
}

#[derive(Clone)]
pub struct Control {
    ctx: Arc<AppContext>,
}

impl Control {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn handle(&self, cmd: Command) -> Reply {
        debug!(target: "context", command = ?cmd, "control command");
        self.run(cmd).await.into()
    }

    fn await_timeout(&self, ms: Option<u64>) -> Duration {
        ms.map(Duration::from_millis)
            .unwrap_or_else(|| self.ctx.config().broker.await_timeout())
    }

    async fn run(&self, cmd: Command) -> Result<Value> {
        match cmd {
            Command::Start { source, exclusive } => {
                let outcome = self.ctx.supervisor()?.start(&source)?;
                if exclusive && outcome == StartOutcome::AlreadyRunning {
                    return Err(PipelineError::AlreadyExists(source));
                }
                Ok(json!({ "source": source, "outcome": outcome }))
            }
            Command::Stop { source } => {
                let outcome = self.ctx.supervisor()?.stop(&source).await?;
                Ok(json!({ "source": source, "exited": outcome.exited }))
            }
            Command::Restart { source } => {
                let outcome = self.ctx.supervisor()?.restart(&source).await?;
                Ok(json!({ "source": source, "outcome": outcome }))
            }
            Command::Pause { source } => self.dispatch(&source, ScraperCommand::Pause),
            Command::Resume { source } => self.dispatch(&source, ScraperCommand::Resume),
            Command::GetState { source } => self.dispatch(&source, ScraperCommand::GetState),
            Command::UpdateConfig { source, config } => {
                let update = self.ctx.supervisor()?.update_config(&source, config);
                to_value(&update)
            }
            Command::ListSources => Ok(json!(self.ctx.supervisor()?.sources())),
            Command::Submit { record } => {
                let id = self.ctx.broker().submit_interactive(record)?;
                Ok(json!({ "request_id": id }))
            }
            Command::Await {
                request_id,
                timeout_ms,
            } => {
                let result = self
                    .ctx
                    .broker()
                    .await_result(request_id, self.await_timeout(timeout_ms))
                    .await?;
                to_value(&result)
            }
            Command::Predict { record, timeout_ms } => {
                let broker = self.ctx.broker();
                let id = broker.submit_interactive(record)?;
                let result = broker
                    .await_result(id, self.await_timeout(timeout_ms))
                    .await?;
                to_value(&result)
            }
            Command::Evaluate { record, save } => {
                let scored = self.ctx.broker().processor().evaluate(record, save).await?;
                to_value(&scored)
            }
            Command::ReloadModel { model } => {
                let bundle = load_model_bundle(&self.ctx.config().model.configs_path, &model)?;
                self.ctx.inference().reload(&bundle)?;
                Ok(json!({ "model": self.ctx.inference().model_name() }))
            }
            Command::Status => {
                let (interactive, background) = self.ctx.broker().queued();
                let sources = self
                    .ctx
                    .supervisor()
                    .map(|s| s.sources())
                    .unwrap_or_default();
                Ok(json!({
                    "model": self.ctx.inference().model_name(),
                    "degraded": self.ctx.degraded(),
                    "sources": sources,
                    "queued": { "interactive": interactive, "background": background },
                    "pending_slots": self.ctx.broker().pending_slots(),
                }))
            }
        }
    }

    fn dispatch(&self, source: &str, cmd: ScraperCommand) -> Result<Value> {
        match self.ctx.supervisor()?.dispatch(source, cmd)? {
            CommandOutput::Done => Ok(json!({ "source": source })),
            CommandOutput::State(snap) => to_value(&snap),
        }
    }
}

fn to_value<T: Serialize>(v: &T) -> Result<Value> {
    serde_json::to_value(v).map_err(|e| PipelineError::Config(format!("serialising reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_from_json() {
        let cmd: Command =
            serde_json::from_str(r#"{"command":"get_state","source":"twitter"}"#).unwrap();
        assert!(matches!(cmd, Command::GetState { ref source } if source == "twitter"));

        let cmd: Command = serde_json::from_str(r#"{"command":"start","source":"x"}"#).unwrap();
        assert!(matches!(cmd, Command::Start { exclusive: false, .. }));

        let cmd: Command = serde_json::from_str(
            r#"{"command":"evaluate","record":{"text":"beat","ticker":"$TSLA"},"save":true}"#,
        )
        .unwrap();
        assert!(matches!(cmd, Command::Evaluate { save: true, .. }));

        assert!(serde_json::from_str::<Command>(r#"{"command":"rm_rf"}"#).is_err());
    }

    #[test]
    fn error_reply_carries_kind_and_detail() {
        let r = Reply::err(&PipelineError::NotFound("x".into()));
        assert!(!r.ok);
        assert_eq!(r.kind(), Some(ErrorKind::NotFound));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["error"]["kind"], "not_found");
        assert!(v.get("data").is_none());
    }
}
