// src/scraper/lifecycle.rs
//! Per-source lifecycle: state, bounded log, task snapshot, pause/stop signals.
//!
//! IDLE -> SETTING_UP -> RUNNING <-> PAUSED -> STOPPED
//!
//! `stop` is valid from any state and is idempotent. Pause and stop are
//! cooperative: the run loop observes them at iteration boundaries.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ScraperConfig;
use crate::error::{PipelineError, Result};

pub const LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScraperState {
    Idle,
    SettingUp,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogKind {
    Error,
    Warning,
    Message,
    Debug,
}

impl LogKind {
    fn as_str(&self) -> &'static str {
        match self {
            LogKind::Error => "ERROR",
            LogKind::Warning => "WARNING",
            LogKind::Message => "MESSAGE",
            LogKind::Debug => "DEBUG",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub kind: LogKind,
    pub at: DateTime<Utc>,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]:{}: {}",
            self.kind.as_str(),
            self.at.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.message
        )
    }
}

/// Copy of a worker's observable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: ScraperState,
    pub logs: Vec<LogEntry>,
    pub current_task: Map<String, Value>,
}

pub struct Lifecycle {
    source: String,
    state: Mutex<ScraperState>,
    logs: Mutex<VecDeque<LogEntry>>,
    task: Mutex<Map<String, Value>>,
    config: RwLock<ScraperConfig>,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new(source: &str, config: ScraperConfig) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            source: source.to_string(),
            state: Mutex::new(ScraperState::Idle),
            logs: Mutex::new(VecDeque::with_capacity(64)),
            task: Mutex::new(Map::new()),
            config: RwLock::new(config),
            cancel: CancellationToken::new(),
            paused,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> ScraperState {
        *self.state.lock()
    }

    fn transition(&self, state: &mut ScraperState, next: ScraperState) {
        *state = next;
        self.log(LogKind::Message, format!("State changed: {next:?}"));
        debug!(target: "scraper", source = %self.source, state = ?next, "state changed");
    }

    /// Run-loop only: IDLE -> SETTING_UP. False once stopped.
    pub(crate) fn begin_setup(&self) -> bool {
        self.advance(ScraperState::Idle, ScraperState::SettingUp)
    }

    /// Run-loop only: SETTING_UP -> RUNNING. False once stopped.
    pub(crate) fn begin_running(&self) -> bool {
        self.advance(ScraperState::SettingUp, ScraperState::Running)
    }

    fn advance(&self, from: ScraperState, to: ScraperState) -> bool {
        let mut s = self.state.lock();
        if *s != from {
            return false;
        }
        self.transition(&mut s, to);
        true
    }

    pub fn pause(&self) -> Result<()> {
        let mut s = self.state.lock();
        if *s != ScraperState::Running {
            return Err(PipelineError::InvalidTransition {
                op: "pause",
                from: *s,
            });
        }
        self.transition(&mut s, ScraperState::Paused);
        self.paused.send_replace(true);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut s = self.state.lock();
        if *s != ScraperState::Paused {
            return Err(PipelineError::InvalidTransition {
                op: "resume",
                from: *s,
            });
        }
        self.transition(&mut s, ScraperState::Running);
        self.paused.send_replace(false);
        Ok(())
    }

    pub fn stop(&self) {
        let mut s = self.state.lock();
        if *s != ScraperState::Stopped {
            self.transition(&mut s, ScraperState::Stopped);
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn config(&self) -> ScraperConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: ScraperConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = config;
        self.log(LogKind::Message, "Config updated.");
        Ok(())
    }

    pub fn log(&self, kind: LogKind, message: impl Into<String>) {
        let mut logs = self.logs.lock();
        logs.push_back(LogEntry {
            kind,
            at: Utc::now(),
            message: message.into(),
        });
        while logs.len() > LOG_CAPACITY {
            logs.pop_front();
        }
    }

    /// Merge keys (last write wins) or, with `overwrite`, replace the snapshot.
    pub fn update_task(&self, partial: Map<String, Value>, overwrite: bool) {
        if overwrite {
            self.log(
                LogKind::Debug,
                format!("Task overwritten: {}", Value::Object(partial.clone())),
            );
            *self.task.lock() = partial;
        } else {
            self.task.lock().extend(partial);
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.state(),
            logs: self.logs.lock().iter().cloned().collect(),
            current_task: self.task.lock().clone(),
        }
    }

    /// Blocks while paused. Returns false if cancelled.
    pub async fn wait_while_paused(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let paused = *rx.borrow_and_update();
            if !paused {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Sleeps for `d` unless cancelled first. Returns false if cancelled.
    pub async fn sleep(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("source", &self.source)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn lc() -> Lifecycle {
        Lifecycle::new("test", ScraperConfig::for_source("test"))
    }

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn log_ring_keeps_latest_thousand_in_order() {
        let l = lc();
        for i in 0..1500 {
            l.log(LogKind::Debug, format!("entry {i}"));
        }
        let snap = l.snapshot();
        assert_eq!(snap.logs.len(), LOG_CAPACITY);
        assert_eq!(snap.logs.first().unwrap().message, "entry 500");
        assert_eq!(snap.logs.last().unwrap().message, "entry 1499");
        for (k, e) in snap.logs.iter().enumerate() {
            assert_eq!(e.message, format!("entry {}", 500 + k));
        }
    }

    #[test]
    fn transitions_follow_state_machine() {
        let l = lc();
        assert_eq!(l.state(), ScraperState::Idle);
        assert!(matches!(
            l.pause(),
            Err(PipelineError::InvalidTransition { op: "pause", .. })
        ));
        assert!(l.begin_setup());
        assert!(l.begin_running());
        assert!(l.resume().is_err());
        l.pause().unwrap();
        assert_eq!(l.state(), ScraperState::Paused);
        l.resume().unwrap();
        assert_eq!(l.state(), ScraperState::Running);
        l.stop();
        l.stop();
        assert_eq!(l.state(), ScraperState::Stopped);
        assert!(l.is_cancelled());
        assert!(!l.begin_running());

        let changes = l
            .snapshot()
            .logs
            .iter()
            .filter(|e| e.message.starts_with("State changed"))
            .count();
        assert_eq!(changes, 5);
    }

    #[test]
    fn update_task_merges_or_overwrites() {
        let l = lc();
        l.update_task(obj(json!({"ticker": "TSLA", "count": 0})), true);
        l.update_task(obj(json!({"count": 3})), false);
        assert_eq!(
            Value::Object(l.snapshot().current_task),
            json!({"ticker": "TSLA", "count": 3})
        );
        l.update_task(obj(json!({"ticker": "NVDA"})), true);
        assert_eq!(
            Value::Object(l.snapshot().current_task),
            json!({"ticker": "NVDA"})
        );
    }

    #[test]
    fn update_config_validates_and_logs() {
        let l = lc();
        let mut bad = ScraperConfig::for_source("test");
        bad.max_pages = 0;
        assert!(l.update_config(bad).is_err());
        let mut good = ScraperConfig::for_source("test");
        good.crawl_interval_secs = 1;
        l.update_config(good).unwrap();
        assert_eq!(l.config().crawl_interval_secs, 1);
        assert_eq!(l.state(), ScraperState::Idle);
        assert_eq!(l.snapshot().logs.last().unwrap().message, "Config updated.");
    }

    #[test]
    fn snapshot_is_a_copy() {
        let l = lc();
        l.log(LogKind::Message, "one");
        let snap = l.snapshot();
        l.log(LogKind::Message, "two");
        assert_eq!(snap.logs.len(), 1);
        assert!(snap.logs[0].to_string().starts_with("[MESSAGE]:"));
    }

    #[tokio::test]
    async fn wait_while_paused_releases_on_resume_and_stop() {
        let l = Arc::new(lc());
        l.begin_setup();
        l.begin_running();
        assert!(l.wait_while_paused().await);

        l.pause().unwrap();
        let waiter = {
            let l = l.clone();
            tokio::spawn(async move { l.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        l.resume().unwrap();
        assert!(waiter.await.unwrap());

        l.pause().unwrap();
        let waiter = {
            let l = l.clone();
            tokio::spawn(async move { l.wait_while_paused().await })
        };
        l.stop();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_stop() {
        let l = Arc::new(lc());
        let sleeper = {
            let l = l.clone();
            tokio::spawn(async move { l.sleep(Duration::from_secs(30)).await })
        };
        l.stop();
        let done = tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(!done);
    }
}
