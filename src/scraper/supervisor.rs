// src/scraper/supervisor.rs
//! Registry of running scrapers, one per source.
//!
//! All registry mutations go through one mutex, so concurrent `start` calls
//! for the same source launch at most one worker and the CPU-derived ceiling
//! is never exceeded.

use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::agent::AgentFactory;
use super::lifecycle::{Lifecycle, ScraperState, StateSnapshot};
use super::worker;
use crate::broker::WorkBroker;
use crate::config::ScraperConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::SCRAPER_WORKERS_ACTIVE;

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub ceiling: usize,
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ceiling: crate::config::app::cpu_count(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    /// False when the worker outlived the grace period and was detached.
    pub exited: bool,
}

/// Operations routed to one worker's lifecycle.
#[derive(Debug, Clone)]
pub enum ScraperCommand {
    Pause,
    Resume,
    GetState,
    UpdateConfig(ScraperConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandOutput {
    Done,
    State(StateSnapshot),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigUpdate {
    pub applied: bool,
    pub detail: String,
}

struct SourceHandle {
    lifecycle: Arc<Lifecycle>,
    /// Outer watch task plus the run task's abort handle. Taken by `stop`
    /// while it waits out the grace period.
    running: Option<(JoinHandle<()>, AbortHandle)>,
}

impl SourceHandle {
    /// A handle whose stop is in progress still counts as live. A worker that
    /// ended on its own has already closed its agent before reaching STOPPED.
    fn is_live(&self) -> bool {
        match &self.running {
            None => true,
            Some((task, _)) => {
                !task.is_finished() && self.lifecycle.state() != ScraperState::Stopped
            }
        }
    }
}

struct Detached {
    source: String,
    task: JoinHandle<()>,
    abort: AbortHandle,
}

pub struct Supervisor {
    registry: Mutex<HashMap<String, SourceHandle>>,
    detached: Mutex<Vec<Detached>>,
    factory: Arc<dyn AgentFactory>,
    broker: WorkBroker,
    configs: HashMap<String, ScraperConfig>,
    cfg: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        factory: Arc<dyn AgentFactory>,
        broker: WorkBroker,
        configs: HashMap<String, ScraperConfig>,
        cfg: SupervisorConfig,
    ) -> Self {
        crate::metrics::ensure_described();
        Self {
            registry: Mutex::new(HashMap::new()),
            detached: Mutex::new(Vec::new()),
            factory,
            broker,
            configs,
            cfg: SupervisorConfig {
                ceiling: cfg.ceiling.max(1),
                ..cfg
            },
        }
    }

    pub fn ceiling(&self) -> usize {
        self.cfg.ceiling
    }

    fn config_for(&self, source: &str) -> ScraperConfig {
        self.configs
            .get(source)
            .cloned()
            .unwrap_or_else(|| ScraperConfig::for_source(source))
    }

    /// Launch a worker for `source`. A second start for a live source is a
    /// no-op; a finished worker still in the registry is replaced.
    pub fn start(&self, source: &str) -> Result<StartOutcome> {
        let mut reg = self.registry.lock();

        if let Some(h) = reg.get(source) {
            if h.is_live() {
                warn!(target: "scraper", source, "scraper already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            reg.remove(source);
        }

        let live = reg.values().filter(|h| h.is_live()).count();
        if live >= self.cfg.ceiling {
            error!(target: "scraper", source, ceiling = self.cfg.ceiling, "scraper limit reached");
            return Err(PipelineError::CapacityExceeded {
                name: source.to_string(),
                ceiling: self.cfg.ceiling,
            });
        }

        let agent = self.factory.create(source)?;
        let lifecycle = Arc::new(Lifecycle::new(source, self.config_for(source)));
        let inner = tokio::spawn(worker::run(
            lifecycle.clone(),
            agent,
            self.broker.clone(),
        ));
        let abort = inner.abort_handle();
        let task = tokio::spawn(worker::watch(lifecycle.clone(), inner));

        reg.insert(
            source.to_string(),
            SourceHandle {
                lifecycle,
                running: Some((task, abort)),
            },
        );
        gauge!(SCRAPER_WORKERS_ACTIVE).set(reg.len() as f64);
        info!(target: "scraper", source, live = live + 1, "scraper started");
        Ok(StartOutcome::Started)
    }

    /// Signal stop, wait up to the grace period, then drop the registry entry
    /// regardless. A worker that outlives the grace period keeps running
    /// detached until `shutdown`.
    ///
    /// While one stop is waiting, a second stop for the same source only
    /// re-signals cancellation and reports `exited: false`; the first call
    /// owns the removal.
    pub async fn stop(&self, source: &str) -> Result<StopOutcome> {
        let (lifecycle, running) = {
            let mut reg = self.registry.lock();
            let h = reg
                .get_mut(source)
                .ok_or_else(|| PipelineError::NotFound(source.to_string()))?;
            (h.lifecycle.clone(), h.running.take())
        };

        lifecycle.stop();
        let Some((mut task, abort)) = running else {
            debug!(target: "scraper", source, "stop already in progress");
            return Ok(StopOutcome { exited: false });
        };

        let mut exited = true;
        if tokio::time::timeout(self.cfg.stop_grace, &mut task)
            .await
            .is_err()
        {
            exited = false;
            warn!(target: "scraper", source, grace = ?self.cfg.stop_grace, "worker did not exit in time, detaching");
            self.detached.lock().push(Detached {
                source: source.to_string(),
                task,
                abort,
            });
        }

        let mut reg = self.registry.lock();
        if reg
            .get(source)
            .is_some_and(|h| Arc::ptr_eq(&h.lifecycle, &lifecycle))
        {
            reg.remove(source);
        }
        gauge!(SCRAPER_WORKERS_ACTIVE).set(reg.len() as f64);
        info!(target: "scraper", source, exited, "scraper stopped");
        Ok(StopOutcome { exited })
    }

    /// Stop (ignoring NotFound) then start.
    pub async fn restart(&self, source: &str) -> Result<StartOutcome> {
        match self.stop(source).await {
            Ok(_) | Err(PipelineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.start(source)
    }

    fn lifecycle(&self, source: &str) -> Result<Arc<Lifecycle>> {
        self.registry
            .lock()
            .get(source)
            .map(|h| h.lifecycle.clone())
            .ok_or_else(|| PipelineError::NotFound(source.to_string()))
    }

    pub fn dispatch(&self, source: &str, cmd: ScraperCommand) -> Result<CommandOutput> {
        let lc = self.lifecycle(source)?;
        match cmd {
            ScraperCommand::Pause => lc.pause().map(|_| CommandOutput::Done),
            ScraperCommand::Resume => lc.resume().map(|_| CommandOutput::Done),
            ScraperCommand::GetState => Ok(CommandOutput::State(lc.snapshot())),
            ScraperCommand::UpdateConfig(cfg) => {
                lc.update_config(cfg).map(|_| CommandOutput::Done)
            }
        }
    }

    pub fn get_state(&self, source: &str) -> Result<StateSnapshot> {
        Ok(self.lifecycle(source)?.snapshot())
    }

    /// Apply a new config to a running worker. Failures are reported in the
    /// outcome, never raised.
    pub fn update_config(&self, source: &str, cfg: ScraperConfig) -> ConfigUpdate {
        match self.dispatch(source, ScraperCommand::UpdateConfig(cfg)) {
            Ok(_) => ConfigUpdate {
                applied: true,
                detail: format!("config updated for '{source}'"),
            },
            Err(e) => {
                warn!(target: "scraper", source, error = %e, "config update rejected");
                ConfigUpdate {
                    applied: false,
                    detail: e.to_string(),
                }
            }
        }
    }

    /// Registered sources, sorted.
    pub fn sources(&self) -> Vec<String> {
        let mut v: Vec<String> = self.registry.lock().keys().cloned().collect();
        v.sort();
        v
    }

    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.lock().is_empty()
    }

    pub fn detached(&self) -> Vec<String> {
        self.detached
            .lock()
            .iter()
            .filter(|d| !d.task.is_finished())
            .map(|d| d.source.clone())
            .collect()
    }

    /// Stop every registered worker.
    pub async fn stop_all(&self) {
        for source in self.sources() {
            if let Err(e) = self.stop(&source).await {
                warn!(target: "scraper", source, error = %e, "stop during shutdown failed");
            }
        }
    }

    /// Force-terminate workers that outlived their stop grace period.
    pub fn abort_detached(&self) -> usize {
        let detached: Vec<Detached> = self.detached.lock().drain(..).collect();
        let mut aborted = 0;
        for d in detached {
            if !d.task.is_finished() {
                warn!(target: "scraper", source = %d.source, "aborting detached worker");
                d.abort.abort();
                d.task.abort();
                aborted += 1;
            }
        }
        aborted
    }

    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.abort_detached();
        info!(target: "scraper", "all scrapers stopped");
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("sources", &self.sources())
            .field("ceiling", &self.cfg.ceiling)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::inference::InferenceService;
    use crate::processor::{MemorySink, RecordProcessor};
    use crate::scraper::agent::{ReplayAgent, ReplayFactory};
    use crate::scraper::lifecycle::ScraperState;

    fn supervisor(ceiling: usize) -> Supervisor {
        let processor =
            RecordProcessor::new(Arc::new(InferenceService::new()), Arc::new(MemorySink::new()));
        let broker = WorkBroker::new(processor, BrokerConfig::default());
        let agent = ReplayAgent::from_fixture("replay", "{}", 10).unwrap();
        Supervisor::new(
            Arc::new(ReplayFactory::new(agent)),
            broker,
            HashMap::new(),
            SupervisorConfig {
                ceiling,
                stop_grace: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn dispatch_to_unknown_source_is_not_found() {
        let s = supervisor(2);
        assert!(matches!(
            s.dispatch("nope", ScraperCommand::GetState),
            Err(PipelineError::NotFound(_))
        ));
        let upd = s.update_config("nope", ScraperConfig::for_source("nope"));
        assert!(!upd.applied);
        assert!(upd.detail.contains("nope"));
    }

    #[tokio::test]
    async fn zero_ceiling_is_clamped_to_one() {
        let s = supervisor(0);
        assert_eq!(s.ceiling(), 1);
        s.start("a").unwrap();
        assert!(matches!(
            s.start("b"),
            Err(PipelineError::CapacityExceeded { ceiling: 1, .. })
        ));
        s.shutdown().await;
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn finished_worker_is_replaced_on_start() {
        let s = supervisor(2);
        s.start("a").unwrap();
        let lc = s.lifecycle("a").unwrap();
        lc.stop();
        for _ in 0..100 {
            let done = s
                .registry
                .lock()
                .get("a")
                .and_then(|h| h.running.as_ref().map(|(t, _)| t.is_finished()))
                .unwrap_or(false);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(s.get_state("a").unwrap().state, ScraperState::Stopped);
        assert_eq!(s.start("a").unwrap(), StartOutcome::Started);
        assert_ne!(s.get_state("a").unwrap().state, ScraperState::Stopped);
        s.shutdown().await;
    }
}
