// src/context.rs
//! Process-wide context owning the inference service, the broker and the
//! scraper supervisor.
//!
//! Built in dependency order (inference, broker, supervisor). A subsystem
//! that fails to initialise is logged and left degraded; the others still
//! come up. Teardown runs in reverse: workers, broker, detached workers.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::broker::WorkBroker;
use crate::config::model::load_model_bundle;
use crate::config::AppConfig;
use crate::error::{PipelineError, Result};
use crate::inference::InferenceService;
use crate::processor::{PostSink, RecordProcessor};
use crate::scraper::{AgentFactory, ReplayAgent, ReplayFactory, Supervisor, SupervisorConfig};

const REPLAY_PAGE_SIZE: usize = 20;

pub struct AppContext {
    config: AppConfig,
    inference: Arc<InferenceService>,
    broker: WorkBroker,
    supervisor: Option<Arc<Supervisor>>,
    degraded: Vec<&'static str>,
}

impl AppContext {
    /// Build from config, using the replay fixture in `[scraper].replay_path`
    /// as the source agent. Must be called inside a Tokio runtime.
    pub fn init(config: AppConfig, sink: Arc<dyn PostSink>) -> Self {
        let factory = replay_factory(&config);
        Self::with_factory(config, sink, factory)
    }

    pub fn with_factory(
        config: AppConfig,
        sink: Arc<dyn PostSink>,
        factory: Result<Arc<dyn AgentFactory>>,
    ) -> Self {
        crate::metrics::ensure_described();
        let mut degraded = Vec::new();

        let inference = match load_model_bundle(&config.model.configs_path, &config.model.default_model)
            .and_then(|bundle| InferenceService::with_bundle(&bundle))
        {
            Ok(svc) => Arc::new(svc),
            Err(e) => {
                error!(target: "context", error = %e, "inference unavailable, predictions fall back to neutral");
                degraded.push("inference");
                Arc::new(InferenceService::new())
            }
        };

        let processor = RecordProcessor::new(inference.clone(), sink);
        let broker = WorkBroker::new(processor, config.broker.broker_config());
        broker.start();

        let supervisor = match factory {
            Ok(factory) => Some(Arc::new(Supervisor::new(
                factory,
                broker.clone(),
                config.scraper.sources.clone(),
                SupervisorConfig {
                    ceiling: config.scraper.ceiling(),
                    stop_grace: config.scraper.stop_grace(),
                },
            ))),
            Err(e) => {
                error!(target: "context", error = %e, "scraper subsystem unavailable");
                degraded.push("scraper");
                None
            }
        };

        info!(
            target: "context",
            model = ?inference.model_name(),
            scraper = supervisor.is_some(),
            "context initialised"
        );
        Self {
            config,
            inference,
            broker,
            supervisor,
            degraded,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn inference(&self) -> &Arc<InferenceService> {
        &self.inference
    }

    pub fn broker(&self) -> &WorkBroker {
        &self.broker
    }

    pub fn supervisor(&self) -> Result<&Arc<Supervisor>> {
        self.supervisor
            .as_ref()
            .ok_or_else(|| PipelineError::SetupFailure("scraper subsystem unavailable".into()))
    }

    /// Subsystems that failed to initialise.
    pub fn degraded(&self) -> &[&'static str] {
        &self.degraded
    }

    /// Start every source listed in `[scraper].autostart`; failures are logged.
    pub fn autostart(&self) {
        let Ok(sup) = self.supervisor() else {
            return;
        };
        for source in &self.config.scraper.autostart {
            if let Err(e) = sup.start(source) {
                warn!(target: "context", source = %source, error = %e, "autostart failed");
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(sup) = &self.supervisor {
            sup.stop_all().await;
        }
        self.broker.shutdown().await;
        if let Some(sup) = &self.supervisor {
            let n = sup.abort_detached();
            if n > 0 {
                warn!(target: "context", aborted = n, "detached workers aborted");
            }
        }
        info!(target: "context", "shutdown complete");
    }
}

fn replay_factory(config: &AppConfig) -> Result<Arc<dyn AgentFactory>> {
    let path = config
        .scraper
        .replay_path
        .as_ref()
        .ok_or_else(|| PipelineError::SetupFailure("no source agent configured".into()))?;
    let agent = ReplayAgent::from_path("replay", path, REPLAY_PAGE_SIZE)?;
    Ok(Arc::new(ReplayFactory::new(agent)))
}
