// src/config/app.rs
//! Process-level configuration (`config/pipeline.toml`).

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::scraper::ScraperConfig;
use crate::broker::BrokerConfig;

pub const ENV_PIPELINE_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const DEFAULT_PIPELINE_CONFIG_PATH: &str = "config/pipeline.toml";

fn default_model_key() -> String {
    "lstmcnn".to_string()
}
fn default_configs_path() -> PathBuf {
    PathBuf::from("config/model_configs.json")
}
fn default_grace_secs() -> u64 {
    5
}
fn default_await_ms() -> u64 {
    10_000
}
fn default_slot_ttl_secs() -> u64 {
    60
}
fn default_pending_ttl_secs() -> u64 {
    600
}
fn default_persist_path() -> PathBuf {
    PathBuf::from("data/posts.jsonl")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_model_key")]
    pub default_model: String,
    #[serde(default = "default_configs_path")]
    pub configs_path: PathBuf,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            default_model: default_model_key(),
            configs_path: default_configs_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScraperSection {
    /// Defaults to the number of available CPUs.
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default = "default_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default)]
    pub autostart: Vec<String>,
    /// Fixture for the replay agent.
    #[serde(default)]
    pub replay_path: Option<PathBuf>,
    /// Per-source overrides; sources not listed use `ScraperConfig::for_source`.
    #[serde(default)]
    pub sources: HashMap<String, ScraperConfig>,
}

impl Default for ScraperSection {
    fn default() -> Self {
        Self {
            max_workers: None,
            stop_grace_secs: default_grace_secs(),
            autostart: Vec::new(),
            replay_path: None,
            sources: HashMap::new(),
        }
    }
}

impl ScraperSection {
    pub fn ceiling(&self) -> usize {
        self.max_workers.filter(|n| *n > 0).unwrap_or_else(cpu_count)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_await_ms")]
    pub await_timeout_ms: u64,
    #[serde(default = "default_slot_ttl_secs")]
    pub slot_ttl_secs: u64,
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            await_timeout_ms: default_await_ms(),
            slot_ttl_secs: default_slot_ttl_secs(),
            pending_ttl_secs: default_pending_ttl_secs(),
        }
    }
}

impl BrokerSection {
    pub fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            slot_ttl: Duration::from_secs(self.slot_ttl_secs),
            pending_ttl: Duration::from_secs(self.pending_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceSection {
    #[serde(default = "default_persist_path")]
    pub path: PathBuf,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            path: default_persist_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsSection {
    /// e.g. `0.0.0.0:9000`; exporter disabled when absent.
    #[serde(default)]
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub scraper: ScraperSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub metrics: MetricsSection,
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: AppConfig = toml::from_str(s).context("parsing pipeline config")?;
        for (name, sc) in &cfg.scraper.sources {
            sc.validate()
                .map_err(|e| anyhow!("scraper source '{name}': {e}"))?;
        }
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// 1) $PIPELINE_CONFIG_PATH (must exist)
    /// 2) config/pipeline.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PIPELINE_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!(
                    "{ENV_PIPELINE_CONFIG_PATH} points to non-existent path"
                ));
            }
            return Self::load_from(&pb);
        }
        let default = PathBuf::from(DEFAULT_PIPELINE_CONFIG_PATH);
        if default.exists() {
            return Self::load_from(&default);
        }
        Ok(Self::default())
    }
}
