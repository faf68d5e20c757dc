// src/scraper/mod.rs
//! Scraper subsystem: agents, per-source lifecycle, run loop and supervisor.

pub mod agent;
pub mod lifecycle;
pub mod supervisor;
mod worker;

pub use agent::{AgentFactory, ReplayAgent, ReplayFactory, SourceAgent};
pub use lifecycle::{LogEntry, LogKind, ScraperState, StateSnapshot};
pub use supervisor::{
    CommandOutput, ConfigUpdate, ScraperCommand, StartOutcome, StopOutcome, Supervisor,
    SupervisorConfig,
};
