// src/scraper/agent.rs
//! Source agent contract plus the file-backed replay agent.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::ScraperConfig;
use crate::error::{PipelineError, Result};
use crate::record::{normalize_ticker, Record};

/// One live session against a social source.
///
/// `setup` fails with `SetupFailure`, `login` with `AuthFailure`. Any other
/// error from `next_page` is treated as transient by the run loop. `close`
/// is always called once the run loop exits, whatever the outcome.
#[async_trait]
pub trait SourceAgent: Send {
    async fn setup(&mut self, cfg: &ScraperConfig) -> Result<()>;

    async fn login(&mut self, identifier: &str, password: &str) -> Result<()>;

    /// Page `page` of results for `ticker`; `None` once exhausted.
    async fn next_page(
        &mut self,
        ticker: &str,
        query: &str,
        page: usize,
    ) -> Result<Option<Vec<Record>>>;

    async fn close(&mut self);
}

/// Builds a fresh agent for each worker start.
pub trait AgentFactory: Send + Sync {
    fn create(&self, source: &str) -> Result<Box<dyn SourceAgent>>;
}

impl<F> AgentFactory for F
where
    F: Fn(&str) -> Result<Box<dyn SourceAgent>> + Send + Sync,
{
    fn create(&self, source: &str) -> Result<Box<dyn SourceAgent>> {
        self(source)
    }
}

#[derive(Debug, Deserialize)]
struct ReplayEntry {
    text: String,
    #[serde(default)]
    published_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    likes: Option<String>,
    #[serde(default)]
    shares: Option<String>,
    #[serde(default)]
    views: Option<String>,
    #[serde(default)]
    comments: Option<String>,
}

/// Replays recorded posts from a JSON fixture keyed by ticker symbol:
/// `{"TSLA": [{"text": "...", "likes": "1.2K"}, ...], ...}`.
#[derive(Debug, Clone)]
pub struct ReplayAgent {
    source: String,
    posts: Arc<HashMap<String, Vec<Record>>>,
    page_size: usize,
}

impl ReplayAgent {
    pub fn from_fixture(source: &str, json: &str, page_size: usize) -> Result<Self> {
        let raw: HashMap<String, Vec<ReplayEntry>> = serde_json::from_str(json)
            .map_err(|e| PipelineError::SetupFailure(format!("replay fixture: {e}")))?;
        let posts = raw
            .into_iter()
            .map(|(ticker, entries)| {
                let ticker = normalize_ticker(&ticker);
                let records = entries
                    .into_iter()
                    .map(|e| to_record(e, &ticker))
                    .filter(|r| r.validate().is_ok())
                    .collect();
                (ticker, records)
            })
            .collect();
        Ok(Self {
            source: source.to_string(),
            posts: Arc::new(posts),
            page_size: page_size.max(1),
        })
    }

    pub fn from_path(source: &str, path: &Path, page_size: usize) -> Result<Self> {
        let body = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::SetupFailure(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_fixture(source, &body, page_size)
    }

    pub fn tickers(&self) -> Vec<String> {
        let mut t: Vec<String> = self.posts.keys().cloned().collect();
        t.sort();
        t
    }
}

fn to_record(e: ReplayEntry, ticker: &str) -> Record {
    let count = |raw: &Option<String>| raw.as_deref().and_then(crate::record::parse_count);
    let engagement = crate::record::Engagement {
        likes: count(&e.likes),
        shares: count(&e.shares),
        views: count(&e.views),
        comments: count(&e.comments),
    };
    let mut r = Record::new(&e.text, ticker).with_engagement(engagement);
    if let Some(at) = e.published_at {
        r = r.published(at);
    }
    r
}

#[async_trait]
impl SourceAgent for ReplayAgent {
    async fn setup(&mut self, _cfg: &ScraperConfig) -> Result<()> {
        tracing::debug!(target: "scraper", source = %self.source, tickers = self.posts.len(), "replay agent ready");
        Ok(())
    }

    async fn login(&mut self, _identifier: &str, _password: &str) -> Result<()> {
        Ok(())
    }

    async fn next_page(
        &mut self,
        ticker: &str,
        _query: &str,
        page: usize,
    ) -> Result<Option<Vec<Record>>> {
        let Some(all) = self.posts.get(&normalize_ticker(ticker)) else {
            return Ok(None);
        };
        let start = page.saturating_mul(self.page_size);
        if start >= all.len() {
            return Ok(None);
        }
        let end = (start + self.page_size).min(all.len());
        Ok(Some(
            all[start..end]
                .iter()
                .map(|r| r.clone().with_source(self.source.clone()))
                .collect(),
        ))
    }

    async fn close(&mut self) {}
}

/// Hands every source a clone of one parsed fixture.
#[derive(Debug, Clone)]
pub struct ReplayFactory {
    template: ReplayAgent,
}

impl ReplayFactory {
    pub fn new(template: ReplayAgent) -> Self {
        Self { template }
    }
}

impl AgentFactory for ReplayFactory {
    fn create(&self, source: &str) -> Result<Box<dyn SourceAgent>> {
        let mut agent = self.template.clone();
        agent.source = source.to_string();
        Ok(Box::new(agent))
    }
}
