// src/config/scraper.rs
//! Per-source scraper configuration.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{PipelineError, Result};

fn default_crawl_interval() -> u64 {
    60
}
fn default_max_pages() -> usize {
    50
}
fn default_lang() -> String {
    "en".to_string()
}
fn default_filters() -> Vec<String> {
    vec!["links".into(), "replies".into()]
}
fn default_tickers() -> Vec<String> {
    ["TSLA", "NVDA", "AAPL", "MSFT", "GOOG"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_keywords() -> Vec<String> {
    ["stock", "market", "trading", "investing", "shares"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn yesterday() -> NaiveDate {
    Utc::now().date_naive() - ChronoDuration::days(1)
}
fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    #[serde(default)]
    pub base_url: String,
}

/// Login identifiers. A value of `"ENV"` is read from `SCRAPER_EMAIL` /
/// `SCRAPER_LOGIN` / `SCRAPER_PASSWORD`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("login", &self.login)
            .field("password_len", &self.password.len())
            .finish()
    }
}

impl Credentials {
    pub fn resolve_env(&mut self) -> Result<()> {
        fn from_env(value: &mut String, var: &str) -> Result<()> {
            if value.trim().eq_ignore_ascii_case("env") {
                *value = env::var(var)
                    .map_err(|_| PipelineError::Config(format!("missing {var} env var")))?;
            }
            Ok(())
        }
        from_env(&mut self.email, "SCRAPER_EMAIL")?;
        from_env(&mut self.login, "SCRAPER_LOGIN")?;
        from_env(&mut self.password, "SCRAPER_PASSWORD")?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.email.is_empty() && self.login.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default = "yesterday")]
    pub start_date: NaiveDate,
    #[serde(default = "today")]
    pub end_date: NaiveDate,
    #[serde(default = "default_filters")]
    pub filters: Vec<String>,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
    #[serde(default = "default_tickers")]
    pub tickers: Vec<String>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            start_date: yesterday(),
            end_date: today(),
            filters: default_filters(),
            lang: default_lang(),
            keywords: default_keywords(),
            tickers: default_tickers(),
        }
    }
}

impl SearchQuery {
    /// `TSLA lang:en since:2024-01-01 until:2024-01-02 -filter:links -filter:replies`
    pub fn render(&self, ticker: &str) -> String {
        let mut q = format!(
            "{} lang:{} since:{} until:{}",
            ticker.trim_start_matches('$'),
            self.lang,
            self.start_date.format("%Y-%m-%d"),
            self.end_date.format("%Y-%m-%d"),
        );
        for f in &self.filters {
            q.push_str(" -filter:");
            q.push_str(f);
        }
        q
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScraperConfig {
    #[serde(default = "default_crawl_interval")]
    pub crawl_interval_secs: u64,
    pub source: SourceSpec,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub max_time_running_secs: Option<u64>,
    /// Upper bound on pages pulled per ticker in one pass.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default)]
    pub query: SearchQuery,
}

impl ScraperConfig {
    pub fn for_source(name: &str) -> Self {
        Self {
            crawl_interval_secs: default_crawl_interval(),
            source: SourceSpec {
                name: name.to_string(),
                base_url: String::new(),
            },
            credentials: Credentials::default(),
            max_time_running_secs: None,
            max_pages: default_max_pages(),
            query: SearchQuery::default(),
        }
    }

    pub fn crawl_interval(&self) -> Duration {
        Duration::from_secs(self.crawl_interval_secs)
    }

    pub fn max_time_running(&self) -> Option<Duration> {
        self.max_time_running_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.name.trim().is_empty() {
            return Err(PipelineError::Config("source name is empty".into()));
        }
        if self.query.start_date > self.query.end_date {
            return Err(PipelineError::Config(format!(
                "start_date {} is after end_date {}",
                self.query.start_date, self.query.end_date
            )));
        }
        if self.max_pages == 0 {
            return Err(PipelineError::Config("max_pages must be > 0".into()));
        }
        Ok(())
    }
}
