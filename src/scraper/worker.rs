// src/scraper/worker.rs
//! The per-source run loop.
//!
//! setup -> login -> RUNNING, then passes over the configured tickers every
//! `crawl_interval`. Each ticker is paged through until the agent runs dry or
//! `max_pages` is hit; every record goes to the broker's background lane.

use futures::FutureExt;
use metrics::counter;
use serde_json::{json, Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::agent::SourceAgent;
use super::lifecycle::{Lifecycle, LogKind};
use crate::broker::WorkBroker;
use crate::config::ScraperConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::SCRAPER_RECORDS;
use crate::record::normalize_ticker;

enum TickerOutcome {
    Done(usize),
    /// Transient agent error; the next pass restarts at this ticker.
    Interrupted(usize),
    Cancelled(usize),
}

/// Drives one agent until stopped, finished or failed. The agent is closed on
/// every exit path and the lifecycle always ends up STOPPED.
pub(crate) async fn run(
    lifecycle: Arc<Lifecycle>,
    mut agent: Box<dyn SourceAgent>,
    broker: WorkBroker,
) {
    let result = AssertUnwindSafe(drive(&lifecycle, agent.as_mut(), &broker))
        .catch_unwind()
        .await;
    agent.close().await;
    match result {
        Ok(Ok(())) => {
            lifecycle.log(LogKind::Message, "Scraper finished.");
            info!(target: "scraper", source = %lifecycle.source(), "worker exited");
        }
        Ok(Err(e)) => {
            lifecycle.log(LogKind::Error, format!("Scraper failed: {e}"));
            error!(target: "scraper", source = %lifecycle.source(), error = %e, "worker failed");
        }
        Err(_) => {
            lifecycle.log(LogKind::Error, "Scraper panicked.");
            error!(target: "scraper", source = %lifecycle.source(), "worker panicked");
        }
    }
    lifecycle.stop();
}

/// Awaits the inner run task so a panic in `close` or an abort is recorded on
/// the worker's own log instead of vanishing with the task.
pub(crate) async fn watch(lifecycle: Arc<Lifecycle>, inner: JoinHandle<()>) {
    if let Err(e) = inner.await {
        let what = if e.is_panic() { "panicked" } else { "was aborted" };
        lifecycle.log(LogKind::Error, format!("Scraper {what}."));
        if e.is_panic() {
            error!(target: "scraper", source = %lifecycle.source(), "worker panicked");
        }
        lifecycle.stop();
    }
}

async fn drive(lc: &Lifecycle, agent: &mut dyn SourceAgent, broker: &WorkBroker) -> Result<()> {
    let started = Instant::now();
    if !lc.begin_setup() {
        return Ok(());
    }

    let cfg = lc.config();
    tokio::select! {
        _ = lc.cancelled() => return Ok(()),
        r = agent.setup(&cfg) => r.map_err(|e| match e {
            PipelineError::SetupFailure(_) => e,
            other => PipelineError::SetupFailure(other.to_string()),
        })?,
    }
    login(lc, agent, &cfg).await?;

    if !lc.begin_running() {
        return Ok(());
    }

    let mut resume_from: Option<String> = None;
    loop {
        if !lc.wait_while_paused().await {
            return Ok(());
        }
        let cfg = lc.config();
        if !lc.sleep(cfg.crawl_interval()).await {
            return Ok(());
        }
        if let Some(limit) = cfg.max_time_running() {
            if started.elapsed() >= limit {
                lc.log(LogKind::Message, "Maximum running time reached.");
                return Ok(());
            }
        }

        tokio::task::yield_now().await;
        let tickers = pass_order(&cfg.query.tickers, resume_from.take().as_deref());
        debug!(target: "scraper", source = %lc.source(), tickers = tickers.len(), "starting pass");
        for ticker in tickers {
            if !lc.wait_while_paused().await {
                return Ok(());
            }
            lc.update_task(
                obj(json!({ "source": cfg.source.name, "ticker": ticker, "count": 0 })),
                true,
            );
            match crawl_ticker(lc, agent, broker, &cfg, &ticker).await {
                TickerOutcome::Done(n) => {
                    lc.log(LogKind::Message, format!("Found {n} posts for {ticker}"));
                }
                TickerOutcome::Interrupted(n) => {
                    lc.log(LogKind::Message, format!("Found {n} posts for {ticker}"));
                    resume_from = Some(ticker);
                    break;
                }
                TickerOutcome::Cancelled(_) => return Ok(()),
            }
        }
    }
}

async fn login(lc: &Lifecycle, agent: &mut dyn SourceAgent, cfg: &ScraperConfig) -> Result<()> {
    let mut creds = cfg.credentials.clone();
    if let Err(e) = creds.resolve_env() {
        lc.log(LogKind::Error, format!("Login failed: {e}"));
        return Err(PipelineError::AuthFailure(e.to_string()));
    }
    if creds.is_empty() {
        debug!(target: "scraper", source = %lc.source(), "no credentials, skipping login");
        return Ok(());
    }

    let first = if creds.email.is_empty() {
        Err(PipelineError::AuthFailure("no email configured".into()))
    } else {
        agent.login(&creds.email, &creds.password).await
    };
    match first {
        Ok(()) => {
            lc.log(LogKind::Message, "Login successful.");
            return Ok(());
        }
        Err(e) => {
            lc.log(
                LogKind::Warning,
                "Login failed with email. Retrying with username.",
            );
            warn!(target: "scraper", source = %lc.source(), error = %e, "email login failed");
        }
    }

    if creds.login.is_empty() {
        lc.log(LogKind::Error, "Login failed: no username configured.");
        return Err(PipelineError::AuthFailure(
            "email login failed and no username configured".into(),
        ));
    }
    match agent.login(&creds.login, &creds.password).await {
        Ok(()) => {
            lc.log(LogKind::Message, "Login successful with username.");
            Ok(())
        }
        Err(e) => {
            lc.log(
                LogKind::Error,
                format!("Login failed with username as well: {e}"),
            );
            Err(match e {
                PipelineError::AuthFailure(_) => e,
                other => PipelineError::AuthFailure(other.to_string()),
            })
        }
    }
}

async fn crawl_ticker(
    lc: &Lifecycle,
    agent: &mut dyn SourceAgent,
    broker: &WorkBroker,
    cfg: &ScraperConfig,
    ticker: &str,
) -> TickerOutcome {
    let query = cfg.query.render(ticker);
    let cashtag = normalize_ticker(ticker);
    let mut count = 0usize;

    for page in 0..cfg.max_pages {
        if !lc.wait_while_paused().await {
            return TickerOutcome::Cancelled(count);
        }
        let batch = tokio::select! {
            _ = lc.cancelled() => return TickerOutcome::Cancelled(count),
            b = agent.next_page(ticker, &query, page) => b,
        };
        let records = match batch {
            Ok(Some(records)) => records,
            Ok(None) => break,
            Err(e) => {
                lc.log(LogKind::Warning, format!("Fetching {ticker} failed: {e}"));
                warn!(target: "scraper", source = %lc.source(), ticker, error = %e, "page fetch failed");
                return TickerOutcome::Interrupted(count);
            }
        };

        let fetched = records.len();
        for mut record in records {
            if record.ticker.is_empty() {
                record.ticker = cashtag.clone();
            }
            if record.source.is_empty() {
                record.source = cfg.source.name.clone();
            }
            broker.submit_background(record);
            count += 1;
        }
        counter!(SCRAPER_RECORDS, "source" => lc.source().to_string()).increment(fetched as u64);
        lc.update_task(obj(json!({ "count": count })), false);
    }
    TickerOutcome::Done(count)
}

/// Tickers for one pass, rotated to start at `resume_from` when it is still configured.
fn pass_order(tickers: &[String], resume_from: Option<&str>) -> Vec<String> {
    let start = resume_from
        .and_then(|t| tickers.iter().position(|x| x == t))
        .unwrap_or(0);
    tickers[start..]
        .iter()
        .chain(tickers[..start].iter())
        .cloned()
        .collect()
}

fn obj(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pass_order_rotates_to_resume_point() {
        let tickers = t(&["TSLA", "NVDA", "AAPL"]);
        assert_eq!(pass_order(&tickers, None), tickers);
        assert_eq!(
            pass_order(&tickers, Some("NVDA")),
            t(&["NVDA", "AAPL", "TSLA"])
        );
        assert_eq!(pass_order(&tickers, Some("GOOG")), tickers);
        assert!(pass_order(&[], Some("TSLA")).is_empty());
    }
}
