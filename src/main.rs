//! Ticker sentiment pipeline: binary entrypoint.
//!
//! Boots the application context, autostarts configured scrapers and serves
//! the control surface as JSON lines on stdin/stdout until EOF or Ctrl-C.

use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ticker_sentiment::config::AppConfig;
use ticker_sentiment::{AppContext, Command, Control, JsonlSink, PipelineError, Reply};

/// `LOG_FORMAT=json` switches to structured output; logs go to stderr so
/// stdout stays reserved for replies.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ticker_sentiment=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

fn install_metrics(cfg: &AppConfig) -> anyhow::Result<()> {
    let Some(listen) = cfg.metrics.listen.as_deref() else {
        return Ok(());
    };
    let addr: std::net::SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid [metrics].listen address '{listen}'"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing prometheus exporter")?;
    info!(target: "context", %addr, "metrics exporter listening");
    Ok(())
}

async fn serve_stdin(control: Control) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut out = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Command>(line) {
            Ok(cmd) => control.handle(cmd).await,
            Err(e) => Reply::err(&PipelineError::QueueItemError(format!(
                "unreadable command: {e}"
            ))),
        };
        let mut body = serde_json::to_vec(&reply)?;
        body.push(b'\n');
        out.write_all(&body).await?;
        out.flush().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default()?;
    if let Err(e) = install_metrics(&cfg) {
        warn!(target: "context", error = ?e, "metrics exporter disabled");
    }

    let sink = Arc::new(JsonlSink::new(cfg.persistence.path.clone()));
    let ctx = Arc::new(AppContext::init(cfg, sink));
    if !ctx.degraded().is_empty() {
        warn!(target: "context", degraded = ?ctx.degraded(), "running degraded");
    }
    ctx.autostart();

    let control = Control::new(ctx.clone());
    tokio::select! {
        r = serve_stdin(control) => {
            if let Err(e) = r {
                warn!(target: "context", error = ?e, "control loop ended with error");
            }
        }
        _ = tokio::signal::ctrl_c() => info!(target: "context", "interrupt received"),
    }

    ctx.shutdown().await;
    Ok(())
}
