// tests/supervisor_lifecycle.rs
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ticker_sentiment::config::ScraperConfig;
use ticker_sentiment::scraper::{
    AgentFactory, LogKind, ScraperCommand, SourceAgent, StartOutcome, Supervisor,
    SupervisorConfig,
};
use ticker_sentiment::{
    BrokerConfig, InferenceService, MemorySink, PipelineError, Record, RecordProcessor, Result,
    ScraperState, WorkBroker,
};

#[derive(Clone)]
struct Script {
    fail_setup: bool,
    /// Identifiers that log in successfully.
    accept: Vec<&'static str>,
    /// Never run out of pages.
    endless: bool,
    panic_on_page: bool,
    page_delay: Duration,
    close_delay: Option<Duration>,
    logins: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fail_setup: false,
            accept: Vec::new(),
            endless: false,
            panic_on_page: false,
            page_delay: Duration::from_millis(5),
            close_delay: None,
            logins: Arc::default(),
            closed: Arc::default(),
        }
    }
}

struct ScriptedAgent(Script);

#[async_trait]
impl SourceAgent for ScriptedAgent {
    async fn setup(&mut self, _cfg: &ScraperConfig) -> Result<()> {
        if self.0.fail_setup {
            return Err(PipelineError::SetupFailure("driver did not start".into()));
        }
        Ok(())
    }

    async fn login(&mut self, identifier: &str, _password: &str) -> Result<()> {
        self.0.logins.lock().unwrap().push(identifier.to_string());
        if self.0.accept.iter().any(|a| *a == identifier) {
            Ok(())
        } else {
            Err(PipelineError::AuthFailure(format!("{identifier} rejected")))
        }
    }

    async fn next_page(
        &mut self,
        _ticker: &str,
        _query: &str,
        page: usize,
    ) -> Result<Option<Vec<Record>>> {
        if self.0.panic_on_page {
            panic!("page parser blew up");
        }
        tokio::time::sleep(self.0.page_delay).await;
        if !self.0.endless && page > 0 {
            return Ok(None);
        }
        Ok(Some(vec![Record::new(&format!("post {page}"), "")]))
    }

    async fn close(&mut self) {
        if let Some(d) = self.0.close_delay {
            tokio::time::sleep(d).await;
        }
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn factory(script: Script) -> Arc<dyn AgentFactory> {
    Arc::new(move |_source: &str| -> Result<Box<dyn SourceAgent>> {
        Ok(Box::new(ScriptedAgent(script.clone())))
    })
}

fn fast_config(source: &str) -> ScraperConfig {
    let mut cfg = ScraperConfig::for_source(source);
    cfg.crawl_interval_secs = 0;
    cfg.max_pages = 1_000_000;
    cfg.query.tickers = vec!["TSLA".into(), "NVDA".into()];
    cfg
}

struct Harness {
    sup: Supervisor,
    sink: Arc<MemorySink>,
}

fn harness(script: Script, ceiling: usize, grace: Duration) -> Harness {
    let sink = Arc::new(MemorySink::new());
    let processor = RecordProcessor::new(Arc::new(InferenceService::new()), sink.clone());
    let broker = WorkBroker::new(processor, BrokerConfig::default());
    broker.start();
    let configs: HashMap<String, ScraperConfig> = ["a", "b", "c", "x"]
        .into_iter()
        .map(|s| (s.to_string(), fast_config(s)))
        .collect();
    let sup = Supervisor::new(
        factory(script),
        broker,
        configs,
        SupervisorConfig {
            ceiling,
            stop_grace: grace,
        },
    );
    Harness { sup, sink }
}

async fn wait_for_state(sup: &Supervisor, source: &str, want: ScraperState) -> bool {
    for _ in 0..300 {
        if let Ok(s) = sup.get_state(source) {
            if s.state == want {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn has_log(sup: &Supervisor, source: &str, kind: LogKind, needle: &str) -> bool {
    sup.get_state(source)
        .map(|s| {
            s.logs
                .iter()
                .any(|e| e.kind == kind && e.message.contains(needle))
        })
        .unwrap_or(false)
}

#[tokio::test]
async fn second_start_is_a_noop() {
    let h = harness(Script::default(), 4, Duration::from_secs(1));
    assert_eq!(h.sup.start("a").unwrap(), StartOutcome::Started);
    assert_eq!(h.sup.start("a").unwrap(), StartOutcome::AlreadyRunning);
    assert_eq!(h.sup.sources(), vec!["a"]);
    h.sup.shutdown().await;
}

#[tokio::test]
async fn stop_unknown_source_is_not_found() {
    let h = harness(Script::default(), 4, Duration::from_secs(1));
    h.sup.start("a").unwrap();
    let err = h.sup.stop("zzz").await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(ref s) if s == "zzz"));
    assert_eq!(h.sup.sources(), vec!["a"]);
    h.sup.shutdown().await;
}

#[tokio::test]
async fn start_beyond_ceiling_is_rejected() {
    let h = harness(Script::default(), 2, Duration::from_secs(1));
    h.sup.start("a").unwrap();
    h.sup.start("b").unwrap();
    let err = h.sup.start("c").unwrap_err();
    assert!(matches!(
        err,
        PipelineError::CapacityExceeded { ref name, ceiling: 2 } if name == "c"
    ));
    assert_eq!(h.sup.len(), 2);
    h.sup.shutdown().await;
}

#[tokio::test]
async fn start_pause_stop_scenario() {
    let script = Script {
        endless: true,
        ..Script::default()
    };
    let h = harness(script.clone(), 4, Duration::from_secs(1));
    h.sup.start("x").unwrap();

    let early = h.sup.get_state("x").unwrap().state;
    assert!(matches!(
        early,
        ScraperState::Idle | ScraperState::SettingUp | ScraperState::Running
    ));
    assert!(wait_for_state(&h.sup, "x", ScraperState::Running).await);

    h.sup.dispatch("x", ScraperCommand::Pause).unwrap();
    assert_eq!(h.sup.get_state("x").unwrap().state, ScraperState::Paused);

    let out = h.sup.stop("x").await.unwrap();
    assert!(out.exited);
    assert!(matches!(
        h.sup.get_state("x"),
        Err(PipelineError::NotFound(_))
    ));
    assert_eq!(script.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn paused_worker_makes_no_progress_until_resumed() {
    let script = Script {
        endless: true,
        ..Script::default()
    };
    let h = harness(script, 4, Duration::from_secs(1));
    h.sup.start("x").unwrap();
    assert!(wait_for_state(&h.sup, "x", ScraperState::Running).await);
    for _ in 0..200 {
        if h.sup.get_state("x").unwrap().current_task.get("count").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    h.sup.dispatch("x", ScraperCommand::Pause).unwrap();
    // let an in-flight page settle
    tokio::time::sleep(Duration::from_millis(50)).await;
    let before = h.sup.get_state("x").unwrap().current_task;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.sup.get_state("x").unwrap().current_task, before);

    h.sup.dispatch("x", ScraperCommand::Resume).unwrap();
    let mut progressed = false;
    for _ in 0..200 {
        if h.sup.get_state("x").unwrap().current_task != before {
            progressed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(progressed);
    h.sup.shutdown().await;
}

#[tokio::test]
async fn pause_outside_running_is_invalid_transition() {
    let h = harness(Script::default(), 4, Duration::from_secs(1));
    h.sup.start("x").unwrap();
    assert!(wait_for_state(&h.sup, "x", ScraperState::Running).await);
    let err = h.sup.dispatch("x", ScraperCommand::Resume).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidTransition {
            op: "resume",
            from: ScraperState::Running
        }
    ));
    h.sup.shutdown().await;
}

#[tokio::test]
async fn failed_setup_stops_only_that_worker() {
    let ok = harness(Script::default(), 4, Duration::from_secs(1));
    ok.sup.start("a").unwrap();

    let bad = harness(
        Script {
            fail_setup: true,
            ..Script::default()
        },
        4,
        Duration::from_secs(1),
    );
    bad.sup.start("x").unwrap();
    assert!(wait_for_state(&bad.sup, "x", ScraperState::Stopped).await);
    assert!(has_log(&bad.sup, "x", LogKind::Error, "driver did not start"));
    // still registered until stopped explicitly
    assert_eq!(bad.sup.sources(), vec!["x"]);
    assert!(bad.sup.stop("x").await.unwrap().exited);
    assert!(bad.sup.is_empty());

    assert!(wait_for_state(&ok.sup, "a", ScraperState::Running).await);
    ok.sup.shutdown().await;
}

#[tokio::test]
async fn panicking_agent_is_contained() {
    let script = Script {
        panic_on_page: true,
        ..Script::default()
    };
    let h = harness(script.clone(), 4, Duration::from_secs(1));
    h.sup.start("x").unwrap();
    assert!(wait_for_state(&h.sup, "x", ScraperState::Stopped).await);
    assert!(has_log(&h.sup, "x", LogKind::Error, "panicked"));
    // the agent is still released
    assert_eq!(script.closed.load(Ordering::SeqCst), 1);
    assert_eq!(h.sup.start("a").unwrap(), StartOutcome::Started);
    h.sup.shutdown().await;
}

#[tokio::test]
async fn login_falls_back_to_username() {
    let script = Script {
        accept: vec!["trader42"],
        ..Script::default()
    };
    let mut cfg = fast_config("x");
    cfg.credentials.email = "trader@example.com".into();
    cfg.credentials.login = "trader42".into();
    cfg.credentials.password = "pw".into();
    let sup = Supervisor::new(
        factory(script.clone()),
        WorkBroker::new(
            RecordProcessor::new(Arc::new(InferenceService::new()), Arc::new(MemorySink::new())),
            BrokerConfig::default(),
        ),
        HashMap::from([("x".to_string(), cfg)]),
        SupervisorConfig {
            ceiling: 1,
            stop_grace: Duration::from_secs(1),
        },
    );

    sup.start("x").unwrap();
    assert!(wait_for_state(&sup, "x", ScraperState::Running).await);
    assert_eq!(
        *script.logins.lock().unwrap(),
        vec!["trader@example.com".to_string(), "trader42".to_string()]
    );
    assert!(has_log(&sup, "x", LogKind::Warning, "Retrying with username"));
    assert!(has_log(&sup, "x", LogKind::Message, "Login successful with username"));
    sup.shutdown().await;
}

#[tokio::test]
async fn login_fails_after_both_identifiers() {
    let script = Script::default();
    let mut cfg = fast_config("x");
    cfg.credentials.email = "trader@example.com".into();
    cfg.credentials.login = "trader42".into();
    let sup = Supervisor::new(
        factory(script.clone()),
        WorkBroker::new(
            RecordProcessor::new(Arc::new(InferenceService::new()), Arc::new(MemorySink::new())),
            BrokerConfig::default(),
        ),
        HashMap::from([("x".to_string(), cfg)]),
        SupervisorConfig {
            ceiling: 1,
            stop_grace: Duration::from_secs(1),
        },
    );
    sup.start("x").unwrap();
    assert!(wait_for_state(&sup, "x", ScraperState::Stopped).await);
    assert_eq!(script.logins.lock().unwrap().len(), 2);
    assert!(has_log(&sup, "x", LogKind::Error, "Login failed with username as well"));
    assert_eq!(script.closed.load(Ordering::SeqCst), 1);
    sup.shutdown().await;
}

#[tokio::test]
async fn crawl_pass_reports_counts_and_feeds_background_lane() {
    let h = harness(Script::default(), 4, Duration::from_secs(1));
    h.sup.start("x").unwrap();
    let mut seen = false;
    for _ in 0..300 {
        if has_log(&h.sup, "x", LogKind::Message, "Found 1 posts for TSLA")
            && has_log(&h.sup, "x", LogKind::Message, "Found 1 posts for NVDA")
            && h.sink.len() >= 2
        {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen);
    let saved = h.sink.saved();
    assert_eq!(saved[0].record.ticker, "$TSLA");
    assert_eq!(saved[0].record.source, "x");
    assert_eq!(saved[1].record.ticker, "$NVDA");
    h.sup.shutdown().await;
}

#[tokio::test]
async fn stuck_worker_is_detached_after_grace() {
    let script = Script {
        endless: true,
        close_delay: Some(Duration::from_secs(30)),
        ..Script::default()
    };
    let h = harness(script, 4, Duration::from_millis(100));
    h.sup.start("x").unwrap();
    assert!(wait_for_state(&h.sup, "x", ScraperState::Running).await);

    let out = h.sup.stop("x").await.unwrap();
    assert!(!out.exited);
    assert!(h.sup.is_empty());
    assert_eq!(h.sup.detached(), vec!["x"]);
    assert_eq!(h.sup.abort_detached(), 1);
}

#[tokio::test]
async fn update_config_reports_outcome() {
    let h = harness(Script::default(), 4, Duration::from_secs(1));
    h.sup.start("x").unwrap();

    let mut cfg = fast_config("x");
    cfg.query.tickers = vec!["AAPL".into()];
    let ok = h.sup.update_config("x", cfg);
    assert!(ok.applied);

    let mut bad = fast_config("x");
    bad.max_pages = 0;
    let rejected = h.sup.update_config("x", bad);
    assert!(!rejected.applied);
    assert!(rejected.detail.contains("max_pages"));

    assert!(has_log(&h.sup, "x", LogKind::Message, "Config updated."));
    h.sup.shutdown().await;
}

#[tokio::test]
async fn crashed_worker_does_not_hold_a_slot() {
    let h = harness(
        Script {
            fail_setup: true,
            ..Script::default()
        },
        1,
        Duration::from_secs(1),
    );
    h.sup.start("x").unwrap();
    assert!(wait_for_state(&h.sup, "x", ScraperState::Stopped).await);

    assert_eq!(h.sup.start("a").unwrap(), StartOutcome::Started);
    assert_eq!(h.sup.sources(), vec!["a", "x"]);
    assert!(has_log(&h.sup, "x", LogKind::Error, "driver did not start"));
    h.sup.shutdown().await;
}

#[tokio::test]
async fn overlapping_stops_never_orphan_a_new_worker() {
    let script = Script {
        endless: true,
        close_delay: Some(Duration::from_secs(30)),
        ..Script::default()
    };
    let sup = Arc::new(harness(script, 4, Duration::from_millis(400)).sup);
    sup.start("x").unwrap();
    assert!(wait_for_state(&sup, "x", ScraperState::Running).await);

    let first = tokio::spawn({
        let sup = sup.clone();
        async move { sup.stop("x").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the first stop is still waiting out the grace period
    let second = sup.stop("x").await.unwrap();
    assert!(!second.exited);
    assert_eq!(sup.start("x").unwrap(), StartOutcome::AlreadyRunning);

    let first = first.await.unwrap().unwrap();
    assert!(!first.exited);
    assert!(sup.is_empty());
    assert_eq!(sup.detached(), vec!["x"]);

    assert_eq!(sup.start("x").unwrap(), StartOutcome::Started);
    assert_eq!(sup.sources(), vec!["x"]);

    sup.shutdown().await;
    assert!(sup.is_empty());
    assert!(sup.detached().is_empty());
}

#[tokio::test]
async fn restart_starts_absent_source_and_replaces_running_one() {
    let script = Script {
        endless: true,
        ..Script::default()
    };
    let h = harness(script.clone(), 4, Duration::from_secs(1));

    assert_eq!(h.sup.restart("x").await.unwrap(), StartOutcome::Started);
    assert!(wait_for_state(&h.sup, "x", ScraperState::Running).await);
    h.sup.dispatch("x", ScraperCommand::Pause).unwrap();

    assert_eq!(h.sup.restart("x").await.unwrap(), StartOutcome::Started);
    assert_eq!(h.sup.sources(), vec!["x"]);
    assert_eq!(script.closed.load(Ordering::SeqCst), 1);
    // the paused worker was replaced by a fresh one
    assert!(wait_for_state(&h.sup, "x", ScraperState::Running).await);
    h.sup.shutdown().await;
}
