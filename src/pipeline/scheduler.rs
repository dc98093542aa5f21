//! Long-running scheduler: one tick loop per pipeline.
//!
//! Pipelines are serial with themselves (a slow tick delays the next one,
//! never overlaps it) and concurrent with each other. Shutdown stops the
//! loops between ticks and gives in-flight ticks a bounded drain window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{AppError, Result, SourceError};
use crate::models::Config;
use crate::notify::{HttpTransport, Notifier};
use crate::pipeline::{Pipeline, TickOutcome};
use crate::storage::{FileStateStore, StateStore};
use crate::utils::Shutdown;
use crate::utils::http::HttpClient;

/// Minimum spacing between repeated decode/schema warnings for one
/// pipeline. Schema drift is typically persistent; one warning every ten
/// minutes is as informative as one per tick.
const NOISY_WARN_INTERVAL: Duration = Duration::from_secs(600);

/// Running per-pipeline tick accounting.
#[derive(Debug, Default, Clone)]
pub struct PipelineSummary {
    pub ticks: u64,
    pub successes: u64,
    pub alerts: u64,
    pub source_failures: u64,
    pub last_error: Option<String>,
}

/// Final accounting for a daemon run, used for the process exit status.
#[derive(Debug, Default)]
pub struct DaemonSummary {
    pub pipelines: HashMap<String, PipelineSummary>,
}

impl DaemonSummary {
    pub fn total_ticks(&self) -> u64 {
        self.pipelines.values().map(|s| s.ticks).sum()
    }

    /// Whether any tick anywhere completed successfully.
    pub fn any_success(&self) -> bool {
        self.pipelines.values().any(|s| s.successes > 0)
    }
}

/// Run all configured pipelines until shutdown is requested, then drain.
pub async fn run(config: Config, shutdown: Shutdown) -> Result<DaemonSummary> {
    let http = Arc::new(HttpClient::new(&config.http)?);
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&config.state_dir));
    let notifier = Arc::new(Notifier::new(Arc::new(HttpTransport::new(http.clone()))));
    let scoreboard: Arc<Mutex<HashMap<String, PipelineSummary>>> =
        Arc::new(Mutex::new(HashMap::new()));

    if config.pipelines.is_empty() {
        log::warn!("no pipelines configured, nothing to schedule");
        return Ok(DaemonSummary::default());
    }

    let mut tasks = tokio::task::JoinSet::new();
    for def in &config.pipelines {
        let pipeline = Pipeline::build(def.clone())?;
        log::info!(
            "pipeline '{}': scheduled every {:?} ({} destination(s))",
            pipeline.id(),
            def.interval(),
            def.destinations.len()
        );
        tasks.spawn(pipeline_loop(
            pipeline,
            http.clone(),
            store.clone(),
            notifier.clone(),
            shutdown.clone(),
            scoreboard.clone(),
        ));
    }

    shutdown.cancelled().await;
    log::info!(
        "shutdown requested, draining in-flight ticks (up to {:?})",
        config.drain_window()
    );

    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(config.drain_window(), drain).await.is_err() {
        log::warn!("drain window elapsed with ticks still in flight, aborting them");
        tasks.abort_all();
    }

    let pipelines = scoreboard.lock().expect("scoreboard poisoned").clone();
    Ok(DaemonSummary { pipelines })
}

async fn pipeline_loop(
    pipeline: Pipeline,
    http: Arc<HttpClient>,
    store: Arc<dyn StateStore>,
    notifier: Arc<Notifier>,
    shutdown: Shutdown,
    scoreboard: Arc<Mutex<HashMap<String, PipelineSummary>>>,
) {
    let mut ticker = tokio::time::interval(pipeline.def().interval());
    // A tick that overruns its slot delays the next one instead of
    // producing a burst of catch-up ticks.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_noisy_warn: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }

        let result = pipeline
            .run_tick_bounded(&http, store.as_ref(), &notifier, &shutdown)
            .await;

        log_tick(pipeline.id(), &result, &mut last_noisy_warn);

        let mut board = scoreboard.lock().expect("scoreboard poisoned");
        record_outcome(board.entry(pipeline.id().to_string()).or_default(), &result);
        drop(board);

        if shutdown.is_cancelled() {
            return;
        }
    }
}

/// Fold one tick result into the pipeline's running summary.
fn record_outcome(summary: &mut PipelineSummary, result: &Result<TickOutcome>) {
    summary.ticks += 1;
    match result {
        Ok(TickOutcome::Delivered { alerts, .. }) => {
            summary.successes += 1;
            summary.alerts += *alerts as u64;
            summary.last_error = None;
        }
        Ok(TickOutcome::Quiet) => {
            summary.successes += 1;
            summary.last_error = None;
        }
        Ok(TickOutcome::SourceFailed { error, .. }) => {
            summary.source_failures += 1;
            summary.last_error = Some(error.to_string());
        }
        // Cancellation is not a pipeline failure.
        Err(AppError::Cancelled) => {}
        Err(e) => summary.last_error = Some(e.to_string()),
    }
}

fn log_tick(id: &str, result: &Result<TickOutcome>, last_noisy_warn: &mut Option<Instant>) {
    match result {
        Ok(TickOutcome::Delivered { alerts, report }) => {
            log::info!("pipeline '{id}': {alerts} alert(s), {}", report.summary());
        }
        Ok(TickOutcome::Quiet) => log::debug!("pipeline '{id}': nothing to report"),
        Ok(TickOutcome::SourceFailed {
            error,
            consecutive_failures,
        }) => match error {
            SourceError::Decode(_) | SourceError::Schema(_) => {
                if noisy_warn_due(last_noisy_warn, Instant::now()) {
                    log::warn!(
                        "pipeline '{id}': source failed {consecutive_failures}x in a row: {error} \
                         (suppressing repeats for {NOISY_WARN_INTERVAL:?})"
                    );
                } else {
                    log::debug!("pipeline '{id}': source failed: {error}");
                }
            }
            _ => log::warn!(
                "pipeline '{id}': source failed {consecutive_failures}x in a row: {error}"
            ),
        },
        Err(AppError::Cancelled) => log::debug!("pipeline '{id}': tick cancelled by shutdown"),
        Err(e) => log::error!("pipeline '{id}': tick failed: {e}"),
    }
}

/// Whether a decode/schema warning is due, updating the suppression clock.
fn noisy_warn_due(last: &mut Option<Instant>, now: Instant) -> bool {
    match last {
        Some(at) if now.duration_since(*at) < NOISY_WARN_INTERVAL => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}

/// Per-pipeline state summary for operator inspection.
#[derive(Debug)]
pub struct PipelineStatus {
    pub id: String,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub tracked: usize,
    pub alert_marks: usize,
}

/// Load the stored state of every configured pipeline.
pub async fn collect_status(
    config: &Config,
    store: &dyn StateStore,
) -> Result<Vec<PipelineStatus>> {
    let states =
        futures::future::try_join_all(config.pipelines.iter().map(|def| store.load(&def.id)))
            .await?;

    Ok(config
        .pipelines
        .iter()
        .zip(states)
        .map(|(def, state)| match state {
            Some(state) => PipelineStatus {
                id: def.id.clone(),
                last_success_at: state.last_success_at,
                consecutive_failures: state.consecutive_failures,
                tracked: state.last_snapshot.len(),
                alert_marks: state.last_alerted.len(),
            },
            None => PipelineStatus {
                id: def.id.clone(),
                last_success_at: None,
                consecutive_failures: 0,
                tracked: 0,
                alert_marks: 0,
            },
        })
        .collect())
}
