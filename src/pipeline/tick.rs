//! One tick of one pipeline: fetch, evaluate, diff, notify, persist.
//!
//! A tick is serial and owns the whole chain. State is only persisted
//! after the message is accepted by at least one destination (or the
//! tick produced nothing worth sending), so a dead destination can never
//! silently swallow an alert: the same delta reappears next tick.

use chrono::{DateTime, Utc};

use crate::diff::{self, DiffParams};
use crate::error::{AppError, Result, SourceError};
use crate::models::{AlertState, PipelineDef};
use crate::notify::{DeliveryReport, Notifier};
use crate::rules;
use crate::sources::{self, SourceAdapter};
use crate::storage::StateStore;
use crate::utils::Shutdown;
use crate::utils::http::HttpClient;

/// What one tick amounted to.
#[derive(Debug)]
pub enum TickOutcome {
    /// Alerts were produced and at least one destination accepted them.
    Delivered { alerts: usize, report: DeliveryReport },

    /// A successful tick with nothing to send.
    Quiet,

    /// The source failed; the failure was absorbed into the pipeline's
    /// failure counter instead of becoming an alert.
    SourceFailed {
        error: SourceError,
        consecutive_failures: u32,
    },
}

/// A configured pipeline with its source adapter and diff parameters
/// resolved at startup.
pub struct Pipeline {
    def: PipelineDef,
    adapter: Box<dyn SourceAdapter>,
    params: DiffParams,
}

impl Pipeline {
    /// Validate the definition and build its source adapter. Bad URLs and
    /// selectors surface here, before the first tick runs.
    pub fn build(def: PipelineDef) -> Result<Self> {
        def.validate()?;
        let adapter = sources::build_adapter(&def.source, def.rate_limit_per_minute)?;
        let params = DiffParams::from_def(&def);
        Ok(Self {
            def,
            adapter,
            params,
        })
    }

    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub fn def(&self) -> &PipelineDef {
        &self.def
    }

    /// Run one tick under the pipeline's hard time budget. An overrunning
    /// tick is cut off and surfaces as `AppError::Timeout`.
    pub async fn run_tick_bounded(
        &self,
        http: &HttpClient,
        store: &dyn StateStore,
        notifier: &Notifier,
        shutdown: &Shutdown,
    ) -> Result<TickOutcome> {
        let budget = self.def.tick_timeout();
        match tokio::time::timeout(budget, self.run_tick(http, store, notifier, shutdown)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(budget)),
        }
    }

    /// Run one tick at the current wall-clock time.
    pub async fn run_tick(
        &self,
        http: &HttpClient,
        store: &dyn StateStore,
        notifier: &Notifier,
        shutdown: &Shutdown,
    ) -> Result<TickOutcome> {
        self.run_tick_at(http, store, notifier, shutdown, Utc::now())
            .await
    }

    async fn run_tick_at(
        &self,
        http: &HttpClient,
        store: &dyn StateStore,
        notifier: &Notifier,
        shutdown: &Shutdown,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let previous = store.load(&self.def.id).await?;

        let outcome = match sources::fetch_with_retry(self.adapter.as_ref(), http, shutdown).await
        {
            Ok(outcome) => outcome,
            Err(SourceError::Cancelled) => return Err(AppError::Cancelled),
            Err(e) => return self.absorb_failure(store, previous, e).await,
        };

        if outcome.stats.rows_dropped > 0 {
            log::debug!(
                "pipeline '{}': dropped {}/{} rows during projection",
                self.def.id,
                outcome.stats.rows_dropped,
                outcome.stats.rows_seen
            );
        }

        // A populated pipeline suddenly seeing zero rows is far more likely
        // upstream breakage than a genuinely empty market. Absorb it rather
        // than wiping the snapshot, unless the operator opted in.
        let previously_populated = previous
            .as_ref()
            .is_some_and(|s| !s.last_snapshot.is_empty());
        if outcome.records.is_empty() && previously_populated && !self.def.allow_empty_snapshot {
            return self
                .absorb_failure(store, previous, SourceError::Empty)
                .await;
        }

        let fresh = rules::evaluate(&outcome.records, &self.def.rule, self.def.top_k)?;
        let (delta, next) = diff::diff(previous.as_ref(), &fresh, now, &self.params);

        if !delta.has_alerts() {
            store.store(&self.def.id, &next).await?;
            return Ok(TickOutcome::Quiet);
        }

        let report = notifier.notify(&self.def, &delta, now, shutdown).await;
        if report.delivered() {
            // Persist only now: an undelivered delta must reappear next tick.
            store.store(&self.def.id, &next).await?;
            return Ok(TickOutcome::Delivered {
                alerts: delta.alert_count(),
                report,
            });
        }
        if report.cancelled() {
            return Err(AppError::Cancelled);
        }
        Err(AppError::delivery(format!(
            "pipeline '{}': every destination failed ({})",
            self.def.id,
            report.summary()
        )))
    }

    /// Absorb a source failure: bump the stored failure counter without
    /// touching the last snapshot, so recovery diffs against real data.
    /// Before the first successful tick there is nothing to protect and
    /// no state file is created.
    async fn absorb_failure(
        &self,
        store: &dyn StateStore,
        previous: Option<AlertState>,
        error: SourceError,
    ) -> Result<TickOutcome> {
        let consecutive_failures = match previous {
            Some(mut state) => {
                state.record_failure();
                store.store(&self.def.id, &state).await?;
                state.consecutive_failures
            }
            None => 1,
        };
        Ok(TickOutcome::SourceFailed {
            error,
            consecutive_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::models::{Destination, FieldMap, HttpConfig, Record, RuleSpec, SourceSpec};
    use crate::notify::MessageTransport;
    use crate::sources::{FetchOutcome, FetchStats};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    /// In-memory state store.
    #[derive(Default)]
    struct MemoryStore {
        states: Mutex<HashMap<String, AlertState>>,
        writes: Mutex<u32>,
    }

    #[async_trait]
    impl StateStore for MemoryStore {
        async fn load(&self, pipeline_id: &str) -> Result<Option<AlertState>> {
            Ok(self.states.lock().unwrap().get(pipeline_id).cloned())
        }

        async fn store(&self, pipeline_id: &str, state: &AlertState) -> Result<()> {
            *self.writes.lock().unwrap() += 1;
            self.states
                .lock()
                .unwrap()
                .insert(pipeline_id.to_string(), state.clone());
            Ok(())
        }

        async fn reset(&self, pipeline_id: &str) -> Result<bool> {
            Ok(self.states.lock().unwrap().remove(pipeline_id).is_some())
        }
    }

    /// Source that replays a scripted sequence of fetch results.
    struct ScriptedSource {
        script: Mutex<VecDeque<std::result::Result<Vec<Record>, SourceError>>>,
    }

    impl ScriptedSource {
        fn new(
            script: Vec<std::result::Result<Vec<Record>, SourceError>>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedSource {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn fetch(
            &self,
            _http: &HttpClient,
        ) -> std::result::Result<FetchOutcome, SourceError> {
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted");
            next.map(|records| FetchOutcome {
                stats: FetchStats {
                    rows_seen: records.len(),
                    rows_dropped: 0,
                },
                records,
            })
        }
    }

    /// Transport that records sends and optionally fails them all.
    struct RecordingTransport {
        fail_all: bool,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageTransport for RecordingTransport {
        async fn send(
            &self,
            _destination: &Destination,
            text: &str,
        ) -> std::result::Result<(), DeliveryError> {
            self.sent.lock().unwrap().push(text.to_string());
            if self.fail_all {
                Err(DeliveryError::HttpStatus { code: 404 })
            } else {
                Ok(())
            }
        }
    }

    fn def() -> PipelineDef {
        PipelineDef {
            id: "movers".to_string(),
            label: None,
            interval_seconds: 300,
            source: SourceSpec::HttpJson {
                url: "https://example.com/rows".to_string(),
                query: Default::default(),
                path_to_rows: String::new(),
                field_map: FieldMap {
                    key: "id".to_string(),
                    score: Some("score".to_string()),
                    label: None,
                    attributes: Vec::new(),
                    uppercase_key: false,
                },
            },
            rule: RuleSpec::default(),
            destinations: vec![Destination::Slack {
                token: "T/B/x".to_string(),
                chat_id: String::new(),
            }],
            cooldown_seconds: Some(3600),
            top_k: 10,
            template: "compact".to_string(),
            emit_fallen: false,
            emit_dropped: false,
            score_epsilon: None,
            allow_empty_snapshot: false,
            rate_limit_per_minute: None,
            tick_timeout_seconds: 60,
        }
    }

    fn record(key: &str, score: f64) -> Record {
        Record {
            key: key.to_string(),
            score,
            label: key.to_string(),
            attributes: Vec::new(),
            fetched_at: t(0),
        }
    }

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 23, 12, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
    }

    struct Harness {
        pipeline: Pipeline,
        http: HttpClient,
        store: MemoryStore,
        transport: Arc<RecordingTransport>,
        notifier: Notifier,
    }

    impl Harness {
        fn new(
            script: Vec<std::result::Result<Vec<Record>, SourceError>>,
            fail_delivery: bool,
        ) -> Self {
            Self::with_def(def(), script, fail_delivery)
        }

        fn with_def(
            def: PipelineDef,
            script: Vec<std::result::Result<Vec<Record>, SourceError>>,
            fail_delivery: bool,
        ) -> Self {
            let transport = Arc::new(RecordingTransport {
                fail_all: fail_delivery,
                sent: Mutex::new(Vec::new()),
            });
            let retry = crate::utils::retry::RetryPolicy {
                max_attempts: 1,
                base: std::time::Duration::ZERO,
                cap: std::time::Duration::ZERO,
                jitter: 0.0,
            };
            Self {
                pipeline: Pipeline {
                    params: DiffParams::from_def(&def),
                    adapter: Box::new(ScriptedSource::new(script)),
                    def,
                },
                http: HttpClient::new(&HttpConfig::default()).unwrap(),
                store: MemoryStore::default(),
                transport: transport.clone(),
                notifier: Notifier::with_retry(transport, retry),
            }
        }

        async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
            self.pipeline
                .run_tick_at(
                    &self.http,
                    &self.store,
                    &self.notifier,
                    &Shutdown::inert(),
                    now,
                )
                .await
        }

        fn state(&self) -> Option<AlertState> {
            self.store.states.lock().unwrap().get("movers").cloned()
        }
    }

    #[tokio::test]
    async fn test_first_tick_alerts_everything_and_persists() {
        let harness = Harness::new(
            vec![Ok(vec![record("A", 10.0), record("B", 5.0)])],
            false,
        );

        let outcome = harness.tick_at(t(0)).await.unwrap();
        match outcome {
            TickOutcome::Delivered { alerts, .. } => assert_eq!(alerts, 2),
            other => panic!("expected Delivered, got {other:?}"),
        }

        let state = harness.state().unwrap();
        assert_eq!(state.last_snapshot.len(), 2);
        assert_eq!(state.last_alerted.len(), 2);
        assert_eq!(state.last_success_at, Some(t(0)));
    }

    #[tokio::test]
    async fn test_unchanged_tick_is_quiet_but_still_persists() {
        let rows = vec![record("A", 10.0), record("B", 5.0)];
        let harness = Harness::new(vec![Ok(rows.clone()), Ok(rows)], false);

        harness.tick_at(t(0)).await.unwrap();
        let outcome = harness.tick_at(t(5)).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Quiet));

        // The quiet tick still advanced the success marker.
        assert_eq!(harness.state().unwrap().last_success_at, Some(t(5)));
        assert_eq!(harness.transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat_alert() {
        let harness = Harness::new(
            vec![
                Ok(vec![record("A", 10.0)]),
                // Moved, but within the 1h cooldown configured above.
                Ok(vec![record("A", 14.0)]),
            ],
            false,
        );

        harness.tick_at(t(0)).await.unwrap();
        let outcome = harness.tick_at(t(10)).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Quiet));

        // The stored mark tracked the new score so cooldown expiry does not
        // re-alert on a move that already happened.
        let state = harness.state().unwrap();
        assert_eq!(state.last_alerted["A"].score, 14.0);
        assert_eq!(state.last_alerted["A"].at, t(0));
    }

    #[tokio::test]
    async fn test_risen_after_cooldown_alerts_again() {
        let harness = Harness::new(
            vec![Ok(vec![record("A", 10.0)]), Ok(vec![record("A", 14.0)])],
            false,
        );

        harness.tick_at(t(0)).await.unwrap();
        let outcome = harness.tick_at(t(90)).await.unwrap();
        match outcome {
            TickOutcome::Delivered { alerts, .. } => assert_eq!(alerts, 1),
            other => panic!("expected Delivered, got {other:?}"),
        }
        assert_eq!(harness.state().unwrap().last_alerted["A"].at, t(90));
    }

    #[tokio::test]
    async fn test_source_failure_absorbed_snapshot_untouched() {
        let harness = Harness::new(
            vec![
                Ok(vec![record("A", 10.0)]),
                Err(SourceError::HttpStatus { code: 404 }),
                Err(SourceError::decode("not json")),
            ],
            false,
        );

        harness.tick_at(t(0)).await.unwrap();
        let before = harness.state().unwrap();

        for (tick, expected_failures) in [(5, 1), (10, 2)] {
            let outcome = harness.tick_at(t(tick)).await.unwrap();
            match outcome {
                TickOutcome::SourceFailed {
                    consecutive_failures,
                    ..
                } => assert_eq!(consecutive_failures, expected_failures),
                other => panic!("expected SourceFailed, got {other:?}"),
            }
        }

        let after = harness.state().unwrap();
        assert_eq!(after.consecutive_failures, 2);
        assert_eq!(after.last_snapshot, before.last_snapshot);
        assert_eq!(after.last_alerted, before.last_alerted);
        assert_eq!(after.last_success_at, before.last_success_at);
        // No failure spam: only the first tick produced a message.
        assert_eq!(harness.transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_before_first_success_creates_no_state() {
        let harness = Harness::new(vec![Err(SourceError::HttpStatus { code: 404 })], false);

        let outcome = harness.tick_at(t(0)).await.unwrap();
        assert!(matches!(outcome, TickOutcome::SourceFailed { .. }));
        assert!(harness.state().is_none());
    }

    #[tokio::test]
    async fn test_recovery_resets_failure_counter_and_diffs_old_snapshot() {
        let harness = Harness::new(
            vec![
                Ok(vec![record("A", 10.0)]),
                Err(SourceError::HttpStatus { code: 404 }),
                Ok(vec![record("A", 10.0), record("B", 7.0)]),
            ],
            false,
        );

        harness.tick_at(t(0)).await.unwrap();
        harness.tick_at(t(5)).await.unwrap();
        let outcome = harness.tick_at(t(10)).await.unwrap();

        // Only B is new relative to the pre-failure snapshot.
        match outcome {
            TickOutcome::Delivered { alerts, .. } => assert_eq!(alerts, 1),
            other => panic!("expected Delivered, got {other:?}"),
        }
        assert_eq!(harness.state().unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_empty_snapshot_absorbed_when_previously_populated() {
        let harness = Harness::new(
            vec![Ok(vec![record("A", 10.0)]), Ok(Vec::new())],
            false,
        );

        harness.tick_at(t(0)).await.unwrap();
        let outcome = harness.tick_at(t(5)).await.unwrap();
        match outcome {
            TickOutcome::SourceFailed { error, .. } => {
                assert!(matches!(error, SourceError::Empty))
            }
            other => panic!("expected SourceFailed, got {other:?}"),
        }
        assert_eq!(harness.state().unwrap().last_snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_snapshot_accepted_when_opted_in() {
        let mut allow = def();
        allow.allow_empty_snapshot = true;
        allow.emit_dropped = true;
        let harness = Harness::with_def(
            allow,
            vec![Ok(vec![record("A", 10.0)]), Ok(Vec::new())],
            false,
        );

        harness.tick_at(t(0)).await.unwrap();
        let outcome = harness.tick_at(t(5)).await.unwrap();
        // A dropped out, and dropped emission is on.
        assert!(matches!(outcome, TickOutcome::Delivered { alerts: 1, .. }));
        assert!(harness.state().unwrap().last_snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delivery_leaves_state_unwritten() {
        let harness = Harness::new(vec![Ok(vec![record("A", 10.0)])], true);

        let err = harness.tick_at(t(0)).await.unwrap_err();
        assert!(matches!(err, AppError::Delivery(_)));
        assert!(harness.state().is_none());
    }

    #[tokio::test]
    async fn test_undelivered_alert_reappears_next_tick() {
        let rows = vec![record("A", 10.0)];
        let harness = Harness::new(vec![Ok(rows.clone()), Ok(rows)], true);

        assert!(harness.tick_at(t(0)).await.is_err());

        // Same rows, but the previous delta was never persisted, so the
        // alert is produced (and fails) again instead of vanishing.
        assert!(harness.tick_at(t(5)).await.is_err());
        assert_eq!(harness.transport.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_first_empty_snapshot_is_a_valid_first_run() {
        let harness = Harness::new(vec![Ok(Vec::new())], false);

        let outcome = harness.tick_at(t(0)).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Quiet));
        assert!(harness.state().unwrap().last_snapshot.is_empty());
    }

    /// Source that never returns.
    struct StalledSource;

    #[async_trait]
    impl SourceAdapter for StalledSource {
        fn kind(&self) -> &'static str {
            "stalled"
        }

        async fn fetch(
            &self,
            _http: &HttpClient,
        ) -> std::result::Result<FetchOutcome, SourceError> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(FetchOutcome {
                stats: FetchStats::default(),
                records: Vec::new(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_tick_times_out_without_state_write() {
        let mut short = def();
        short.tick_timeout_seconds = 1;
        let pipeline = Pipeline {
            params: DiffParams::from_def(&short),
            adapter: Box::new(StalledSource),
            def: short,
        };
        let http = HttpClient::new(&HttpConfig::default()).unwrap();
        let store = MemoryStore::default();
        let transport = Arc::new(RecordingTransport {
            fail_all: false,
            sent: Mutex::new(Vec::new()),
        });
        let notifier = Notifier::new(transport);

        let err = pipeline
            .run_tick_bounded(&http, &store, &notifier, &Shutdown::inert())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert!(store.states.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_reference_aborts_tick_without_state_write() {
        let mut with_ref = def();
        with_ref.rule = RuleSpec {
            reference: Some(crate::models::ReferenceRule {
                key: "BASE".to_string(),
                ratio: 0.5,
            }),
            ..RuleSpec::default()
        };
        let harness =
            Harness::with_def(with_ref, vec![Ok(vec![record("A", 10.0)])], false);

        let err = harness.tick_at(t(0)).await.unwrap_err();
        assert!(matches!(err, AppError::MissingReference { .. }));
        assert!(harness.state().is_none());
    }
}
