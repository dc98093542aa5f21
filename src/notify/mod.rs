//! Message delivery to chat destinations.
//!
//! One rendered message per tick, fanned out to every configured
//! destination in order. Transient failures retry with backoff; 4xx is
//! final for that destination but never blocks the others. The tick
//! counts as delivered iff at least one destination succeeded.

mod discord;
pub mod render;
mod slack;
mod telegram;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DeliveryError;
use crate::models::{Delta, Destination, PipelineDef};
use crate::utils::Shutdown;
use crate::utils::http::HttpClient;
use crate::utils::retry::{RetryPolicy, retry_with_policy};

/// Low-level message transport; trait seam so ticks can run against a
/// scripted transport in tests.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, destination: &Destination, text: &str) -> Result<(), DeliveryError>;
}

/// Real transport speaking the destination wire formats over HTTP.
pub struct HttpTransport {
    http: Arc<HttpClient>,
}

impl HttpTransport {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl MessageTransport for HttpTransport {
    async fn send(&self, destination: &Destination, text: &str) -> Result<(), DeliveryError> {
        match destination {
            Destination::Telegram { token, chat_id } => {
                telegram::send(&self.http, token, chat_id, text).await
            }
            Destination::Discord { token, chat_id } => {
                discord::send(&self.http, token, chat_id, text).await
            }
            Destination::Slack { token, chat_id } => {
                slack::send(&self.http, token, chat_id, text).await
            }
        }
    }
}

/// Outcome of one destination for one tick.
#[derive(Debug)]
pub struct DestinationOutcome {
    pub kind: &'static str,
    pub target: String,
    pub result: Result<(), DeliveryError>,
}

/// Aggregated per-destination outcomes for one tick.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub outcomes: Vec<DestinationOutcome>,
}

impl DeliveryReport {
    /// At least one destination accepted the message.
    pub fn delivered(&self) -> bool {
        self.outcomes.iter().any(|o| o.result.is_ok())
    }

    /// Shutdown interrupted delivery.
    pub fn cancelled(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.result, Err(DeliveryError::Cancelled)))
    }

    /// Human summary for logs, e.g. `2/3 delivered`.
    pub fn summary(&self) -> String {
        let ok = self.outcomes.iter().filter(|o| o.result.is_ok()).count();
        format!("{ok}/{} delivered", self.outcomes.len())
    }
}

/// Renders one message per tick and fans it out to all destinations.
pub struct Notifier {
    transport: Arc<dyn MessageTransport>,
    retry: RetryPolicy,
}

impl Notifier {
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        Self {
            transport,
            retry: RetryPolicy::delivery(),
        }
    }

    #[cfg(test)]
    pub fn with_retry(transport: Arc<dyn MessageTransport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Deliver the delta to every destination of the pipeline.
    pub async fn notify(
        &self,
        def: &PipelineDef,
        delta: &Delta,
        now: DateTime<Utc>,
        shutdown: &Shutdown,
    ) -> DeliveryReport {
        let text = render::render(def, delta, now);
        let mut report = DeliveryReport::default();

        for destination in &def.destinations {
            let result = if shutdown.is_cancelled() {
                // Stop fanning out once shutdown is requested.
                Err(DeliveryError::Cancelled)
            } else {
                retry_with_policy(&self.retry, shutdown, || {
                    self.transport.send(destination, &text)
                })
                .await
            };

            match &result {
                Ok(()) => log::debug!(
                    "pipeline '{}': delivered to {}",
                    def.id,
                    destination.describe()
                ),
                Err(e) => log::warn!(
                    "pipeline '{}': delivery to {} failed: {e}",
                    def.id,
                    destination.describe()
                ),
            }

            report.outcomes.push(DestinationOutcome {
                kind: destination.kind_name(),
                target: destination.describe(),
                result,
            });
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeKind, DeltaEntry, FieldMap, RuleSpec, SourceSpec};
    use chrono::TimeZone;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Transport that replays scripted per-destination outcomes.
    struct ScriptedTransport {
        // destination kind -> sequence of status results
        script: Mutex<Vec<(&'static str, Result<(), DeliveryError>)>>,
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageTransport for ScriptedTransport {
        async fn send(
            &self,
            destination: &Destination,
            text: &str,
        ) -> Result<(), DeliveryError> {
            self.sent
                .lock()
                .unwrap()
                .push((destination.kind_name().to_string(), text.to_string()));

            let mut script = self.script.lock().unwrap();
            let pos = script
                .iter()
                .position(|(kind, _)| *kind == destination.kind_name());
            match pos {
                Some(i) => script.remove(i).1,
                None => Ok(()),
            }
        }
    }

    fn two_dest_def() -> PipelineDef {
        PipelineDef {
            id: "p".to_string(),
            label: None,
            interval_seconds: 60,
            source: SourceSpec::HttpJson {
                url: "https://example.com".to_string(),
                query: Default::default(),
                path_to_rows: String::new(),
                field_map: FieldMap {
                    key: "id".to_string(),
                    score: None,
                    label: None,
                    attributes: Vec::new(),
                    uppercase_key: false,
                },
            },
            rule: RuleSpec::default(),
            destinations: vec![
                Destination::Telegram {
                    token: "t".to_string(),
                    chat_id: "c".to_string(),
                },
                Destination::Discord {
                    token: "t".to_string(),
                    chat_id: "w".to_string(),
                },
            ],
            cooldown_seconds: None,
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

    fn one_alert() -> Delta {
        Delta {
            entries: vec![DeltaEntry {
                key: "A".to_string(),
                label: "Alpha".to_string(),
                kind: ChangeKind::New,
                score: 10.0,
                rank: Some(1),
                prev_rank: None,
                prev_score: None,
                attributes: Vec::new(),
                emit: true,
            }],
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::ZERO,
            cap: Duration::ZERO,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_one_destination_failure_does_not_block_others() {
        let transport = Arc::new(ScriptedTransport {
            script: Mutex::new(vec![(
                "discord",
                Err(DeliveryError::HttpStatus { code: 403 }),
            )]),
            sent: Mutex::new(Vec::new()),
        });
        let notifier = Notifier::with_retry(transport.clone(), fast_retry());

        let now = Utc.with_ymd_and_hms(2026, 8, 23, 12, 0, 0).unwrap();
        let report = notifier
            .notify(&two_dest_def(), &one_alert(), now, &Shutdown::inert())
            .await;

        assert!(report.delivered());
        assert_eq!(report.summary(), "1/2 delivered");
        assert!(matches!(
            report.outcomes[1].result,
            Err(DeliveryError::HttpStatus { code: 403 })
        ));

        // 403 is final: exactly one attempt per destination.
        assert_eq!(transport.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_to_success() {
        let transport = Arc::new(ScriptedTransport {
            script: Mutex::new(vec![
                ("telegram", Err(DeliveryError::HttpStatus { code: 503 })),
                ("telegram", Err(DeliveryError::transport("reset"))),
            ]),
            sent: Mutex::new(Vec::new()),
        });
        let notifier = Notifier::with_retry(transport.clone(), fast_retry());

        let mut def = two_dest_def();
        def.destinations.truncate(1);

        let now = Utc.with_ymd_and_hms(2026, 8, 23, 12, 0, 0).unwrap();
        let report = notifier
            .notify(&def, &one_alert(), now, &Shutdown::inert())
            .await;

        assert!(report.delivered());
        assert_eq!(transport.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_same_text_to_every_destination() {
        let transport = Arc::new(ScriptedTransport {
            script: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        });
        let notifier = Notifier::with_retry(transport.clone(), fast_retry());

        let now = Utc.with_ymd_and_hms(2026, 8, 23, 12, 0, 0).unwrap();
        notifier
            .notify(&two_dest_def(), &one_alert(), now, &Shutdown::inert())
            .await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, sent[1].1);
        assert!(sent[0].1.contains("Alpha"));
    }

    #[tokio::test]
    async fn test_cancellation_skips_remaining_destinations() {
        let transport = Arc::new(ScriptedTransport {
            script: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        });
        let notifier = Notifier::with_retry(transport.clone(), fast_retry());

        let (handle, shutdown) = crate::utils::shutdown_channel();
        handle.trigger();

        let now = Utc.with_ymd_and_hms(2026, 8, 23, 12, 0, 0).unwrap();
        let report = notifier
            .notify(&two_dest_def(), &one_alert(), now, &shutdown)
            .await;

        assert!(report.cancelled());
        assert!(!report.delivered());
        assert!(transport.sent.lock().unwrap().is_empty());
    }
}
