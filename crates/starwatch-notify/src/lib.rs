//! Change-event notification: channel abstraction, payload formatting, and a dispatcher
//! that delivers to every configured channel independently.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use starwatch_core::{ChangeEvent, DeliveryStatus, NotificationOutcome};
use starwatch_storage::{BackoffPolicy, Deadline, RetryDisposition, Retryable};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub mod channels;
pub mod config;

pub use channels::{EmailChannel, FileChannel, WebhookChannel};
pub use config::{build_channels, load_channel_configs, ChannelConfig, ChannelTarget, ConfiguredChannel};

pub const CRATE_NAME: &str = "starwatch-notify";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Webhook,
    File,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::File => "file",
        })
    }
}

/// Channel-specific rendering of a batch of change events.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text { subject: String, body: String },
    Json(JsonValue),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelDeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl Retryable for ChannelDeliveryError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transient(_) => RetryDisposition::Retryable,
            Self::Permanent(_) => RetryDisposition::NonRetryable,
        }
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn format(&self, events: &[ChangeEvent]) -> Payload;

    /// One delivery attempt. Retrying is the dispatcher's job.
    async fn deliver(&self, payload: &Payload) -> Result<(), ChannelDeliveryError>;
}

pub fn alert_subject(change_count: usize) -> String {
    format!("CMS Star Rating Alert: {change_count} Change(s) Detected")
}

/// Plain-text alert body, one block per facility, one line per changed metric.
pub fn alert_body(events: &[ChangeEvent]) -> String {
    let mut by_entity: BTreeMap<(&str, &str), Vec<&ChangeEvent>> = BTreeMap::new();
    for event in events {
        by_entity
            .entry((event.entity_id.as_str(), event.entity_label.as_str()))
            .or_default()
            .push(event);
    }

    let mut body = format!(
        "{} star rating change(s) detected across {} facilit{}.\n",
        events.len(),
        by_entity.len(),
        if by_entity.len() == 1 { "y" } else { "ies" }
    );
    for ((_, label), changes) in by_entity {
        body.push('\n');
        body.push_str(label);
        body.push('\n');
        for change in changes {
            body.push_str(&format!(
                "  - {} (as of {}, previously {})\n",
                change.summary(),
                change.current_as_of,
                change.previous_as_of
            ));
        }
    }
    body
}

pub fn alert_json(events: &[ChangeEvent], timestamp: DateTime<Utc>) -> JsonValue {
    json!({
        "timestamp": timestamp.to_rfc3339(),
        "change_count": events.len(),
        "changes": events,
    })
}

/// Delivers change events to channels concurrently, bounded by `max_workers`, with
/// each channel retried under its own copy of the backoff policy.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    backoff: BackoffPolicy,
    max_workers: usize,
}

impl Dispatcher {
    pub fn new(backoff: BackoffPolicy, max_workers: usize) -> Self {
        Self {
            backoff,
            max_workers: max_workers.max(1),
        }
    }

    /// Never fails: every channel gets exactly one outcome, returned in configuration order.
    pub async fn dispatch(
        &self,
        events: &[ChangeEvent],
        channels: &[ConfiguredChannel],
        deadline: Deadline,
    ) -> Vec<NotificationOutcome> {
        let event_ids: Vec<_> = events.iter().map(|e| e.id).collect();
        let mut outcomes: Vec<NotificationOutcome> = channels
            .iter()
            .map(|c| NotificationOutcome {
                channel: c.name.clone(),
                change_event_ids: event_ids.clone(),
                status: DeliveryStatus::Failed("delivery task did not complete".to_string()),
                attempts: 0,
            })
            .collect();

        let events: Arc<[ChangeEvent]> = Arc::from(events.to_vec());
        let limit = Arc::new(Semaphore::new(self.max_workers.min(channels.len().max(1))));
        let mut tasks = JoinSet::new();

        for (index, configured) in channels.iter().enumerate() {
            let skip_reason = if !configured.enabled {
                Some("channel disabled")
            } else if events.is_empty() {
                Some("no changes to report")
            } else {
                None
            };
            if let Some(reason) = skip_reason {
                outcomes[index].status = DeliveryStatus::Skipped(reason.to_string());
                continue;
            }
            let channel = match &configured.transport {
                Ok(channel) => Arc::clone(channel),
                Err(reason) => {
                    warn!(channel = %configured.name, %reason, "channel is misconfigured");
                    outcomes[index].status =
                        DeliveryStatus::Failed(format!("misconfigured: {reason}"));
                    continue;
                }
            };

            let events = Arc::clone(&events);
            let limit = Arc::clone(&limit);
            let backoff = self.backoff;
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await;
                let payload = channel.format(&events);
                let result = backoff
                    .retry(deadline, |_attempt| channel.deliver(&payload))
                    .await;
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(error = %err, "notification task aborted");
                    continue;
                }
            };
            let outcome = &mut outcomes[index];
            match result {
                Ok(retried) => {
                    info!(
                        channel = %outcome.channel,
                        attempts = retried.attempts,
                        changes = outcome.change_event_ids.len(),
                        "notification delivered"
                    );
                    outcome.status = DeliveryStatus::Delivered;
                    outcome.attempts = retried.attempts;
                }
                Err(failure) => {
                    let reason = failure.reason();
                    warn!(
                        channel = %outcome.channel,
                        attempts = failure.attempts,
                        %reason,
                        "notification failed"
                    );
                    outcome.status = DeliveryStatus::Failed(reason);
                    outcome.attempts = failure.attempts;
                }
            }
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use starwatch_core::{Direction, EntityId, MetricKey};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn event(id: &str, metric: &str, prev: u8, cur: u8) -> ChangeEvent {
        let entity_id = EntityId::parse(id).unwrap();
        let metric = MetricKey::new(metric);
        let previous_as_of = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let current_as_of = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        ChangeEvent {
            id: ChangeEvent::deterministic_id(&entity_id, &metric, previous_as_of, current_as_of),
            entity_label: format!("HOME {id} (CCN {entity_id}) - AUSTIN, TX"),
            entity_id,
            metric,
            previous_value: prev,
            current_value: cur,
            direction: Direction::between(prev, cur).unwrap(),
            previous_as_of,
            current_as_of,
        }
    }

    /// Fails the first `failures` attempts with the given error, then succeeds.
    struct ScriptedChannel {
        failures: u32,
        error: ChannelDeliveryError,
        calls: AtomicU32,
    }

    impl ScriptedChannel {
        fn new(failures: u32, error: ChannelDeliveryError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl NotificationChannel for ScriptedChannel {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Webhook
        }

        fn format(&self, events: &[ChangeEvent]) -> Payload {
            Payload::Json(alert_json(events, Utc::now()))
        }

        async fn deliver(&self, _payload: &Payload) -> Result<(), ChannelDeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    fn configured(name: &str, enabled: bool, channel: Arc<ScriptedChannel>) -> ConfiguredChannel {
        let channel: Arc<dyn NotificationChannel> = channel;
        ConfiguredChannel {
            name: name.to_string(),
            kind: ChannelKind::Webhook,
            enabled,
            transport: Ok(channel),
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: 0.0,
            },
            4,
        )
    }

    #[test]
    fn subject_and_body_group_changes_by_facility() {
        let events = vec![
            event("455682", "overall", 3, 4),
            event("455682", "staffing", 4, 2),
            event("015010", "overall", 4, 3),
        ];
        assert_eq!(alert_subject(events.len()), "CMS Star Rating Alert: 3 Change(s) Detected");
        let body = alert_body(&events);
        assert!(body.starts_with("3 star rating change(s) detected across 2 facilities."));
        assert!(body.contains("  - Overall: 3→4 ↑ (as of 2024-03-01, previously 2024-02-01)"));
        assert!(body.contains("  - Staffing: 4→2 ↓"));
        let first = body.find("015010").unwrap();
        let second = body.find("455682").unwrap();
        assert!(first < second);
    }

    #[test]
    fn json_payload_carries_count_and_changes() {
        let events = vec![event("455682", "overall", 3, 4)];
        let ts = DateTime::parse_from_rfc3339("2024-03-02T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let value = alert_json(&events, ts);
        assert_eq!(value["change_count"], 1);
        assert_eq!(value["timestamp"], "2024-03-02T08:00:00+00:00");
        assert_eq!(value["changes"][0]["direction"], "up");
        assert_eq!(value["changes"][0]["entity_id"], "455682");
    }

    #[tokio::test]
    async fn one_failing_channel_does_not_block_another() {
        let failing = ScriptedChannel::new(u32::MAX, ChannelDeliveryError::Transient("503".into()));
        let healthy = ScriptedChannel::new(0, ChannelDeliveryError::Transient("unused".into()));
        let channels = vec![
            configured("a", true, Arc::clone(&failing)),
            configured("b", true, Arc::clone(&healthy)),
        ];
        let events = vec![event("455682", "overall", 3, 4)];

        let outcomes = dispatcher().dispatch(&events, &channels, Deadline::none()).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].channel, "a");
        assert!(matches!(outcomes[0].status, DeliveryStatus::Failed(_)));
        assert_eq!(outcomes[0].attempts, 3);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcomes[1].channel, "b");
        assert_eq!(outcomes[1].status, DeliveryStatus::Delivered);
        assert_eq!(outcomes[1].attempts, 1);
        assert_eq!(outcomes[1].change_event_ids, vec![events[0].id]);
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_budget() {
        let flaky = ScriptedChannel::new(2, ChannelDeliveryError::Transient("timeout".into()));
        let channels = vec![configured("flaky", true, Arc::clone(&flaky))];
        let outcomes = dispatcher()
            .dispatch(&[event("455682", "overall", 3, 4)], &channels, Deadline::none())
            .await;
        assert_eq!(outcomes[0].status, DeliveryStatus::Delivered);
        assert_eq!(outcomes[0].attempts, 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let broken = ScriptedChannel::new(u32::MAX, ChannelDeliveryError::Permanent("401".into()));
        let channels = vec![configured("broken", true, Arc::clone(&broken))];
        let outcomes = dispatcher()
            .dispatch(&[event("455682", "overall", 3, 4)], &channels, Deadline::none())
            .await;
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        match &outcomes[0].status {
            DeliveryStatus::Failed(reason) => assert!(reason.contains("401")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_channels_and_empty_batches_are_skipped() {
        let channel = ScriptedChannel::new(0, ChannelDeliveryError::Transient("unused".into()));
        let channels = vec![
            configured("off", false, Arc::clone(&channel)),
            configured("on", true, Arc::clone(&channel)),
        ];

        let outcomes = dispatcher()
            .dispatch(&[event("455682", "overall", 3, 4)], &channels[..1], Deadline::none())
            .await;
        assert_eq!(outcomes[0].status, DeliveryStatus::Skipped("channel disabled".into()));

        let outcomes = dispatcher().dispatch(&[], &channels, Deadline::none()).await;
        assert!(outcomes
            .iter()
            .all(|o| matches!(o.status, DeliveryStatus::Skipped(_)) && o.attempts == 0));
        assert_eq!(channel.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn misconfigured_channel_fails_without_attempts() {
        let channels = vec![ConfiguredChannel {
            name: "mail".to_string(),
            kind: ChannelKind::Email,
            enabled: true,
            transport: Err("env var SMTP_PASSWORD is not set".to_string()),
        }];
        let outcomes = dispatcher()
            .dispatch(&[event("455682", "overall", 3, 4)], &channels, Deadline::none())
            .await;
        assert_eq!(outcomes[0].attempts, 0);
        assert!(matches!(&outcomes[0].status, DeliveryStatus::Failed(r) if r.contains("SMTP_PASSWORD")));
    }
}
