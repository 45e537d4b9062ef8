//! Verify → filter → emit for one inbound delivery.

use tokio::sync::mpsc;

use crate::error::{DeliveryError, EmitError};
use crate::filter::{self, Decision};
use crate::types::{NormalizedEvent, Registration, SubscriberConfig, WebhookPayload};
use crate::verification::verify_signature;

/// An event addressed to one subscriber, waiting to be published to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub subscriber_id: String,
    pub event: NormalizedEvent,
}

/// Receives the events a delivery produces.
pub trait EventSink: Send + Sync {
    fn emit(&self, subscriber_id: &str, event: NormalizedEvent) -> Result<(), EmitError>;
}

/// Forwards events to the host publisher task.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PendingEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<PendingEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, subscriber_id: &str, event: NormalizedEvent) -> Result<(), EmitError> {
        self.tx
            .send(PendingEvent {
                subscriber_id: subscriber_id.to_string(),
                event,
            })
            .map_err(|_| EmitError::Closed)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryOutcome {
    pub operation: String,
    pub resource_type: String,
    pub emitted_to: Vec<String>,
}

/// Authenticate `body` against the registration secret, then run every
/// attached subscriber's filter over it.
///
/// Subscribers not attached to `registration` are ignored. A delivery that
/// matches no subscriber is still a success. An emit failure does not stop
/// the remaining subscribers from receiving the event; the first failure is
/// returned once all of them were tried.
pub fn handle_delivery(
    registration: &Registration,
    subscribers: &[SubscriberConfig],
    signature: &str,
    body: &[u8],
    sink: &dyn EventSink,
) -> Result<DeliveryOutcome, DeliveryError> {
    verify_signature(signature, body, registration.secret.as_bytes())?;

    let payload: WebhookPayload = serde_json::from_slice(body)?;
    let mut outcome = DeliveryOutcome {
        operation: payload.event.operation.clone(),
        resource_type: payload.event.resource_type.clone(),
        emitted_to: Vec::new(),
    };

    let attached = subscribers
        .iter()
        .filter(|s| registration.subscribers.contains(&s.id));
    let mut failed = None;
    for subscriber in attached {
        match filter::evaluate(&payload, &subscriber.filter) {
            Decision::Emit(event) => {
                tracing::info!(
                    account = %registration.account,
                    subscriber_id = %subscriber.id,
                    event_type = %event.event_type,
                    "Emitting incident event"
                );
                match sink.emit(&subscriber.id, event) {
                    Ok(()) => outcome.emitted_to.push(subscriber.id.clone()),
                    Err(err) => {
                        tracing::error!(
                            account = %registration.account,
                            subscriber_id = %subscriber.id,
                            error = %err,
                            "Failed to emit event"
                        );
                        failed.get_or_insert(err);
                    }
                }
            }
            Decision::Skip(reason) => {
                tracing::debug!(
                    account = %registration.account,
                    subscriber_id = %subscriber.id,
                    operation = %outcome.operation,
                    resource_type = %outcome.resource_type,
                    reason = reason.as_str(),
                    "Delivery filtered out"
                );
            }
        }
    }

    if let Some(err) = failed {
        return Err(err.into());
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VerifyError;
    use crate::types::{FilterConfig, SubscriptionScope};
    use crate::verification::compute_signature;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<PendingEvent>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, subscriber_id: &str, event: NormalizedEvent) -> Result<(), EmitError> {
            self.events.lock().unwrap().push(PendingEvent {
                subscriber_id: subscriber_id.to_string(),
                event,
            });
            Ok(())
        }
    }

    fn registration(secret: &str, subscribers: &[&str]) -> Registration {
        Registration {
            account: "acme".into(),
            webhook_id: "wh-1".into(),
            url: "https://hooks.example.com/webhooks/acme".into(),
            secret: secret.into(),
            scope: SubscriptionScope::incidents(),
            subscribers: subscribers.iter().map(|s| s.to_string()).collect(),
            version: 1,
            updated_at: Utc::now(),
        }
    }

    fn subscriber(id: &str, filter: FilterConfig) -> SubscriberConfig {
        SubscriberConfig {
            id: id.into(),
            account: "acme".into(),
            scope: SubscriptionScope::incidents(),
            filter,
            created_at: Utc::now(),
        }
    }

    const BODY: &[u8] = br#"{"data":{"incident":{"id":"i1","severity":{"slug":"SEV1"}}},"event":{"operation":"CREATED","resource_type":"incident"}}"#;

    #[test]
    fn signed_created_incident_reaches_matching_subscribers() {
        let reg = registration("s3cret", &["sev1", "sev2", "defaults"]);
        let subs = vec![
            subscriber(
                "sev1",
                FilterConfig {
                    severities: Some(["SEV1".to_string()].into()),
                    ..Default::default()
                },
            ),
            subscriber(
                "sev2",
                FilterConfig {
                    severities: Some(["SEV2".to_string()].into()),
                    ..Default::default()
                },
            ),
            subscriber("defaults", FilterConfig::default()),
            subscriber("detached", FilterConfig::default()),
        ];
        let sink = RecordingSink::default();
        let sig = compute_signature(b"s3cret", BODY).unwrap();

        let outcome = handle_delivery(&reg, &subs, &sig, BODY, &sink).unwrap();
        assert_eq!(outcome.emitted_to, vec!["sev1", "defaults"]);
        assert_eq!(outcome.operation, "CREATED");

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.event_type, "firehydrant.incident.created");
        assert_eq!(events[0].event.payload["incident"]["severity"], json!("SEV1"));
    }

    #[test]
    fn bad_signature_emits_nothing() {
        let reg = registration("s3cret", &["a"]);
        let subs = vec![subscriber("a", FilterConfig::default())];
        let sink = RecordingSink::default();

        let err = handle_delivery(&reg, &subs, "deadbeef", BODY, &sink).unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Verification(VerifyError::SignatureMismatch)
        ));
        let err = handle_delivery(&reg, &subs, "", BODY, &sink).unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Verification(VerifyError::MissingSignature)
        ));
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn unsigned_mode_accepts_anything() {
        let reg = registration("", &["a"]);
        let subs = vec![subscriber("a", FilterConfig::default())];
        let sink = RecordingSink::default();

        let outcome = handle_delivery(&reg, &subs, "whatever", BODY, &sink).unwrap();
        assert_eq!(outcome.emitted_to, vec!["a"]);
    }

    #[test]
    fn malformed_body_is_rejected_after_verification() {
        let reg = registration("s3cret", &["a"]);
        let subs = vec![subscriber("a", FilterConfig::default())];
        let sink = RecordingSink::default();
        let body = b"not json";
        let sig = compute_signature(b"s3cret", body).unwrap();

        let err = handle_delivery(&reg, &subs, &sig, body, &sink).unwrap_err();
        assert!(matches!(err, DeliveryError::Malformed(_)));
    }

    /// Rejects events for one subscriber id.
    #[derive(Default)]
    struct PartialSink {
        reject: &'static str,
        inner: RecordingSink,
    }

    impl EventSink for PartialSink {
        fn emit(&self, subscriber_id: &str, event: NormalizedEvent) -> Result<(), EmitError> {
            if subscriber_id == self.reject {
                return Err(EmitError::Closed);
            }
            self.inner.emit(subscriber_id, event)
        }
    }

    #[test]
    fn emit_failure_still_reaches_later_subscribers() {
        let reg = registration("", &["a", "b", "c"]);
        let subs = vec![
            subscriber("a", FilterConfig::default()),
            subscriber("b", FilterConfig::default()),
            subscriber("c", FilterConfig::default()),
        ];
        let sink = PartialSink {
            reject: "a",
            ..Default::default()
        };

        let err = handle_delivery(&reg, &subs, "", BODY, &sink).unwrap_err();
        assert!(matches!(err, DeliveryError::Emit(EmitError::Closed)));

        let events = sink.inner.events.lock().unwrap();
        let ids: Vec<&str> = events.iter().map(|p| p.subscriber_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn closed_sink_surfaces_emit_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = ChannelSink::new(tx);
        let reg = registration("", &["a"]);
        let subs = vec![subscriber("a", FilterConfig::default())];

        let err = handle_delivery(&reg, &subs, "", BODY, &sink).unwrap_err();
        assert!(matches!(err, DeliveryError::Emit(EmitError::Closed)));
    }
}
