//! Incident event filtering and normalization.
//!
//! [`evaluate`] decides, for one subscriber, whether a delivery becomes an
//! internal event. It is a pure function of the payload and the subscriber's
//! [`FilterConfig`].

use serde_json::{json, Map, Value};

use crate::types::{
    FieldValue, FilterConfig, MissingSeverityPolicy, NormalizedEvent, Operation, WebhookPayload,
    DEFAULT_MILESTONE,
};

const INCIDENT_RESOURCE: &str = "incident";

/// Fields reduced from `{slug: ...}` objects to their slug.
const SLUGGED_FIELDS: [&str; 3] = ["severity", "priority", "current_milestone"];

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Emit(NormalizedEvent),
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAnIncident,
    UnsupportedOperation,
    StartedNotSelected,
    CreationEcho,
    MilestoneNotSelected,
    SeverityMissing,
    SeverityNotSelected,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotAnIncident => "not_an_incident",
            Self::UnsupportedOperation => "unsupported_operation",
            Self::StartedNotSelected => "started_not_selected",
            Self::CreationEcho => "creation_echo",
            Self::MilestoneNotSelected => "milestone_not_selected",
            Self::SeverityMissing => "severity_missing",
            Self::SeverityNotSelected => "severity_not_selected",
        }
    }
}

pub fn evaluate(payload: &WebhookPayload, config: &FilterConfig) -> Decision {
    match decide(payload, config) {
        Ok(operation) => Decision::Emit(build_event(payload, operation)),
        Err(reason) => Decision::Skip(reason),
    }
}

fn decide(payload: &WebhookPayload, config: &FilterConfig) -> Result<Operation, SkipReason> {
    if payload.event.resource_type != INCIDENT_RESOURCE {
        return Err(SkipReason::NotAnIncident);
    }

    let operation =
        Operation::parse(&payload.event.operation).ok_or(SkipReason::UnsupportedOperation)?;
    let incident = payload.data.incident.as_ref();

    match operation {
        // A new incident is always at the "started" milestone.
        Operation::Created => {
            if !config.allows_milestone(DEFAULT_MILESTONE) {
                return Err(SkipReason::StartedNotSelected);
            }
        }
        Operation::Updated => {
            // The provider follows every CREATED with an UPDATED carrying a
            // single milestone entry.
            if milestone_history_len(incident) == Some(1) {
                return Err(SkipReason::CreationEcho);
            }
            match current_milestone(incident) {
                Some(m) if !m.is_empty() && config.allows_milestone(m) => {}
                _ => return Err(SkipReason::MilestoneNotSelected),
            }
        }
    }

    if let Some(allowed) = config.severity_filter() {
        match severity_slug(incident) {
            Some(slug) if allowed.contains(slug) => {}
            Some(_) => return Err(SkipReason::SeverityNotSelected),
            None if config.missing_severity == MissingSeverityPolicy::Accept => {}
            None => return Err(SkipReason::SeverityMissing),
        }
    }

    Ok(operation)
}

fn milestone_history_len(incident: Option<&Map<String, Value>>) -> Option<usize> {
    incident?.get("milestones")?.as_array().map(Vec::len)
}

fn current_milestone(incident: Option<&Map<String, Value>>) -> Option<&str> {
    incident
        .and_then(|i| i.get("current_milestone"))
        .and_then(|v| FieldValue::classify(v).slug())
}

/// Severity slug of an incident, whether sent as `{"slug": ..}` or flat.
pub fn severity_slug(incident: Option<&Map<String, Value>>) -> Option<&str> {
    incident
        .and_then(|i| i.get("severity"))
        .and_then(|v| FieldValue::classify(v).slug())
        .filter(|s| !s.is_empty())
}

/// Copy of `raw` with slugged compound fields reduced to their slug.
pub fn normalize_incident(raw: &Map<String, Value>) -> Map<String, Value> {
    let mut normalized = raw.clone();
    for field in SLUGGED_FIELDS {
        let Some(value) = raw.get(field) else {
            continue;
        };
        match FieldValue::classify(value) {
            FieldValue::Slugged { slug } => {
                normalized.insert(field.to_string(), Value::String(slug.to_string()));
            }
            FieldValue::Scalar(_) | FieldValue::Other => {}
        }
    }
    normalized
}

fn build_event(payload: &WebhookPayload, operation: Operation) -> NormalizedEvent {
    let mut data = json!({
        "event": operation.event_name(),
        "operation": operation.as_str(),
        "resource_type": payload.event.resource_type,
    });
    if let Some(incident) = &payload.data.incident {
        data["incident"] = Value::Object(normalize_incident(incident));
    }

    NormalizedEvent {
        event_type: operation.event_type(),
        payload: data,
    }
}
