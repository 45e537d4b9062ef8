use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Event class every subscriber asks for unless configured otherwise.
pub const DEFAULT_SUBSCRIPTION: &str = "incidents";

/// Milestone assumed by the filter when no allow-list is configured.
pub const DEFAULT_MILESTONE: &str = "started";

/// Prefix of every event type handed to the host.
pub const EVENT_DOMAIN: &str = "firehydrant";

// ─── Scopes and registrations ───────────────────────────────────────────────

/// A set of provider event classes, e.g. `{"incidents", "incidents.private"}`.
///
/// Comparisons are order-independent and case-sensitive. Values are stored
/// exactly as received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionScope {
    #[serde(default)]
    pub subscriptions: BTreeSet<String>,
}

impl SubscriptionScope {
    pub fn new<I, S>(subscriptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subscriptions: subscriptions.into_iter().map(Into::into).collect(),
        }
    }

    /// The scope a subscriber gets when it does not name one: `{"incidents"}`.
    pub fn incidents() -> Self {
        Self::new([DEFAULT_SUBSCRIPTION])
    }

    pub fn is_subset(&self, other: &Self) -> bool {
        self.subscriptions.is_subset(&other.subscriptions)
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            subscriptions: self
                .subscriptions
                .union(&other.subscriptions)
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Sorted, deduplicated list as sent to the provider.
    pub fn to_vec(&self) -> Vec<String> {
        self.subscriptions.iter().cloned().collect()
    }
}

/// The single upstream webhook serving one provider account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub account: String,
    pub webhook_id: String,
    pub url: String,
    /// Shared HMAC secret. Empty means deliveries are not authenticated.
    #[serde(default)]
    pub secret: String,
    #[serde(flatten)]
    pub scope: SubscriptionScope,
    /// Subscriber ids currently attached to this registration.
    #[serde(default)]
    pub subscribers: BTreeSet<String>,
    /// Optimistic-concurrency token, bumped on every stored write.
    #[serde(default)]
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

// ─── Subscriber configuration ───────────────────────────────────────────────

/// What to do with an incident that carries no severity while a severity
/// allow-list is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingSeverityPolicy {
    #[default]
    Reject,
    Accept,
}

/// Per-subscriber acceptance criteria.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Severity slugs to accept. `None` or empty accepts every severity.
    #[serde(default)]
    pub severities: Option<BTreeSet<String>>,
    /// Milestones to trigger on. `None` means `{"started"}`.
    #[serde(default)]
    pub current_milestone: Option<BTreeSet<String>>,
    #[serde(default)]
    pub missing_severity: MissingSeverityPolicy,
}

impl FilterConfig {
    pub fn allows_milestone(&self, milestone: &str) -> bool {
        match &self.current_milestone {
            Some(allowed) => allowed.contains(milestone),
            None => milestone == DEFAULT_MILESTONE,
        }
    }

    /// The configured severity allow-list, if it actually filters anything.
    pub fn severity_filter(&self) -> Option<&BTreeSet<String>> {
        self.severities.as_ref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    pub id: String,
    pub account: String,
    #[serde(flatten)]
    pub scope: SubscriptionScope,
    #[serde(default)]
    pub filter: FilterConfig,
    pub created_at: DateTime<Utc>,
}

// ─── Inbound deliveries ─────────────────────────────────────────────────────

/// Body of a provider POST. Missing sections decode to their defaults so that
/// unexpected shapes are filtered out rather than rejected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub data: WebhookData,
    #[serde(default)]
    pub event: WebhookEvent,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookData {
    #[serde(default)]
    pub incident: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub resource_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Created,
    Updated,
}

impl Operation {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "CREATED" => Some(Self::Created),
            "UPDATED" => Some(Self::Updated),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
        }
    }

    /// Name carried in the payload's `event` field.
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Created => "incident.created",
            Self::Updated => "incident.updated",
        }
    }

    /// Fully qualified event type, e.g. `firehydrant.incident.created`.
    pub fn event_type(self) -> String {
        format!("{EVENT_DOMAIN}.{}", self.event_name())
    }
}

/// Typed view over a loosely typed incident field such as `severity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Scalar(&'a str),
    Slugged { slug: &'a str },
    Other,
}

impl<'a> FieldValue<'a> {
    pub fn classify(value: &'a Value) -> Self {
        match value {
            Value::String(s) => Self::Scalar(s),
            Value::Object(obj) => match obj.get("slug") {
                Some(Value::String(slug)) => Self::Slugged { slug },
                _ => Self::Other,
            },
            _ => Self::Other,
        }
    }

    pub fn slug(self) -> Option<&'a str> {
        match self {
            Self::Scalar(s) | Self::Slugged { slug: s } => Some(s),
            Self::Other => None,
        }
    }
}

/// Internal event handed to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
    pub event_type: String,
    pub payload: Value,
}

// ─── Delivery log ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Processed,
    VerificationFailed,
    Malformed,
    EmitFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub account: String,
    pub received_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    /// Subscribers that received an event from this delivery.
    #[serde(default)]
    pub emitted_to: Vec<String>,
}
