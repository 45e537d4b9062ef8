//! Sharing one upstream webhook between many subscribers.
//!
//! A registration's scope only ever grows. Requests covered by the current
//! scope join it as-is, strict supersets expand it, and requests disjoint
//! from it are left unserved rather than unioned in.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{ReconcileError, ScopeError, StoreError};
use crate::store::RegistrationStore;
use crate::types::{Registration, SubscriberConfig, SubscriptionScope};
use crate::upstream::{UpstreamWebhook, WebhookRequest, WebhookResource};
use chrono::Utc;

/// Read-decide-write cycles attempted before giving up on a contended account.
const MAX_ATTEMPTS: u32 = 3;

const ACTIVE_STATE: &str = "active";

/// Decode a `{"subscriptions": [..]}` config into a scope.
pub fn decode_scope(config: &Value) -> Result<SubscriptionScope, ScopeError> {
    if !config.is_object() {
        return Err(ScopeError(format!("expected an object, got {config}")));
    }
    serde_json::from_value(config.clone()).map_err(|e| ScopeError(e.to_string()))
}

/// Whether two subscription configs can share one registration.
pub fn compare_config(a: &Value, b: &Value) -> Result<bool, ScopeError> {
    Ok(scopes_compatible(&decode_scope(a)?, &decode_scope(b)?))
}

pub fn scopes_compatible(a: &SubscriptionScope, b: &SubscriptionScope) -> bool {
    a.is_subset(b) || b.is_subset(a)
}

/// Merge a requested config into the current one. Returns the resulting
/// scope and whether it differs from `current`.
pub fn merge(current: &Value, requested: &Value) -> Result<(SubscriptionScope, bool), ScopeError> {
    Ok(merge_scopes(&decode_scope(current)?, &decode_scope(requested)?))
}

pub fn merge_scopes(
    current: &SubscriptionScope,
    requested: &SubscriptionScope,
) -> (SubscriptionScope, bool) {
    if current.is_subset(requested) && !requested.is_subset(current) {
        (requested.clone(), true)
    } else {
        (current.clone(), false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// No upstream webhook existed; one was created.
    Created,
    /// An upstream webhook pointing at our callback URL was taken over.
    Adopted { expanded: bool },
    /// The registration already covered the request.
    Joined,
    /// The registration's scope was widened to the request.
    Expanded,
    /// The request is disjoint from the registration and gets no deliveries.
    Unserved,
}

impl SetupOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Adopted { .. } => "adopted",
            Self::Joined => "joined",
            Self::Expanded => "expanded",
            Self::Unserved => "unserved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    Detached,
    /// The last subscriber left and the upstream webhook was deleted.
    Deleted,
}

/// Drives the upstream registration for a single provider account.
///
/// Setups and teardowns for the account are serialized internally; the
/// store's compare-and-swap catches writers outside this process.
pub struct SubscriptionReconciler {
    store: Arc<dyn RegistrationStore>,
    upstream: Arc<dyn WebhookResource>,
    account: String,
    callback_url: String,
    secret: String,
    lock: Mutex<()>,
}

impl SubscriptionReconciler {
    pub fn new(
        store: Arc<dyn RegistrationStore>,
        upstream: Arc<dyn WebhookResource>,
        account: impl Into<String>,
        callback_url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            store,
            upstream,
            account: account.into(),
            callback_url: callback_url.into(),
            secret: secret.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    /// Attach `subscriber` to the account's registration, creating or
    /// expanding it upstream as needed. Nothing is stored unless every
    /// upstream call succeeded.
    pub async fn attach(&self, subscriber: &SubscriberConfig) -> Result<SetupOutcome, ReconcileError> {
        debug_assert_eq!(subscriber.account, self.account);
        let _guard = self.lock.lock().await;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_attach(subscriber).await {
                Err(ReconcileError::Store(err @ StoreError::Conflict { .. })) => {
                    tracing::warn!(
                        account = %self.account,
                        subscriber_id = %subscriber.id,
                        attempt,
                        error = %err,
                        "Registration changed during setup, retrying"
                    );
                }
                Ok(outcome) => {
                    tracing::info!(
                        account = %self.account,
                        subscriber_id = %subscriber.id,
                        outcome = outcome.as_str(),
                        "Subscriber setup finished"
                    );
                    return Ok(outcome);
                }
                Err(err) => return Err(err),
            }
        }

        Err(ReconcileError::Conflict {
            account: self.account.clone(),
            attempts: MAX_ATTEMPTS,
        })
    }

    async fn try_attach(&self, subscriber: &SubscriberConfig) -> Result<SetupOutcome, ReconcileError> {
        let Some(current) = self.store.get(&self.account)? else {
            return self.register(subscriber).await;
        };

        if !scopes_compatible(&current.scope, &subscriber.scope) {
            tracing::warn!(
                account = %self.account,
                subscriber_id = %subscriber.id,
                registered = ?current.scope.subscriptions,
                requested = ?subscriber.scope.subscriptions,
                "Requested scope is disjoint from the registration, subscriber left unserved"
            );
            return Ok(SetupOutcome::Unserved);
        }

        let (scope, changed) = merge_scopes(&current.scope, &subscriber.scope);
        let expected = current.version;
        let mut next = current.clone();
        if changed {
            self.upstream
                .update_webhook(&current.webhook_id, &self.request(&scope, None))
                .await?;
            next.scope = scope;
        }
        next.subscribers.insert(subscriber.id.clone());

        self.commit(next, Some(expected), subscriber)?;

        Ok(if changed {
            SetupOutcome::Expanded
        } else {
            SetupOutcome::Joined
        })
    }

    /// First subscriber for the account: find our webhook upstream or create it.
    async fn register(&self, subscriber: &SubscriberConfig) -> Result<SetupOutcome, ReconcileError> {
        let webhooks = self.upstream.list_webhooks().await?;
        let existing = webhooks.into_iter().find(|w| w.url == self.callback_url);

        let (webhook, scope, outcome) = match existing {
            Some(webhook) => {
                let current = SubscriptionScope::new(webhook.subscriptions.iter().cloned());
                let union = current.union(&subscriber.scope);
                let expanded = union != current;
                // A configured secret must be the one the provider signs with.
                let rotate = (!self.secret.is_empty()
                    && webhook.secret.as_deref() != Some(self.secret.as_str()))
                .then(|| self.secret.clone());
                if expanded || rotate.is_some() {
                    if rotate.is_some() {
                        tracing::info!(
                            account = %self.account,
                            webhook_id = %webhook.id,
                            "Pushing configured secret to adopted webhook"
                        );
                    }
                    self.upstream
                        .update_webhook(&webhook.id, &self.request(&union, rotate))
                        .await?;
                }
                (webhook, union, SetupOutcome::Adopted { expanded })
            }
            None => {
                let secret = (!self.secret.is_empty()).then(|| self.secret.clone());
                let webhook = self
                    .upstream
                    .create_webhook(&self.request(&subscriber.scope, secret))
                    .await?;
                (webhook, subscriber.scope.clone(), SetupOutcome::Created)
            }
        };

        let registration = Registration {
            account: self.account.clone(),
            webhook_id: webhook.id.clone(),
            url: self.callback_url.clone(),
            secret: self.effective_secret(&webhook),
            scope,
            subscribers: [subscriber.id.clone()].into(),
            version: 0,
            updated_at: Utc::now(),
        };

        self.commit(registration, None, subscriber)?;
        Ok(outcome)
    }

    /// Store the subscriber record, then the registration naming it. If the
    /// registration write fails the subscriber record is put back as it was.
    fn commit(
        &self,
        registration: Registration,
        expected: Option<u64>,
        subscriber: &SubscriberConfig,
    ) -> Result<(), ReconcileError> {
        let previous = self.store.get_subscriber(&subscriber.id)?;
        self.store.put_subscriber(subscriber.clone())?;

        if let Err(err) = self.store.compare_and_swap(registration, expected) {
            let restored = match previous {
                Some(previous) => self.store.put_subscriber(previous),
                None => self.store.remove_subscriber(&subscriber.id).map(|_| ()),
            };
            if let Err(e) = restored {
                tracing::error!(
                    account = %self.account,
                    subscriber_id = %subscriber.id,
                    error = %e,
                    "Failed to restore subscriber record"
                );
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// The configured secret wins (adoption pushes it upstream first);
    /// otherwise keep whatever the provider issued.
    fn effective_secret(&self, webhook: &UpstreamWebhook) -> String {
        if !self.secret.is_empty() {
            return self.secret.clone();
        }
        webhook.secret.clone().unwrap_or_default()
    }

    fn request(&self, scope: &SubscriptionScope, secret: Option<String>) -> WebhookRequest {
        WebhookRequest {
            url: self.callback_url.clone(),
            state: Some(ACTIVE_STATE.to_string()),
            secret,
            subscriptions: scope.to_vec(),
        }
    }

    /// Detach a subscriber. The scope is never narrowed; the upstream webhook
    /// is deleted once no subscriber is left.
    pub async fn detach(&self, subscriber_id: &str) -> Result<TeardownOutcome, ReconcileError> {
        let _guard = self.lock.lock().await;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_detach(subscriber_id).await {
                Err(ReconcileError::Store(err @ StoreError::Conflict { .. })) => {
                    tracing::warn!(
                        account = %self.account,
                        subscriber_id,
                        attempt,
                        error = %err,
                        "Registration changed during teardown, retrying"
                    );
                }
                other => return other,
            }
        }

        Err(ReconcileError::Conflict {
            account: self.account.clone(),
            attempts: MAX_ATTEMPTS,
        })
    }

    async fn try_detach(&self, subscriber_id: &str) -> Result<TeardownOutcome, ReconcileError> {
        if self.store.get_subscriber(subscriber_id)?.is_none() {
            return Err(ReconcileError::UnknownSubscriber(subscriber_id.to_string()));
        }

        let mut outcome = TeardownOutcome::Detached;
        if let Some(current) = self.store.get(&self.account)? {
            if current.subscribers.contains(subscriber_id) {
                let mut next = current.clone();
                next.subscribers.remove(subscriber_id);

                if next.subscribers.is_empty() {
                    self.upstream.delete_webhook(&current.webhook_id).await?;
                    self.store.remove(&self.account, current.version)?;
                    outcome = TeardownOutcome::Deleted;
                    tracing::info!(
                        account = %self.account,
                        webhook_id = %current.webhook_id,
                        "Last subscriber removed, upstream webhook deleted"
                    );
                } else {
                    self.store.compare_and_swap(next, Some(current.version))?;
                }
            }
        }

        self.store.remove_subscriber(subscriber_id)?;
        Ok(outcome)
    }
}
