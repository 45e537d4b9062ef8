//! Host control plane: newline-delimited JSON-RPC 2.0 over stdio.
//!
//! The host sends `initialize`, `execute` and `shutdown` requests; emitted
//! events travel back as `event.publish` notifications.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::delivery_log::DeliveryLog;
use crate::dispatch::{EventSink, PendingEvent};
use crate::http_server::{self, ServerState};
use crate::reconciler::{SubscriptionReconciler, TeardownOutcome};
use crate::store::{JsonStore, RegistrationStore};
use crate::types::{
    FilterConfig, MissingSeverityPolicy, Registration, SubscriberConfig, SubscriptionScope,
};
use crate::upstream::WebhookResource;
use chrono::Utc;

// ─── JSON-RPC wire types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;
const OPERATION_FAILED: i64 = -32000;

fn ok_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(result),
        error: None,
        id,
    }
}

fn err_response(id: Value, code: i64, message: String) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: None,
        error: Some(JsonRpcError { code, message }),
        id,
    }
}

pub fn parse_error(message: String) -> JsonRpcResponse {
    err_response(Value::Number(0.into()), PARSE_ERROR, format!("Parse error: {message}"))
}

/// `event.publish` notification for an emitted event.
pub fn publish_notification(pending: &PendingEvent) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "event.publish",
        "params": {
            "type": pending.event.event_type,
            "subject": pending.subscriber_id,
            "data": pending.event.payload,
        },
    })
}

/// Forwards emitted events to the output stream as `event.publish`
/// notifications.
pub struct Publisher {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Publisher {
    pub fn spawn(
        mut events: mpsc::UnboundedReceiver<PendingEvent>,
        out: mpsc::UnboundedSender<String>,
    ) -> Self {
        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let forward = |pending: &PendingEvent| {
                out.send(publish_notification(pending).to_string()).is_ok()
            };
            loop {
                tokio::select! {
                    pending = events.recv() => match pending {
                        Some(pending) if forward(&pending) => {}
                        _ => break,
                    },
                    _ = &mut stop_rx => {
                        // New events are refused so their deliveries fail and
                        // get redelivered; accepted ones are flushed.
                        events.close();
                        let mut drained = 0usize;
                        while let Ok(pending) = events.try_recv() {
                            if !forward(&pending) {
                                break;
                            }
                            drained += 1;
                        }
                        tracing::info!(drained, "Flushed pending events");
                        break;
                    }
                }
            }
        });
        Self { stop, handle }
    }

    /// Stop accepting events and wait until the queued ones are forwarded.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        let _ = self.handle.await;
    }
}

// ─── Host state ─────────────────────────────────────────────────────────────

struct Runtime {
    store: Arc<dyn RegistrationStore>,
    reconciler: Option<Arc<SubscriptionReconciler>>,
    port: u16,
    base_url: String,
}

type OpResult = Result<Value, (i64, String)>;

fn op_failed(err: impl std::fmt::Display) -> (i64, String) {
    (OPERATION_FAILED, err.to_string())
}

fn invalid_params(message: impl Into<String>) -> (i64, String) {
    (INVALID_PARAMS, message.into())
}

pub struct Host {
    config: ServiceConfig,
    upstream: Option<Arc<dyn WebhookResource>>,
    sink: Arc<dyn EventSink>,
    deliveries: Arc<DeliveryLog>,
    runtime: RwLock<Option<Runtime>>,
}

impl Host {
    /// `upstream` is `None` when no provider API key is configured; setup
    /// operations then fail while deliveries for stored registrations still
    /// flow.
    pub fn new(
        config: ServiceConfig,
        upstream: Option<Arc<dyn WebhookResource>>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            upstream,
            sink,
            deliveries: Arc::new(DeliveryLog::default()),
            runtime: RwLock::new(None),
        }
    }

    pub async fn handle_request(&self, req: &JsonRpcRequest) -> JsonRpcResponse {
        let result = match req.method.as_str() {
            "initialize" => self.initialize(&req.params).await,
            "shutdown" => Ok(json!({})),
            "execute" => self.execute(&req.params).await,
            _ => Err((METHOD_NOT_FOUND, format!("Unknown method: {}", req.method))),
        };

        match result {
            Ok(data) => ok_response(req.id.clone(), data),
            Err((code, message)) => {
                tracing::warn!(method = %req.method, code, error = %message, "Request failed");
                err_response(req.id.clone(), code, message)
            }
        }
    }

    async fn initialize(&self, params: &Value) -> OpResult {
        let mut runtime = self.runtime.write().await;
        if let Some(rt) = runtime.as_ref() {
            return Ok(json!({ "ready": true, "port": rt.port }));
        }

        let data_dir = params
            .get("data_dir")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.data_dir.clone());
        let store: Arc<dyn RegistrationStore> = Arc::new(
            JsonStore::open(&data_dir).map_err(|e| (INTERNAL_ERROR, e.to_string()))?,
        );

        let state = ServerState {
            store: store.clone(),
            sink: self.sink.clone(),
            deliveries: self.deliveries.clone(),
        };
        let bind = format!("{}:{}", self.config.host, self.config.port);
        let addr = http_server::start(state, &bind)
            .await
            .map_err(|e| (INTERNAL_ERROR, format!("HTTP server failed: {e}")))?;

        let base_url = self
            .config
            .public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{addr}"));
        let callback_url = format!("{base_url}/webhooks/{}", self.config.account);

        let reconciler = self.upstream.clone().map(|upstream| {
            Arc::new(SubscriptionReconciler::new(
                store.clone(),
                upstream,
                self.config.account.clone(),
                callback_url.clone(),
                self.config.webhook_secret.clone(),
            ))
        });
        if reconciler.is_none() {
            tracing::warn!("No provider API key configured, subscriber setup is disabled");
        }

        tracing::info!(%callback_url, "Initialized");
        *runtime = Some(Runtime {
            store,
            reconciler,
            port: addr.port(),
            base_url,
        });
        Ok(json!({ "ready": true, "port": addr.port() }))
    }

    async fn execute(&self, params: &Value) -> OpResult {
        let operation = params
            .get("operation")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let input = params
            .get("input")
            .cloned()
            .unwrap_or(Value::Object(Default::default()));

        let runtime = self.runtime.read().await;
        let rt = runtime
            .as_ref()
            .ok_or_else(|| op_failed("server not initialized"))?;

        match operation {
            "get_server_info" => self.op_get_server_info(rt),
            "setup_subscriber" => self.op_setup_subscriber(rt, &input).await,
            "remove_subscriber" => self.op_remove_subscriber(rt, &input).await,
            "list_subscribers" => op_list_subscribers(rt),
            "list_registrations" => op_list_registrations(rt),
            "get_recent_deliveries" => self.op_get_recent_deliveries(&input),
            _ => Err(op_failed(format!("Unknown operation: {operation}"))),
        }
    }

    // ─── Operations ─────────────────────────────────────────────────────────

    fn op_get_server_info(&self, rt: &Runtime) -> OpResult {
        let subscriber_count = rt.store.list_subscribers().map_err(op_failed)?.len();
        Ok(json!({
            "port": rt.port,
            "base_url": rt.base_url,
            "account": self.config.account,
            "callback_url": rt.reconciler.as_ref().map(|r| r.callback_url()),
            "subscriber_count": subscriber_count,
        }))
    }

    async fn op_setup_subscriber(&self, rt: &Runtime, input: &Value) -> OpResult {
        let setup: SetupInput = serde_json::from_value(input.clone())
            .map_err(|e| invalid_params(format!("invalid setup_subscriber input: {e}")))?;
        let reconciler = self.reconciler_for(rt, setup.account.as_deref())?;

        let subscriber = SubscriberConfig {
            id: setup.subscriber_id,
            account: reconciler.account().to_string(),
            scope: setup
                .subscriptions
                .map(SubscriptionScope::new)
                .unwrap_or_else(SubscriptionScope::incidents),
            filter: FilterConfig {
                severities: setup.severities,
                current_milestone: setup.current_milestone,
                missing_severity: setup.missing_severity.unwrap_or_default(),
            },
            created_at: Utc::now(),
        };

        let outcome = reconciler.attach(&subscriber).await.map_err(op_failed)?;
        let registration = rt.store.get(reconciler.account()).map_err(op_failed)?;
        Ok(json!({
            "subscriber_id": subscriber.id,
            "outcome": outcome.as_str(),
            "registration": registration.as_ref().map(registration_summary),
        }))
    }

    async fn op_remove_subscriber(&self, rt: &Runtime, input: &Value) -> OpResult {
        let id = input
            .get("subscriber_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid_params("missing required field: subscriber_id"))?;
        let subscriber = rt
            .store
            .get_subscriber(id)
            .map_err(op_failed)?
            .ok_or_else(|| op_failed(format!("subscriber not found: {id}")))?;
        let reconciler = self.reconciler_for(rt, Some(&subscriber.account))?;

        let outcome = reconciler.detach(id).await.map_err(op_failed)?;
        Ok(json!({
            "removed": true,
            "webhook_deleted": outcome == TeardownOutcome::Deleted,
        }))
    }

    fn op_get_recent_deliveries(&self, input: &Value) -> OpResult {
        let account = input
            .get("account")
            .and_then(|v| v.as_str())
            .unwrap_or(self.config.account.as_str());
        let deliveries = self.deliveries.recent(account);
        Ok(json!({ "deliveries": deliveries }))
    }

    fn reconciler_for<'a>(
        &self,
        rt: &'a Runtime,
        account: Option<&str>,
    ) -> Result<&'a Arc<SubscriptionReconciler>, (i64, String)> {
        let reconciler = rt
            .reconciler
            .as_ref()
            .ok_or_else(|| op_failed("FIREHYDRANT_API_KEY is not configured"))?;
        match account {
            Some(account) if account != reconciler.account() => {
                Err(invalid_params(format!("unknown account: {account}")))
            }
            _ => Ok(reconciler),
        }
    }
}

fn op_list_subscribers(rt: &Runtime) -> OpResult {
    let items = rt.store.list_subscribers().map_err(op_failed)?;
    let total = items.len();
    Ok(json!({ "items": items, "total": total }))
}

fn op_list_registrations(rt: &Runtime) -> OpResult {
    let items: Vec<Value> = rt
        .store
        .list()
        .map_err(op_failed)?
        .iter()
        .map(registration_summary)
        .collect();
    let total = items.len();
    Ok(json!({ "items": items, "total": total }))
}

/// Registration as shown to the host. The secret itself never leaves the store.
fn registration_summary(reg: &Registration) -> Value {
    json!({
        "account": reg.account,
        "webhook_id": reg.webhook_id,
        "url": reg.url,
        "has_secret": !reg.secret.is_empty(),
        "subscriptions": reg.scope.subscriptions,
        "subscribers": reg.subscribers,
        "version": reg.version,
        "updated_at": reg.updated_at,
    })
}

#[derive(Debug, Deserialize)]
struct SetupInput {
    subscriber_id: String,
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    subscriptions: Option<Vec<String>>,
    #[serde(default)]
    severities: Option<BTreeSet<String>>,
    #[serde(default)]
    current_milestone: Option<BTreeSet<String>>,
    #[serde(default)]
    missing_severity: Option<MissingSeverityPolicy>,
}
