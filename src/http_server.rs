use crate::delivery_log::DeliveryLog;
use crate::dispatch::{self, EventSink};
use crate::error::DeliveryError;
use crate::store::RegistrationStore;
use crate::types::{Delivery, DeliveryStatus};
use crate::verification::SIGNATURE_HEADER;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Everything a delivery handler reads. Cheap to clone.
#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<dyn RegistrationStore>,
    pub sink: Arc<dyn EventSink>,
    pub deliveries: Arc<DeliveryLog>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/webhooks/{account}", post(handle_webhook))
        .with_state(state)
}

/// Bind `addr`, spawn the server, and return the bound address.
pub async fn start(state: ServerState, addr: &str) -> Result<SocketAddr, std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "HTTP server bound");

    let app = router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    Ok(local)
}

async fn handle_webhook(
    Path(account): Path<String>,
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, DeliveryError> {
    let registration = state
        .store
        .get(&account)?
        .ok_or_else(|| DeliveryError::UnknownAccount(account.clone()))?;
    let subscribers = state.store.list_subscribers()?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let result = dispatch::handle_delivery(
        &registration,
        &subscribers,
        signature,
        &body,
        state.sink.as_ref(),
    );

    let mut delivery = Delivery {
        id: uuid::Uuid::new_v4().to_string(),
        account,
        received_at: Utc::now(),
        status: DeliveryStatus::Processed,
        operation: None,
        resource_type: None,
        emitted_to: Vec::new(),
    };

    match result {
        Ok(outcome) => {
            delivery.operation = Some(outcome.operation);
            delivery.resource_type = Some(outcome.resource_type);
            delivery.emitted_to = outcome.emitted_to;
            state.deliveries.record(delivery);
            Ok(StatusCode::OK)
        }
        Err(err) => {
            delivery.status = match &err {
                DeliveryError::Verification(_) => DeliveryStatus::VerificationFailed,
                DeliveryError::Malformed(_) => DeliveryStatus::Malformed,
                _ => DeliveryStatus::EmitFailed,
            };
            state.deliveries.record(delivery);
            Err(err)
        }
    }
}
