use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::UpstreamError;

pub const DEFAULT_API_URL: &str = "https://api.firehydrant.io/v1";

/// A webhook as the provider reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamWebhook {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

/// Body of a webhook create or update call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookRequest {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub subscriptions: Vec<String>,
}

#[derive(Deserialize)]
struct WebhooksResponse {
    #[serde(default)]
    data: Vec<UpstreamWebhook>,
}

/// The provider's webhook REST resource for one account.
#[async_trait]
pub trait WebhookResource: Send + Sync {
    async fn list_webhooks(&self) -> Result<Vec<UpstreamWebhook>, UpstreamError>;
    async fn create_webhook(&self, request: &WebhookRequest)
        -> Result<UpstreamWebhook, UpstreamError>;
    async fn update_webhook(
        &self,
        id: &str,
        request: &WebhookRequest,
    ) -> Result<UpstreamWebhook, UpstreamError>;
    async fn delete_webhook(&self, id: &str) -> Result<(), UpstreamError>;
}

// ---------------------------------------------------------------------------
// FireHydrant REST client
// ---------------------------------------------------------------------------

pub struct FireHydrantClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl FireHydrantClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        if api_key.is_empty() {
            return Err(UpstreamError::MissingApiKey);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, UpstreamError> {
        let resp = request
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::HttpStatus { status, body });
        }
        Ok(resp)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, UpstreamError> {
        Ok(self.send(request).await?.json().await?)
    }
}

#[async_trait]
impl WebhookResource for FireHydrantClient {
    async fn list_webhooks(&self) -> Result<Vec<UpstreamWebhook>, UpstreamError> {
        let url = format!("{}/webhooks", self.base_url);
        let resp: WebhooksResponse = self.send_json(self.client.get(&url)).await?;
        Ok(resp.data)
    }

    async fn create_webhook(
        &self,
        request: &WebhookRequest,
    ) -> Result<UpstreamWebhook, UpstreamError> {
        let url = format!("{}/webhooks", self.base_url);
        self.send_json(self.client.post(&url).json(request)).await
    }

    async fn update_webhook(
        &self,
        id: &str,
        request: &WebhookRequest,
    ) -> Result<UpstreamWebhook, UpstreamError> {
        let url = format!("{}/webhooks/{id}", self.base_url);
        self.send_json(self.client.patch(&url).json(request)).await
    }

    async fn delete_webhook(&self, id: &str) -> Result<(), UpstreamError> {
        let url = format!("{}/webhooks/{id}", self.base_url);
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_api_key_is_rejected() {
        let err = FireHydrantClient::new(DEFAULT_API_URL, "", Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, UpstreamError::MissingApiKey));
    }

    #[test]
    fn request_omits_unset_fields() {
        let req = WebhookRequest {
            url: "https://hooks.example.com/webhooks/acme".into(),
            state: Some("active".into()),
            secret: None,
            subscriptions: vec!["incidents".into()],
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "url": "https://hooks.example.com/webhooks/acme",
                "state": "active",
                "subscriptions": ["incidents"],
            })
        );
    }

    #[test]
    fn list_response_tolerates_sparse_webhooks() {
        let resp: WebhooksResponse = serde_json::from_value(json!({
            "data": [
                {"id": "wh-1", "url": "https://a", "state": "active", "secret": null},
                {"id": "wh-2", "url": "https://b", "subscriptions": ["incidents"]},
            ]
        }))
        .unwrap();
        assert_eq!(resp.data.len(), 2);
        assert_eq!(resp.data[0].secret, None);
        assert!(resp.data[0].subscriptions.is_empty());
        assert_eq!(resp.data[1].subscriptions, vec!["incidents".to_string()]);
    }
}
