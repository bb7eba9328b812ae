//! HTTP boundary to the sync server.
//!
//! [`RemoteApi`] is the seam the push pipeline and the pull reconciler talk
//! through; [`HttpRemote`] is the production implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::SyncError;
use crate::models::RemoteEntity;

/// One operation inside a bulk write. `data` is the JSON string of a
/// [`crate::models::BulkWriteOp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOperation {
    /// Outbox sequence id.
    pub id: i64,
    pub request_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteRequest {
    pub request_id: String,
    pub operations: Vec<BulkOperation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedOperation {
    pub id: i64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteResponse {
    pub request_id: String,
    #[serde(default)]
    pub acknowledged: Vec<i64>,
    #[serde(default)]
    pub rejected: Vec<RejectedOperation>,
}

/// Scope parameters sent with every pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_type: Option<String>,
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn bulk_write(
        &self,
        entity: RemoteEntity,
        request: &BulkWriteRequest,
    ) -> Result<BulkWriteResponse, SyncError>;

    async fn fetch(&self, entity: RemoteEntity, query: &PullQuery)
        -> Result<Vec<Value>, SyncError>;

    /// Cheap reachability probe.
    async fn health(&self) -> bool;
}

/// reqwest-backed [`RemoteApi`].
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    server_url: String,
    api_key: Option<String>,
}

impl HttpRemote {
    pub fn new(
        server_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn bulk_write(
        &self,
        entity: RemoteEntity,
        request: &BulkWriteRequest,
    ) -> Result<BulkWriteResponse, SyncError> {
        let url = self.url(&format!("/bulk-write/{}", entity.name()));
        let response = self
            .authorize(self.client.post(&url))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::ServerStatus(response.status().as_u16()));
        }

        let body: BulkWriteResponse = response.json().await?;
        if body.request_id != request.request_id {
            return Err(SyncError::Protocol(format!(
                "response for batch {} does not match request {}",
                body.request_id, request.request_id
            )));
        }
        Ok(body)
    }

    async fn fetch(
        &self,
        entity: RemoteEntity,
        query: &PullQuery,
    ) -> Result<Vec<Value>, SyncError> {
        let url = self.url(&format!("/entities/{}", entity.name()));
        let response = self
            .authorize(self.client.get(&url))
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::ServerStatus(response.status().as_u16()));
        }

        Ok(response.json().await?)
    }

    async fn health(&self) -> bool {
        match self.authorize(self.client.get(self.url("/health"))).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "health probe failed");
                false
            }
        }
    }
}

/// Builds the notification WebSocket URL, converting http(s) to ws(s).
pub fn build_ws_url(server_url: &str, device_id: &str) -> String {
    let server_url = server_url.trim_end_matches('/');
    let base_url = if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if !server_url.starts_with("ws://") && !server_url.starts_with("wss://") {
        format!("ws://{}", server_url)
    } else {
        server_url.to_string()
    };

    format!("{}/notifications?deviceId={}", base_url, device_id)
}
