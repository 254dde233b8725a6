//! Remote service endpoint
//!
//! The coordinator pushes one queued mutation at a time through
//! [`RemoteEndpoint`]. [`HttpRemote`] maps mutations onto a plain REST
//! layout:
//!
//! | action   | request                          |
//! |----------|----------------------------------|
//! | `store`  | `POST   {base}/{data_type}`      |
//! | `update` | `PUT    {base}/{data_type}/{id}` |
//! | `delete` | `DELETE {base}/{data_type}/{id}` |
//!
//! Bodies are the decompressed payload. The record key and version travel
//! in `X-Record-Key` / `X-Record-Version` headers.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::types::{DataType, Record, RecordKey, SyncAction, SyncQueueItem};

const RECORD_KEY_HEADER: &str = "X-Record-Key";
const RECORD_VERSION_HEADER: &str = "X-Record-Version";

/// One mutation as sent to the remote service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteRequest {
    pub action: SyncAction,
    pub data_type: DataType,
    pub record_key: RecordKey,
    pub record_version: u64,
    pub payload: Option<Value>,
}

impl RemoteRequest {
    pub fn from_item(item: &SyncQueueItem) -> Self {
        Self {
            action: item.action,
            data_type: item.data_type.clone(),
            record_key: item.record_key.clone(),
            record_version: item.record_version,
            payload: item.payload.clone(),
        }
    }
}

/// Remote answer to a pushed mutation
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteResponse {
    Accepted,
    /// The remote holds a diverging copy of the record
    Conflict(Box<Record>),
}

/// Where queued mutations are replayed
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn push(&self, request: &RemoteRequest) -> SyncResult<RemoteResponse>;
}

/// REST endpoint over reqwest
pub struct HttpRemote {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            timeout,
            client,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, request: &RemoteRequest) -> String {
        match request.action {
            SyncAction::Store => format!("{}/{}", self.base_url, request.data_type),
            SyncAction::Update | SyncAction::Delete => format!(
                "{}/{}/{}",
                self.base_url, request.data_type, request.record_key
            ),
        }
    }
}

#[async_trait]
impl RemoteEndpoint for HttpRemote {
    async fn push(&self, request: &RemoteRequest) -> SyncResult<RemoteResponse> {
        let url = self.url_for(request);
        let body = request.payload.clone().unwrap_or(Value::Null);

        let mut builder = match request.action {
            SyncAction::Store => self.client.post(&url).json(&body),
            SyncAction::Update => self.client.put(&url).json(&body),
            SyncAction::Delete => self.client.delete(&url),
        };
        builder = builder
            .header(RECORD_KEY_HEADER, request.record_key.as_str())
            .header(RECORD_VERSION_HEADER, request.record_version.to_string());
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout(self.timeout)
            } else {
                SyncError::Network(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        debug!(%url, status = status.as_u16(), action = %request.action, "Remote responded");

        if status.is_success() {
            return Ok(RemoteResponse::Accepted);
        }

        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        if status == StatusCode::CONFLICT {
            if let Ok(record) = serde_json::from_str::<Record>(&text) {
                return Ok(RemoteResponse::Conflict(Box::new(record)));
            }
        }

        Err(SyncError::Remote {
            status: status.as_u16(),
            message: text,
        })
    }
}

/// Endpoint for sessions without a configured remote; every push fails
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredRemote;

#[async_trait]
impl RemoteEndpoint for UnconfiguredRemote {
    async fn push(&self, _request: &RemoteRequest) -> SyncResult<RemoteResponse> {
        Err(SyncError::Network("no remote endpoint configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Priority, QueueItemDraft};
    use serde_json::json;

    fn request(action: SyncAction) -> RemoteRequest {
        let record = Record::new(
            DataType::new("attendance").unwrap(),
            json!({"studentId": "s1"}),
            Priority::Normal,
        );
        let draft = match action {
            SyncAction::Store => QueueItemDraft::store(&record, record.payload.clone()),
            SyncAction::Update => QueueItemDraft::update(&record, record.payload.clone()),
            SyncAction::Delete => QueueItemDraft::delete(&record),
        };
        RemoteRequest::from_item(&SyncQueueItem::from_draft(draft))
    }

    #[test]
    fn test_urls_per_action() {
        let remote = HttpRemote::new("https://sync.example.zm/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(remote.base_url(), "https://sync.example.zm/api");

        let store = request(SyncAction::Store);
        assert_eq!(remote.url_for(&store), "https://sync.example.zm/api/attendance");

        let update = request(SyncAction::Update);
        assert_eq!(
            remote.url_for(&update),
            format!("https://sync.example.zm/api/attendance/{}", update.record_key)
        );

        let delete = request(SyncAction::Delete);
        assert!(delete.payload.is_none());
        assert!(remote.url_for(&delete).ends_with(delete.record_key.as_str()));
    }

    #[tokio::test]
    async fn test_unconfigured_remote_fails() {
        let result = UnconfiguredRemote.push(&request(SyncAction::Store)).await;
        assert!(matches!(result, Err(SyncError::Network(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        // Port 9 on localhost is the discard port; nothing listens there
        let remote = HttpRemote::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let result = remote.push(&request(SyncAction::Store)).await;
        assert!(matches!(
            result,
            Err(SyncError::Network(_)) | Err(SyncError::Timeout(_))
        ));
    }
}
