// src/feed.rs
//! Upstream feed client: one GET per cycle, body kept as opaque bytes.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{header, Client};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::IngestError;
use crate::secrets::Credential;

pub const DEFAULT_FEED_URL: &str = "https://api.delijn.be/gtfs/v3/realtime?json=true";
pub const DEFAULT_API_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Raw response body plus the UTC instant it was retrieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub body: Bytes,
    pub retrieved_at: DateTime<Utc>,
    pub status: u16,
}

impl FeedSnapshot {
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch(&self, credential: &Credential) -> Result<FeedSnapshot, IngestError>;
}

pub type DynFeedClient = Arc<dyn FeedClient>;

pub struct HttpFeedClient {
    client: Client,
    url: String,
    api_key_header: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl HttpFeedClient {
    pub fn new(client: Client, url: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            url: url.into(),
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            timeout: Duration::from_secs(30),
            clock,
        }
    }

    pub fn with_api_key_header(mut self, name: impl Into<String>) -> Self {
        self.api_key_header = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Only checks that the body is well-formed JSON; the schema is never read.
fn ensure_well_formed(body: &[u8]) -> Result<(), serde_json::Error> {
    serde_json::from_slice::<serde::de::IgnoredAny>(body).map(|_| ())
}

#[async_trait]
impl FeedClient for HttpFeedClient {
    async fn fetch(&self, credential: &Credential) -> Result<FeedSnapshot, IngestError> {
        tracing::info!(target: "feed", url = %self.url, "calling feed api");

        let resp = self
            .client
            .get(&self.url)
            .header(header::CACHE_CONTROL, "no-cache")
            .header(self.api_key_header.as_str(), credential.expose())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| IngestError::Network(format!("feed request failed: {}", e.without_url())))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(IngestError::upstream(status.as_u16(), &body));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| IngestError::Network(format!("reading feed body: {}", e.without_url())))?;
        let retrieved_at = self.clock.now();

        if let Err(e) = ensure_well_formed(&body) {
            return Err(IngestError::upstream(
                status.as_u16(),
                &format!("malformed body: {e}"),
            ));
        }

        tracing::info!(target: "feed", bytes = body.len(), "successfully received data from api");
        Ok(FeedSnapshot {
            body,
            retrieved_at,
            status: status.as_u16(),
        })
    }
}
