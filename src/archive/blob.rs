// src/archive/blob.rs
//! Azure Blob Storage (ADLS) writer: one Put Blob request per snapshot.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client};
use std::time::Duration;

use super::{ArchiveKey, ArchiveWriter, WriteReceipt};
use crate::error::IngestError;
use crate::identity::{DynTokenSource, STORAGE_RESOURCE};

const STORAGE_API_VERSION: &str = "2023-11-03";

pub enum BlobAuth {
    /// Bearer token from the ambient identity.
    Identity(DynTokenSource),
    /// Shared access signature query string.
    Sas(String),
}

pub struct BlobArchiveWriter {
    client: Client,
    account_url: String,
    container: String,
    auth: BlobAuth,
    timeout: Duration,
}

impl BlobArchiveWriter {
    pub fn new(
        client: Client,
        account_url: impl Into<String>,
        container: impl Into<String>,
        auth: BlobAuth,
    ) -> Self {
        Self {
            client,
            account_url: account_url.into().trim_end_matches('/').to_string(),
            container: container.into().trim_matches('/').to_string(),
            auth,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn blob_url(&self, key: &ArchiveKey) -> String {
        let base = format!("{}/{}/{}", self.account_url, self.container, key.as_str());
        match &self.auth {
            BlobAuth::Sas(sas) => format!("{base}?{}", sas.trim_start_matches('?')),
            BlobAuth::Identity(_) => base,
        }
    }
}

fn describe_status(status: u16) -> &'static str {
    match status {
        401 | 403 => "authorization failed",
        404 => "container not found",
        s if s >= 500 => "storage backend unavailable",
        _ => "write rejected",
    }
}

#[async_trait]
impl ArchiveWriter for BlobArchiveWriter {
    async fn write(&self, key: &ArchiveKey, bytes: Bytes) -> Result<WriteReceipt, IngestError> {
        tracing::info!(target: "archive", key = %key, container = %self.container, "uploading data to blob");

        let mut req = self
            .client
            .put(self.blob_url(key))
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-version", STORAGE_API_VERSION)
            .header(header::CONTENT_TYPE, "application/json")
            .timeout(self.timeout);

        if let BlobAuth::Identity(tokens) = &self.auth {
            let token = tokens
                .token(STORAGE_RESOURCE)
                .await
                .map_err(|e| IngestError::Storage(format!("identity: {e:#}")))?;
            req = req.bearer_auth(token);
        }

        let receipt_body = bytes.clone();
        let resp = req
            .body(bytes)
            .send()
            .await
            .map_err(|e| {
                IngestError::Storage(format!("blob request for {key} failed: {}", e.without_url()))
            })?;

        let status = resp.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(IngestError::Storage(format!(
                "{} ({}): {}",
                describe_status(code),
                code,
                crate::error::excerpt(&body)
            )));
        }

        let etag = resp
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string());

        tracing::info!(target: "archive", key = %key, "upload complete");
        Ok(WriteReceipt::new(key, &receipt_body, etag))
    }

    fn backend(&self) -> &'static str {
        "blob"
    }
}
