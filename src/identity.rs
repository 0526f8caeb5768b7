// src/identity.rs
//! Ambient identity: bearer tokens for Key Vault and Blob Storage.
//!
//! In Azure the process runs under a managed identity; locally a static token
//! (`AZURE_ACCESS_TOKEN`) can stand in.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const VAULT_RESOURCE: &str = "https://vault.azure.net";
pub const STORAGE_RESOURCE: &str = "https://storage.azure.com/";

const IMDS_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// Refresh tokens this many seconds before they expire.
const EXPIRY_SKEW_SECS: i64 = 300;
/// Assumed lifetime when the endpoint omits `expires_on`.
const DEFAULT_LIFETIME_SECS: i64 = 3600;

#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Bearer token for the given audience/resource.
    async fn token(&self, resource: &str) -> Result<String>;
}

pub type DynTokenSource = Arc<dyn TokenSource>;

/// Pre-issued token, used as-is for every resource.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self, _resource: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
enum Endpoint {
    /// App Service / Functions identity endpoint.
    AppService { url: String, header: String },
    /// Instance metadata service (VMs, AKS).
    Imds { url: String },
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<serde_json::Value>,
}

pub struct ManagedIdentity {
    client: Client,
    endpoint: Endpoint,
    client_id: Option<String>,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl ManagedIdentity {
    /// Pick the App Service endpoint when `IDENTITY_ENDPOINT`/`IDENTITY_HEADER`
    /// are present, otherwise fall back to IMDS.
    pub fn from_env(client: Client, client_id: Option<String>) -> Self {
        let endpoint = match (
            std::env::var("IDENTITY_ENDPOINT").ok(),
            std::env::var("IDENTITY_HEADER").ok(),
        ) {
            (Some(url), Some(header)) => Endpoint::AppService { url, header },
            _ => Endpoint::Imds {
                url: IMDS_URL.to_string(),
            },
        };
        Self::with_endpoint(client, endpoint, client_id)
    }

    pub fn app_service(
        client: Client,
        url: impl Into<String>,
        header: impl Into<String>,
        client_id: Option<String>,
    ) -> Self {
        let endpoint = Endpoint::AppService {
            url: url.into(),
            header: header.into(),
        };
        Self::with_endpoint(client, endpoint, client_id)
    }

    pub fn imds(client: Client, url: impl Into<String>, client_id: Option<String>) -> Self {
        Self::with_endpoint(client, Endpoint::Imds { url: url.into() }, client_id)
    }

    fn with_endpoint(client: Client, endpoint: Endpoint, client_id: Option<String>) -> Self {
        Self {
            client,
            endpoint,
            client_id,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, resource: &str, now: i64) -> Option<String> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(resource)
            .filter(|t| t.expires_at - EXPIRY_SKEW_SECS > now)
            .map(|t| t.value.clone())
    }

    async fn request(&self, resource: &str) -> Result<TokenResponse> {
        let mut query: Vec<(&str, &str)> = vec![("resource", resource)];
        if let Some(id) = self.client_id.as_deref() {
            query.push(("client_id", id));
        }

        let req = match &self.endpoint {
            Endpoint::AppService { url, header } => {
                query.push(("api-version", APP_SERVICE_API_VERSION));
                self.client
                    .get(url)
                    .header("X-IDENTITY-HEADER", header)
                    .query(&query)
            }
            Endpoint::Imds { url } => {
                query.push(("api-version", IMDS_API_VERSION));
                self.client.get(url).header("Metadata", "true").query(&query)
            }
        };

        let resp = req
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("identity endpoint request")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "identity endpoint returned {}: {}",
                status.as_u16(),
                crate::error::excerpt(&body)
            ));
        }
        resp.json::<TokenResponse>()
            .await
            .context("decoding identity token response")
    }
}

fn parse_expires_on(raw: Option<&serde_json::Value>, now: i64) -> i64 {
    let parsed = match raw {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.unwrap_or(now + DEFAULT_LIFETIME_SECS)
}

#[async_trait]
impl TokenSource for ManagedIdentity {
    async fn token(&self, resource: &str) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        if let Some(tok) = self.cached(resource, now) {
            return Ok(tok);
        }

        let resp = self.request(resource).await?;
        let expires_at = parse_expires_on(resp.expires_on.as_ref(), now);
        tracing::debug!(target: "identity", resource, expires_at, "acquired managed identity token");

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            resource.to_string(),
            CachedToken {
                value: resp.access_token.clone(),
                expires_at,
            },
        );
        Ok(resp.access_token)
    }
}
