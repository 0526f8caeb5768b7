// src/secrets.rs
//! API credential resolution: a static value or a Key Vault secret, with a
//! process-lifetime cache in front.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::IngestError;
use crate::identity::{DynTokenSource, VAULT_RESOURCE};

const KEY_VAULT_API_VERSION: &str = "7.4";

/// Opaque API key. Debug output is redacted and there is no Display impl.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn resolve(&self) -> Result<Credential, IngestError>;

    /// Drop any cached value so the next `resolve` goes back to the source.
    fn invalidate(&self) {}

    fn name(&self) -> &'static str;
}

pub type DynSecretProvider = Arc<dyn SecretProvider>;

/// Credential supplied directly through configuration.
pub struct StaticSecret(Credential);

impl StaticSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Credential::new(value))
    }
}

#[async_trait]
impl SecretProvider for StaticSecret {
    async fn resolve(&self) -> Result<Credential, IngestError> {
        Ok(self.0.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[derive(Deserialize)]
struct SecretBundle {
    value: Option<String>,
}

/// Reads one named secret from an Azure Key Vault.
pub struct KeyVaultSecretProvider {
    client: Client,
    vault_url: String,
    secret_name: String,
    tokens: DynTokenSource,
    timeout: Duration,
}

impl KeyVaultSecretProvider {
    pub fn new(
        client: Client,
        vault_url: impl Into<String>,
        secret_name: impl Into<String>,
        tokens: DynTokenSource,
    ) -> Self {
        Self {
            client,
            vault_url: vault_url.into().trim_end_matches('/').to_string(),
            secret_name: secret_name.into(),
            tokens,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn secret_url(&self) -> String {
        format!("{}/secrets/{}", self.vault_url, self.secret_name)
    }
}

#[async_trait]
impl SecretProvider for KeyVaultSecretProvider {
    async fn resolve(&self) -> Result<Credential, IngestError> {
        tracing::info!(target: "secrets", secret = %self.secret_name, "fetching secret from key vault");

        let token = self
            .tokens
            .token(VAULT_RESOURCE)
            .await
            .map_err(|e| IngestError::SecretUnavailable(format!("identity: {e:#}")))?;

        let resp = self
            .client
            .get(self.secret_url())
            .query(&[("api-version", KEY_VAULT_API_VERSION)])
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                IngestError::SecretUnavailable(format!(
                    "key vault unreachable: {}",
                    e.without_url()
                ))
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(IngestError::SecretUnavailable(format!(
                "key vault returned {} for secret '{}': {}",
                status.as_u16(),
                self.secret_name,
                crate::error::excerpt(&body)
            )));
        }

        let bundle: SecretBundle = resp
            .json()
            .await
            .map_err(|e| IngestError::SecretUnavailable(format!("decoding secret: {}", e.without_url())))?;

        match bundle.value {
            Some(v) if !v.trim().is_empty() => {
                tracing::info!(target: "secrets", "successfully fetched api key");
                Ok(Credential::new(v))
            }
            _ => Err(IngestError::SecretUnavailable(format!(
                "secret '{}' has no value",
                self.secret_name
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "key_vault"
    }
}

/// Caches the first successful resolution of `inner` for the process lifetime.
/// Failures are not cached, so the next cycle tries again.
pub struct CachedSecretProvider<P> {
    inner: P,
    cached: RwLock<Option<Credential>>,
}

impl<P: SecretProvider> CachedSecretProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cached: RwLock::new(None),
        }
    }
}

#[async_trait]
impl<P: SecretProvider> SecretProvider for CachedSecretProvider<P> {
    async fn resolve(&self) -> Result<Credential, IngestError> {
        if let Some(c) = self.cached.read().await.as_ref() {
            return Ok(c.clone());
        }

        let mut slot = self.cached.write().await;
        if let Some(c) = slot.as_ref() {
            return Ok(c.clone());
        }
        let fresh = self.inner.resolve().await?;
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    fn invalidate(&self) {
        // Contended only while a resolve is in flight, which refills the slot.
        if let Ok(mut slot) = self.cached.try_write() {
            *slot = None;
        }
        self.inner.invalidate();
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
