// src/bootstrap.rs
//! Wires service handles from configuration. Everything is constructed here
//! and passed down explicitly; nothing lives in process globals.

use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;

use crate::archive::blob::{BlobArchiveWriter, BlobAuth};
use crate::archive::local::LocalArchiveWriter;
use crate::archive::DynArchiveWriter;
use crate::clock::Clock;
use crate::config::{ArchiveTarget, ArchiverConfig, CredentialSource};
use crate::cycle::IngestionCycle;
use crate::feed::{DynFeedClient, HttpFeedClient};
use crate::identity::{DynTokenSource, ManagedIdentity, StaticToken};
use crate::scheduler::Scheduler;
use crate::secrets::{CachedSecretProvider, DynSecretProvider, KeyVaultSecretProvider, StaticSecret};

pub fn http_client(cfg: &ArchiverConfig) -> Result<Client> {
    Client::builder()
        .timeout(cfg.http_timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building http client")
}

pub fn token_source(cfg: &ArchiverConfig, client: &Client) -> DynTokenSource {
    match cfg.azure_access_token.as_ref() {
        Some(tok) => Arc::new(StaticToken::new(tok.expose())),
        None => Arc::new(ManagedIdentity::from_env(
            client.clone(),
            cfg.azure_client_id.clone(),
        )),
    }
}

pub fn secret_provider(
    cfg: &ArchiverConfig,
    client: &Client,
    tokens: DynTokenSource,
) -> DynSecretProvider {
    match &cfg.credential {
        CredentialSource::Static { api_key } => Arc::new(StaticSecret::new(api_key.clone())),
        CredentialSource::KeyVault {
            vault_url,
            secret_name,
        } => Arc::new(CachedSecretProvider::new(
            KeyVaultSecretProvider::new(client.clone(), vault_url.clone(), secret_name.clone(), tokens)
                .with_timeout(cfg.http_timeout),
        )),
    }
}

pub fn archive_writer(
    cfg: &ArchiverConfig,
    client: &Client,
    tokens: DynTokenSource,
) -> DynArchiveWriter {
    match &cfg.archive {
        ArchiveTarget::Blob {
            account_url,
            container,
            sas_token,
        } => {
            let auth = match sas_token {
                Some(sas) => BlobAuth::Sas(sas.clone()),
                None => BlobAuth::Identity(tokens),
            };
            Arc::new(
                BlobArchiveWriter::new(client.clone(), account_url.clone(), container.clone(), auth)
                    .with_timeout(cfg.http_timeout),
            )
        }
        ArchiveTarget::Local { root } => Arc::new(LocalArchiveWriter::new(root.clone())),
    }
}

pub fn feed_client(cfg: &ArchiverConfig, client: &Client, clock: Arc<dyn Clock>) -> DynFeedClient {
    Arc::new(
        HttpFeedClient::new(client.clone(), cfg.feed_url.clone(), clock)
            .with_api_key_header(cfg.api_key_header.clone())
            .with_timeout(cfg.http_timeout),
    )
}

pub fn build_cycle(cfg: &ArchiverConfig, clock: Arc<dyn Clock>) -> Result<IngestionCycle> {
    let client = http_client(cfg)?;
    let tokens = token_source(cfg, &client);

    let secrets = secret_provider(cfg, &client, tokens.clone());
    let feed = feed_client(cfg, &client, Arc::clone(&clock));
    let writer = archive_writer(cfg, &client, tokens);

    tracing::info!(
        target: "bootstrap",
        credential_source = secrets.name(),
        backend = writer.backend(),
        feed_url = %cfg.feed_url,
        "ingestion cycle wired"
    );

    Ok(IngestionCycle::new(secrets, feed, writer)
        .with_stage_timeout(cfg.http_timeout)
        .with_clock(clock))
}

pub fn build_scheduler(
    cfg: &ArchiverConfig,
    clock: Arc<dyn Clock>,
) -> Result<Scheduler<IngestionCycle>> {
    let cycle = build_cycle(cfg, Arc::clone(&clock))?;
    Ok(Scheduler::new(cfg.schedule, Arc::new(cycle), clock))
}
