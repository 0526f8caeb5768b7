// src/config.rs
//! Service configuration from the environment and/or a TOML file.
//!
//! Sources, later wins:
//! 1) TOML file at `$ARCHIVER_CONFIG_PATH` (optional)
//! 2) environment variables (`.env` is loaded by the binary)

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::feed::{DEFAULT_API_KEY_HEADER, DEFAULT_FEED_URL};
use crate::scheduler::SchedulerCfg;
use crate::secrets::Credential;
use crate::telemetry::LogFormat;

pub const ENV_CONFIG_PATH: &str = "ARCHIVER_CONFIG_PATH";

const DEFAULT_INTERVAL_SECS: u64 = 120;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOCAL_ROOT: &str = "archive";

/// Where the feed API key comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Static { api_key: String },
    KeyVault { vault_url: String, secret_name: String },
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static { .. } => f.write_str("Static { api_key: *** }"),
            Self::KeyVault {
                vault_url,
                secret_name,
            } => f
                .debug_struct("KeyVault")
                .field("vault_url", vault_url)
                .field("secret_name", secret_name)
                .finish(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum ArchiveTarget {
    Blob {
        account_url: String,
        container: String,
        sas_token: Option<String>,
    },
    Local {
        root: PathBuf,
    },
}

impl fmt::Debug for ArchiveTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blob {
                account_url,
                container,
                sas_token,
            } => f
                .debug_struct("Blob")
                .field("account_url", account_url)
                .field("container", container)
                .field("sas_token", &sas_token.as_ref().map(|_| "***"))
                .finish(),
            Self::Local { root } => f.debug_struct("Local").field("root", root).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    pub feed_url: String,
    pub api_key_header: String,
    pub credential: CredentialSource,
    pub archive: ArchiveTarget,
    pub schedule: SchedulerCfg,
    pub http_timeout: Duration,
    pub azure_access_token: Option<Credential>,
    pub azure_client_id: Option<String>,
    pub metrics_addr: Option<SocketAddr>,
    pub log_format: LogFormat,
    /// Non-fatal findings from validation; logged once tracing is up.
    pub warnings: Vec<String>,
}

/// Unvalidated settings. Field names are the env variable names, lowercased.
#[derive(Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub feed_url: Option<String>,
    pub feed_api_key_header: Option<String>,
    pub feed_api_key: Option<String>,
    pub key_vault_url: Option<String>,
    pub api_key_secret_name: Option<String>,
    pub archive_backend: Option<String>,
    pub storage_account_url: Option<String>,
    pub storage_container_name: Option<String>,
    pub storage_sas_token: Option<String>,
    pub archive_local_root: Option<String>,
    pub schedule_interval_secs: Option<u64>,
    pub run_on_startup: Option<bool>,
    pub align_to_period: Option<bool>,
    pub http_timeout_secs: Option<u64>,
    pub azure_access_token: Option<String>,
    pub azure_client_id: Option<String>,
    pub metrics_addr: Option<String>,
    pub log_format: Option<String>,
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{name}: expected a boolean, got '{other}'")),
    }
}

fn parse_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("{name}: expected an unsigned integer, got '{raw}'"))
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl RawConfig {
    /// Read every known variable through `lookup` (normally `std::env::var`).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let s = |name: &str| non_empty(lookup(name));
        let b = |name: &str| s(name).map(|v| parse_bool(name, &v)).transpose();
        let n = |name: &str| s(name).map(|v| parse_u64(name, &v)).transpose();

        Ok(Self {
            feed_url: s("FEED_URL"),
            feed_api_key_header: s("FEED_API_KEY_HEADER"),
            feed_api_key: s("FEED_API_KEY"),
            key_vault_url: s("KEY_VAULT_URL"),
            api_key_secret_name: s("API_KEY_SECRET_NAME"),
            archive_backend: s("ARCHIVE_BACKEND"),
            storage_account_url: s("STORAGE_ACCOUNT_URL"),
            storage_container_name: s("STORAGE_CONTAINER_NAME"),
            storage_sas_token: s("STORAGE_SAS_TOKEN"),
            archive_local_root: s("ARCHIVE_LOCAL_ROOT"),
            schedule_interval_secs: n("SCHEDULE_INTERVAL_SECS")?,
            run_on_startup: b("RUN_ON_STARTUP")?,
            align_to_period: b("ALIGN_TO_PERIOD")?,
            http_timeout_secs: n("HTTP_TIMEOUT_SECS")?,
            azure_access_token: s("AZURE_ACCESS_TOKEN"),
            azure_client_id: s("AZURE_CLIENT_ID"),
            metrics_addr: s("METRICS_ADDR"),
            log_format: s("LOG_FORMAT"),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("parsing archiver config toml")
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Fields set in `over` replace those in `self`.
    pub fn merge(self, over: RawConfig) -> Self {
        macro_rules! pick {
            ($base:ident, $over:ident; $($f:ident),* $(,)?) => {
                Self { $($f: $over.$f.or($base.$f)),* }
            };
        }
        let base = self;
        pick!(
            base, over;
            feed_url,
            feed_api_key_header,
            feed_api_key,
            key_vault_url,
            api_key_secret_name,
            archive_backend,
            storage_account_url,
            storage_container_name,
            storage_sas_token,
            archive_local_root,
            schedule_interval_secs,
            run_on_startup,
            align_to_period,
            http_timeout_secs,
            azure_access_token,
            azure_client_id,
            metrics_addr,
            log_format,
        )
    }

    pub fn validate(self) -> Result<ArchiverConfig> {
        let mut warnings = Vec::new();
        let credential = match (
            non_empty(self.feed_api_key),
            non_empty(self.key_vault_url),
            non_empty(self.api_key_secret_name),
        ) {
            (Some(api_key), vault, _) => {
                if vault.is_some() {
                    warnings.push(
                        "both FEED_API_KEY and KEY_VAULT_URL are set; using FEED_API_KEY".to_string(),
                    );
                }
                CredentialSource::Static { api_key }
            }
            (None, Some(vault_url), Some(secret_name)) => CredentialSource::KeyVault {
                vault_url,
                secret_name,
            },
            (None, Some(_), None) => bail!("KEY_VAULT_URL is set but API_KEY_SECRET_NAME is missing"),
            (None, None, _) => {
                bail!("no credential source: set FEED_API_KEY or KEY_VAULT_URL + API_KEY_SECRET_NAME")
            }
        };

        let backend = non_empty(self.archive_backend).unwrap_or_else(|| "blob".to_string());
        let archive = match backend.to_ascii_lowercase().as_str() {
            "blob" => ArchiveTarget::Blob {
                account_url: non_empty(self.storage_account_url)
                    .ok_or_else(|| anyhow!("STORAGE_ACCOUNT_URL is required for the blob backend"))?,
                container: non_empty(self.storage_container_name).ok_or_else(|| {
                    anyhow!("STORAGE_CONTAINER_NAME is required for the blob backend")
                })?,
                sas_token: non_empty(self.storage_sas_token),
            },
            "local" => ArchiveTarget::Local {
                root: PathBuf::from(
                    non_empty(self.archive_local_root)
                        .unwrap_or_else(|| DEFAULT_LOCAL_ROOT.to_string()),
                ),
            },
            other => bail!("unsupported ARCHIVE_BACKEND: {other} (expected blob or local)"),
        };

        let interval_secs = self.schedule_interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS);
        if interval_secs == 0 {
            bail!("SCHEDULE_INTERVAL_SECS must be at least 1");
        }
        let timeout_secs = self.http_timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
        if timeout_secs == 0 {
            bail!("HTTP_TIMEOUT_SECS must be at least 1");
        }
        if timeout_secs >= interval_secs {
            warnings.push(format!(
                "per-stage timeout ({timeout_secs}s) is not shorter than the schedule interval ({interval_secs}s)"
            ));
        }

        let metrics_addr = non_empty(self.metrics_addr)
            .map(|a| {
                a.parse::<SocketAddr>()
                    .with_context(|| format!("METRICS_ADDR: invalid socket address '{a}'"))
            })
            .transpose()?;

        let log_format = match non_empty(self.log_format) {
            Some(f) => f.parse()?,
            None => LogFormat::default(),
        };

        Ok(ArchiverConfig {
            feed_url: non_empty(self.feed_url).unwrap_or_else(|| DEFAULT_FEED_URL.to_string()),
            api_key_header: non_empty(self.feed_api_key_header)
                .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string()),
            credential,
            archive,
            schedule: SchedulerCfg {
                interval: Duration::from_secs(interval_secs),
                run_on_startup: self.run_on_startup.unwrap_or(true),
                align_to_period: self.align_to_period.unwrap_or(true),
            },
            http_timeout: Duration::from_secs(timeout_secs),
            azure_access_token: non_empty(self.azure_access_token).map(Credential::new),
            azure_client_id: non_empty(self.azure_client_id),
            metrics_addr,
            log_format,
            warnings,
        })
    }
}

impl ArchiverConfig {
    pub fn log_warnings(&self) {
        for w in &self.warnings {
            tracing::warn!(target: "config", "{w}");
        }
    }

    /// Environment only.
    pub fn from_env() -> Result<Self> {
        RawConfig::from_env()?.validate()
    }

    /// `$ARCHIVER_CONFIG_PATH` (if set) overlaid by the environment.
    pub fn load_default() -> Result<Self> {
        let base = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) => {
                let pb = PathBuf::from(p);
                if !pb.exists() {
                    bail!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display());
                }
                RawConfig::from_toml_file(&pb)?
            }
            Err(_) => RawConfig::default(),
        };
        base.merge(RawConfig::from_env()?).validate()
    }
}
