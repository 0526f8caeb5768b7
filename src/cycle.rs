// src/cycle.rs
//! One scheduled execution: resolve credential, fetch, build key, write.
//!
//! `Idle -> ResolvingCredential -> Fetching -> Writing -> Done`. A failure in any
//! stage jumps straight to `Done` with the failing phase recorded; nothing
//! escapes [`IngestionCycle::run_once`].

use async_trait::async_trait;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::archive::{ArchiveKey, DynArchiveWriter, KeyGuard, WriteReceipt};
use crate::clock::{Clock, SystemClock};
use crate::error::IngestError;
use crate::feed::{DynFeedClient, FeedSnapshot};
use crate::scheduler::{ScheduledJob, Tick};
use crate::secrets::{Credential, DynSecretProvider};

pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("archiver_cycles_total", "Ingestion cycles by outcome.");
        describe_counter!(
            "archiver_cycle_failures_total",
            "Failed ingestion cycles by phase."
        );
        describe_counter!(
            "archiver_bytes_written_total",
            "Snapshot bytes written to the archive."
        );
        describe_histogram!(
            "archiver_cycle_duration_ms",
            "Wall time of one ingestion cycle in milliseconds."
        );
        describe_gauge!(
            "archiver_last_success_ts",
            "Unix ts of the last archived snapshot."
        );
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CyclePhase {
    Idle,
    ResolvingCredential,
    Fetching,
    Writing,
    Done,
}

impl CyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ResolvingCredential => "resolving_credential",
            Self::Fetching => "fetching",
            Self::Writing => "writing",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one cycle. Logged, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionResult {
    Archived(WriteReceipt),
    Failed {
        phase: CyclePhase,
        error: IngestError,
    },
}

impl IngestionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Archived(_))
    }

    pub fn key(&self) -> Option<&ArchiveKey> {
        match self {
            Self::Archived(r) => Some(&r.key),
            Self::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&IngestError> {
        match self {
            Self::Archived(_) => None,
            Self::Failed { error, .. } => Some(error),
        }
    }
}

pub struct IngestionCycle {
    secrets: DynSecretProvider,
    feed: DynFeedClient,
    writer: DynArchiveWriter,
    keys: KeyGuard,
    stage_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl IngestionCycle {
    pub fn new(secrets: DynSecretProvider, feed: DynFeedClient, writer: DynArchiveWriter) -> Self {
        Self {
            secrets,
            feed,
            writer,
            keys: KeyGuard::new(),
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock used for the last-success gauge.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Run one cycle to completion. Never returns an error and never panics on
    /// stage failures; the outcome is logged and returned for the caller.
    pub async fn run_once(&self) -> IngestionResult {
        ensure_metrics_described();
        let t0 = Instant::now();

        let result = match self.execute().await {
            Ok(receipt) => IngestionResult::Archived(receipt),
            Err((phase, error)) => IngestionResult::Failed { phase, error },
        };

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("archiver_cycle_duration_ms").record(ms);
        self.report(&result, ms);
        result
    }

    async fn execute(&self) -> Result<WriteReceipt, (CyclePhase, IngestError)> {
        let mut phase = CyclePhase::Idle;
        tracing::debug!(target: "cycle", %phase, "cycle triggered");

        phase = CyclePhase::ResolvingCredential;
        let credential: Credential = self
            .bounded(phase, self.secrets.resolve())
            .await
            .map_err(|e| (phase, e))?;

        phase = CyclePhase::Fetching;
        let snapshot: FeedSnapshot = match self.bounded(phase, self.feed.fetch(&credential)).await {
            Ok(s) => s,
            Err(e) => {
                if e.is_auth_rejection() {
                    tracing::warn!(target: "cycle", provider = self.secrets.name(), "upstream rejected api key, dropping cached credential");
                    self.secrets.invalidate();
                }
                return Err((phase, e));
            }
        };

        phase = CyclePhase::Writing;
        let key = self.keys.claim(snapshot.retrieved_at);
        let receipt = self
            .bounded(phase, self.writer.write(&key, snapshot.body))
            .await
            .map_err(|e| (phase, e))?;

        Ok(receipt)
    }

    async fn bounded<T, F>(&self, phase: CyclePhase, fut: F) -> Result<T, IngestError>
    where
        F: Future<Output = Result<T, IngestError>>,
    {
        match tokio::time::timeout(self.stage_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(timed_out(phase, self.stage_timeout)),
        }
    }

    fn report(&self, result: &IngestionResult, ms: f64) {
        match result {
            IngestionResult::Archived(receipt) => {
                counter!("archiver_cycles_total", "outcome" => "success").increment(1);
                counter!("archiver_bytes_written_total").increment(receipt.bytes as u64);
                gauge!("archiver_last_success_ts").set(self.clock.now().timestamp() as f64);
                tracing::info!(
                    target: "cycle",
                    phase = %CyclePhase::Done,
                    key = %receipt.key,
                    bytes = receipt.bytes,
                    sha256 = %receipt.sha256,
                    backend = self.writer.backend(),
                    duration_ms = ms,
                    "snapshot archived"
                );
            }
            IngestionResult::Failed { phase, error } => {
                counter!("archiver_cycles_total", "outcome" => "failure").increment(1);
                counter!("archiver_cycle_failures_total", "phase" => phase.as_str()).increment(1);
                match error {
                    IngestError::Upstream { status, body } => tracing::error!(
                        target: "cycle",
                        %phase,
                        kind = error.kind(),
                        status,
                        body = %body,
                        duration_ms = ms,
                        "cycle failed"
                    ),
                    other => tracing::error!(
                        target: "cycle",
                        %phase,
                        kind = other.kind(),
                        error = %other,
                        duration_ms = ms,
                        "cycle failed"
                    ),
                }
            }
        }
    }
}

fn timed_out(phase: CyclePhase, after: Duration) -> IngestError {
    let msg = format!("{phase} timed out after {}s", after.as_secs_f64());
    match phase {
        CyclePhase::ResolvingCredential => IngestError::SecretUnavailable(msg),
        CyclePhase::Writing => IngestError::Storage(msg),
        _ => IngestError::Network(msg),
    }
}

#[async_trait]
impl ScheduledJob for IngestionCycle {
    async fn run(&self, tick: Tick) {
        if tick.past_due {
            tracing::info!(target: "cycle", lag_ms = tick.lag.as_millis() as u64, "the timer is past due");
        }
        tracing::info!(target: "cycle", trigger = %tick.kind, at = %tick.fired_at.to_rfc3339(), "ingestion cycle started");
        let _ = self.run_once().await;
    }
}
