// src/scheduler.rs
//! Fixed-period trigger for the ingestion cycle.
//!
//! Ticks are driven by `tokio::time::interval`, so the cadence does not drift
//! with cycle duration. A tick that fires late still runs once (no catch-up
//! burst) and is flagged `past_due`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::clock::Clock;

/// A tick observed later than this after its scheduled instant is past due.
pub const PAST_DUE_TOLERANCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    /// Extra run fired once when the scheduler starts.
    Startup,
    Scheduled,
}

impl fmt::Display for TickKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Startup => f.write_str("startup"),
            Self::Scheduled => f.write_str("scheduled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tick {
    pub kind: TickKind,
    pub fired_at: DateTime<Utc>,
    pub past_due: bool,
    pub lag: Duration,
}

#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    async fn run(&self, tick: Tick);
}

/// Shortest period the scheduler accepts; smaller values are raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug)]
pub struct SchedulerCfg {
    pub interval: Duration,
    pub run_on_startup: bool,
    /// Land periodic ticks on UTC multiples of `interval` (cron-like).
    pub align_to_period: bool,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            run_on_startup: true,
            align_to_period: true,
        }
    }
}

pub struct Scheduler<J> {
    cfg: SchedulerCfg,
    job: Arc<J>,
    clock: Arc<dyn Clock>,
}

impl<J: ScheduledJob> Scheduler<J> {
    pub fn new(mut cfg: SchedulerCfg, job: Arc<J>, clock: Arc<dyn Clock>) -> Self {
        if cfg.interval < MIN_INTERVAL {
            tracing::warn!(
                target: "scheduler",
                requested_ms = cfg.interval.as_millis() as u64,
                "schedule interval below minimum, using 1s"
            );
            cfg.interval = MIN_INTERVAL;
        }
        Self { cfg, job, clock }
    }

    /// Delay until the first periodic tick.
    pub fn first_delay(&self) -> Duration {
        if !self.cfg.align_to_period {
            return self.cfg.interval;
        }
        let period_ms = (self.cfg.interval.as_millis() as i64).max(1);
        let rem = self.clock.now().timestamp_millis().rem_euclid(period_ms);
        Duration::from_millis((period_ms - rem) as u64)
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Tick until `shutdown` flips to `true` or its sender is dropped. A running
    /// cycle is never interrupted; shutdown is observed between ticks.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        static ONCE: OnceCell<()> = OnceCell::new();
        ONCE.get_or_init(|| {
            describe_counter!(
                "archiver_past_due_ticks_total",
                "Scheduled ticks that fired later than planned."
            );
        });

        let first = self.first_delay();
        let mut ticker = tokio::time::interval_at(Instant::now() + first, self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            target: "scheduler",
            interval_secs = self.cfg.interval.as_secs(),
            first_tick_in_ms = first.as_millis() as u64,
            run_on_startup = self.cfg.run_on_startup,
            "scheduler started"
        );

        if self.cfg.run_on_startup && !*shutdown.borrow() {
            self.fire(Tick {
                kind: TickKind::Startup,
                fired_at: self.clock.now(),
                past_due: false,
                lag: Duration::ZERO,
            })
            .await;
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                scheduled = ticker.tick() => {
                    let lag = Instant::now().saturating_duration_since(scheduled);
                    let past_due = lag > PAST_DUE_TOLERANCE;
                    if past_due {
                        counter!("archiver_past_due_ticks_total").increment(1);
                    }
                    self.fire(Tick {
                        kind: TickKind::Scheduled,
                        fired_at: self.clock.now(),
                        past_due,
                        lag,
                    })
                    .await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(target: "scheduler", "scheduler stopped");
    }

    /// Run the job on its own task so even a panic stays inside the cycle boundary.
    async fn fire(&self, tick: Tick) {
        let job = Arc::clone(&self.job);
        let kind = tick.kind;
        if let Err(e) = tokio::spawn(async move { job.run(tick).await }).await {
            tracing::error!(target: "scheduler", trigger = %kind, error = %e, "cycle task aborted");
        }
    }
}
