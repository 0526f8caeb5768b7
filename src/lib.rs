// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod archive;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod cycle;
pub mod error;
pub mod feed;
pub mod identity;
pub mod metrics;
pub mod scheduler;
pub mod secrets;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::archive::{build_key, ArchiveKey, ArchiveWriter, WriteReceipt};
pub use crate::clock::{Clock, FixedClock, SystemClock};
pub use crate::config::ArchiverConfig;
pub use crate::cycle::{CyclePhase, IngestionCycle, IngestionResult};
pub use crate::error::IngestError;
pub use crate::feed::{FeedClient, FeedSnapshot};
pub use crate::scheduler::{ScheduledJob, Scheduler, SchedulerCfg, Tick, TickKind};
pub use crate::secrets::{Credential, SecretProvider};
