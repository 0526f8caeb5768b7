// tests/common/mod.rs
//
// Shared helpers: in-process HTTP stand-ins and mock stages for the cycle.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use transit_feed_archiver::{
    ArchiveKey, ArchiveWriter, Clock, Credential, FeedClient, FeedSnapshot, FixedClock,
    IngestError, SecretProvider, WriteReceipt,
};

/// Bind an axum router on an ephemeral localhost port; returns `http://host:port`.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server");
    });
    format!("http://{addr}")
}

/// The reference instant used throughout the tests: 2024-03-05T14:07:33Z.
pub fn reference_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 33).unwrap()
}

pub fn reference_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(reference_instant()))
}

// ---- mock stages ----

pub struct MockSecrets {
    pub calls: AtomicUsize,
    pub invalidations: AtomicUsize,
    fail: bool,
}

impl MockSecrets {
    pub fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::ok()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretProvider for MockSecrets {
    async fn resolve(&self) -> Result<Credential, IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(IngestError::SecretUnavailable(
                "secret 'delijn-api-key' not found".into(),
            ));
        }
        Ok(Credential::new("test-key"))
    }

    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

pub enum FeedBehavior {
    Body(&'static str),
    Fail(IngestError),
    Hang(Duration),
}

pub struct MockFeed {
    pub calls: AtomicUsize,
    pub seen_keys: Mutex<Vec<String>>,
    behavior: FeedBehavior,
    clock: Arc<dyn Clock>,
}

impl MockFeed {
    pub fn new(behavior: FeedBehavior, clock: Arc<dyn Clock>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            seen_keys: Mutex::new(Vec::new()),
            behavior,
            clock,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedClient for MockFeed {
    async fn fetch(&self, credential: &Credential) -> Result<FeedSnapshot, IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_keys
            .lock()
            .unwrap()
            .push(credential.expose().to_string());
        match &self.behavior {
            FeedBehavior::Body(b) => Ok(FeedSnapshot {
                body: Bytes::from_static(b.as_bytes()),
                retrieved_at: self.clock.now(),
                status: 200,
            }),
            FeedBehavior::Fail(e) => Err(e.clone()),
            FeedBehavior::Hang(d) => {
                tokio::time::sleep(*d).await;
                Err(IngestError::Network("unreachable".into()))
            }
        }
    }
}

pub struct RecordingWriter {
    pub writes: Mutex<Vec<(ArchiveKey, Bytes)>>,
    fail: Option<IngestError>,
}

impl RecordingWriter {
    pub fn ok() -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            fail: None,
        }
    }

    pub fn failing(err: IngestError) -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            fail: Some(err),
        }
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[async_trait]
impl ArchiveWriter for RecordingWriter {
    async fn write(&self, key: &ArchiveKey, bytes: Bytes) -> Result<WriteReceipt, IngestError> {
        self.writes.lock().unwrap().push((key.clone(), bytes.clone()));
        if let Some(e) = &self.fail {
            return Err(e.clone());
        }
        Ok(WriteReceipt::new(key, &bytes, Some("0x1".into())))
    }

    fn backend(&self) -> &'static str {
        "recording"
    }
}
