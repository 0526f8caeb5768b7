// src/archive/key.rs
//! Deterministic archive paths: `raw/YYYY/MM/DD/YYYY-MM-DDTHH-MM-SS.json`.

use chrono::{DateTime, Datelike, Utc};
use std::fmt;
use std::sync::Mutex;

pub const KEY_PREFIX: &str = "raw";
pub const KEY_EXTENSION: &str = "json";

/// Storage path of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveKey(String);

impl ArchiveKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Same key with `-{n}` inserted before the extension.
    fn with_suffix(&self, n: u32) -> Self {
        let ext = format!(".{KEY_EXTENSION}");
        let stem = self.0.strip_suffix(ext.as_str()).unwrap_or(&self.0);
        Self(format!("{stem}-{n}{ext}"))
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ArchiveKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Pure: same instant, same key, on any host timezone.
pub fn build_key(instant: DateTime<Utc>) -> ArchiveKey {
    ArchiveKey(format!(
        "{KEY_PREFIX}/{:04}/{:02}/{:02}/{}.{KEY_EXTENSION}",
        instant.year(),
        instant.month(),
        instant.day(),
        instant.format("%Y-%m-%dT%H-%M-%S"),
    ))
}

/// Remembers the last key handed out by this process and disambiguates a
/// repeat (two snapshots captured within the same second).
#[derive(Debug, Default)]
pub struct KeyGuard {
    last: Mutex<Option<(ArchiveKey, u32)>>,
}

impl KeyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, instant: DateTime<Utc>) -> ArchiveKey {
        let base = build_key(instant);
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());

        let n = match last.as_ref() {
            Some((prev, n)) if *prev == base => n + 1,
            _ => 0,
        };
        *last = Some((base.clone(), n));

        if n == 0 {
            base
        } else {
            tracing::warn!(target: "archive", key = %base, suffix = n, "archive key collision, disambiguating");
            base.with_suffix(n)
        }
    }
}
