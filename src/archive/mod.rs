// src/archive/mod.rs
//! Archive paths and writers.
pub mod blob;
pub mod key;
pub mod local;

pub use key::{build_key, ArchiveKey, KeyGuard};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::IngestError;

/// What the backend acknowledged for one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub key: ArchiveKey,
    pub bytes: usize,
    pub etag: Option<String>,
    /// Hex SHA-256 of the stored body.
    pub sha256: String,
}

impl WriteReceipt {
    pub fn new(key: &ArchiveKey, body: &[u8], etag: Option<String>) -> Self {
        Self {
            key: key.clone(),
            bytes: body.len(),
            etag,
            sha256: sha256_hex(body),
        }
    }
}

/// Unconditional create-or-overwrite. No existence check, no compare-and-swap.
#[async_trait]
pub trait ArchiveWriter: Send + Sync {
    async fn write(&self, key: &ArchiveKey, bytes: Bytes) -> Result<WriteReceipt, IngestError>;

    fn backend(&self) -> &'static str;
}

pub type DynArchiveWriter = Arc<dyn ArchiveWriter>;

pub(crate) fn sha256_hex(body: &[u8]) -> String {
    use std::fmt::Write as _;
    let digest = Sha256::digest(body);
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
