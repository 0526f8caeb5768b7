// src/archive/local.rs
//! Filesystem writer for development runs; mirrors the blob layout under a root dir.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use super::{ArchiveKey, ArchiveWriter, WriteReceipt};
use crate::error::IngestError;

pub struct LocalArchiveWriter {
    root: PathBuf,
}

impl LocalArchiveWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &ArchiveKey) -> PathBuf {
        key.as_str()
            .split('/')
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }
}

#[async_trait]
impl ArchiveWriter for LocalArchiveWriter {
    async fn write(&self, key: &ArchiveKey, bytes: Bytes) -> Result<WriteReceipt, IngestError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IngestError::Storage(format!("creating {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| IngestError::Storage(format!("writing {}: {e}", path.display())))?;

        tracing::info!(target: "archive", key = %key, path = %path.display(), "snapshot written");
        Ok(WriteReceipt::new(key, &bytes, None))
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}
