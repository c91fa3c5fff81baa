//! Filesystem blob storage for raw document bytes.
//!
//! Documents are addressed by owner-id-prefixed paths so one user's blobs
//! never collide with another's. Access goes through the blob pool gate.

use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::resources::Pool;

/// Async blob store rooted at one directory.
pub struct BlobStore {
    root: PathBuf,
    gate: Pool<()>,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>, gate: Pool<()>) -> Self {
        Self {
            root: root.into(),
            gate,
        }
    }

    /// `<root>/<owner_id>/<document_id>`
    pub fn path_for(&self, owner_id: Uuid, document_id: Uuid) -> PathBuf {
        self.root
            .join(owner_id.to_string())
            .join(document_id.to_string())
    }

    /// Write a document's bytes.
    pub async fn put(&self, owner_id: Uuid, document_id: Uuid, bytes: &[u8]) -> Result<PathBuf> {
        let _handle = self.gate.acquire().await?;
        let path = self.path_for(owner_id, document_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Internal(format!("blob mkdir failed: {}", e)))?;
        }
        fs::write(&path, bytes)
            .await
            .map_err(|e| Error::Internal(format!("blob write failed: {}", e)))?;
        Ok(path)
    }

    /// Read a document's bytes.
    pub async fn read(&self, owner_id: Uuid, document_id: Uuid) -> Result<Vec<u8>> {
        let _handle = self.gate.acquire().await?;
        let path = self.path_for(owner_id, document_id);
        fs::read(&path)
            .await
            .map_err(|_| Error::not_found("blob", document_id.to_string()))
    }

    /// Delete a document's bytes. Missing blobs are not an error.
    pub async fn delete(&self, owner_id: Uuid, document_id: Uuid) -> Result<bool> {
        let _handle = self.gate.acquire().await?;
        let path = self.path_for(owner_id, document_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Internal(format!("blob delete failed: {}", e))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
