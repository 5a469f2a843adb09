//! Durable key → artifact storage.
//!
//! Artifacts live at `<root>/<cache key>.<ext>`. Writers stage the bytes in a
//! hidden temp file next to the final address and `rename` it into place,
//! so a concurrent reader sees either nothing or the complete artifact.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use genmedia_types::mime::{self, ARTIFACT_EXTENSIONS};
use genmedia_types::{Artifact, CacheKey};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::MediaError;

/// Read/write contract of the artifact store.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Look up the artifact stored under `key`. Never returns partial bytes.
    async fn get(&self, key: &CacheKey) -> Result<Option<Artifact>, MediaError>;

    /// Store `artifact` under `key`. Once this returns, every `get(key)`
    /// observes byte-identical content. Re-putting identical bytes is a no-op.
    async fn put(&self, key: &CacheKey, artifact: &Artifact) -> Result<(), MediaError>;
}

/// Filesystem-backed [`ArtifactStore`].
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final address of `key` stored with extension `ext`.
    pub fn path_for(&self, key: &CacheKey, ext: &str) -> PathBuf {
        self.root.join(format!("{key}.{ext}"))
    }

    fn temp_path_for(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4().simple()))
    }

    async fn read_existing(path: &Path) -> Result<Option<Vec<u8>>, MediaError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(MediaError::storage(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write_staged(&self, temp: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(temp)
            .await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Artifact>, MediaError> {
        for ext in ARTIFACT_EXTENSIONS {
            let path = self.path_for(key, ext);
            if let Some(bytes) = Self::read_existing(&path).await? {
                let mime_type = mime::mime_for_extension(ext).unwrap_or(mime::OCTET_STREAM);
                debug!(key = %key.short(), path = %path.display(), "artifact store hit");
                return Ok(Some(Artifact::new(bytes, mime_type)));
            }
        }
        Ok(None)
    }

    async fn put(&self, key: &CacheKey, artifact: &Artifact) -> Result<(), MediaError> {
        if artifact.is_empty() {
            return Err(MediaError::storage("refusing to store an empty artifact"));
        }

        let ext = artifact.extension();
        let path = self.path_for(key, ext);

        match Self::read_existing(&path).await? {
            Some(existing) if existing.as_slice() == artifact.bytes.as_ref() => {
                debug!(key = %key.short(), "identical artifact already stored");
                return Ok(());
            }
            Some(_) => {
                warn!(
                    key = %key.short(),
                    path = %path.display(),
                    "overwriting stored artifact with differing bytes"
                );
            }
            None => {}
        }

        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            MediaError::storage(format!(
                "failed to create store directory {}: {e}",
                self.root.display()
            ))
        })?;

        let temp = self.temp_path_for(key);
        if let Err(e) = self.write_staged(&temp, &artifact.bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(MediaError::storage(format!(
                "failed to stage artifact at {}: {e}",
                temp.display()
            )));
        }
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(MediaError::storage(format!(
                "failed to move artifact into {}: {e}",
                path.display()
            )));
        }

        // A differently-typed copy would shadow this one in `get`'s lookup order.
        for other in ARTIFACT_EXTENSIONS.iter().filter(|e| **e != ext) {
            let stale = self.path_for(key, other);
            if tokio::fs::remove_file(&stale).await.is_ok() {
                debug!(key = %key.short(), path = %stale.display(), "removed stale artifact");
            }
        }

        info!(
            key = %key.short(),
            path = %path.display(),
            bytes = artifact.len(),
            "artifact stored"
        );
        Ok(())
    }
}
