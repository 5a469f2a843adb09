use std::io::{self, ErrorKind as IoErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LockStore, LockStoreError};

/// Directory-wide guard every check-and-set runs under.
const GUARD_FILE: &str = ".guard";

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    token: String,
    expires_at_ms: i64,
}

impl LockFile {
    fn expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// [`LockStore`] backed by one file per key in a shared directory.
///
/// Reads and writes of lock files happen while holding an exclusive OS lock
/// on the directory's guard file, which gives set-if-absent semantics across
/// processes on the same local filesystem. Expiry uses wall-clock time so
/// separate processes agree.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    dir: PathBuf,
}

impl FileLockStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.lock"))
    }

    /// Run `op` on the blocking pool with the guard held.
    async fn guarded<T, F>(&self, op: F) -> Result<T, LockStoreError>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        let dir = self.dir.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            let guard = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(dir.join(GUARD_FILE))?;
            guard.lock_exclusive()?;
            // Unlocked when `guard` drops.
            op()
        })
        .await
        .map_err(|e| LockStoreError::Unavailable(format!("lock task failed: {e}")))?;
        Ok(outcome?)
    }
}

fn read(path: &Path) -> io::Result<Option<LockFile>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    // A foreign file holds nothing; treat it as expired.
    Ok(Some(serde_json::from_slice(&raw).unwrap_or(LockFile {
        token: String::new(),
        expires_at_ms: 0,
    })))
}

/// Publish `entry` whole: a reader sees the old file or the new one.
fn write(path: &Path, entry: &LockFile) -> io::Result<()> {
    let body = serde_json::to_vec(entry).map_err(io::Error::other)?;
    let tmp = path.with_extension("lock.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_ms(now_ms: i64, ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_add(ttl_ms)
}

#[async_trait]
impl LockStore for FileLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        let path = self.path_for(key);
        let token = token.to_owned();
        self.guarded(move || {
            let now = now_ms();
            let previous = read(&path)?;
            if previous.as_ref().is_some_and(|held| !held.expired(now)) {
                return Ok(false);
            }
            write(
                &path,
                &LockFile {
                    token,
                    expires_at_ms: expiry_ms(now, ttl),
                },
            )?;
            if previous.is_some() {
                debug!(path = %path.display(), "reclaimed expired lock file");
            }
            Ok(true)
        })
        .await
    }

    async fn delete_if_matches(&self, key: &str, token: &str) -> Result<bool, LockStoreError> {
        let path = self.path_for(key);
        let token = token.to_owned();
        self.guarded(move || match read(&path)? {
            Some(held) if held.token == token && !held.expired(now_ms()) => {
                match std::fs::remove_file(&path) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e),
                }
            }
            _ => Ok(false),
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), LockStoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
