//! Script and data files that reload themselves when changed on disk.
//!
//! A [`WatchedResource`] keeps the file's content together with a version
//! number that increases by exactly one per detected change.  Checking for a
//! change costs one `stat` and an atomic load; only when the modification
//! time differs does a caller take the write lock, and it re-checks under the
//! lock so that concurrent callers collapse into a single reload.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info};

use crate::error::NodeError;
use crate::value::RValue;

/// How the file content is presented to the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Text, pushed as a character vector with one element per line.
    Script,
    /// Opaque bytes, pushed as a raw vector.
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Lines(Vec<String>),
    Bytes(Vec<u8>),
}

impl Content {
    fn decode(kind: ResourceKind, bytes: Vec<u8>) -> Self {
        match kind {
            ResourceKind::Script => Content::Lines(
                String::from_utf8_lossy(&bytes).lines().map(str::to_owned).collect(),
            ),
            ResourceKind::Data => Content::Bytes(bytes),
        }
    }

    /// The interpreter value carrying this content.
    pub fn to_value(&self) -> RValue {
        match self {
            Content::Lines(lines) => RValue::strings(lines.iter().cloned()),
            Content::Bytes(bytes) => RValue::raw(bytes.clone()),
        }
    }
}

/// Content and version, read and replaced together.
#[derive(Debug)]
pub struct Snapshot {
    pub content: Content,
    pub version: u64,
}

/// Stable identifier for a resource path.
pub fn path_key(path: &Path) -> String {
    let mut hasher = Sha1::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
}

fn mtime_nanos(modified: SystemTime) -> u64 {
    modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub struct WatchedResource {
    owner: String,
    path: PathBuf,
    kind: ResourceKind,
    key: String,
    modified: AtomicU64,
    state: RwLock<Snapshot>,
}

impl std::fmt::Debug for WatchedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchedResource")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl WatchedResource {
    /// Read the file now.  Fails if it is missing or unreadable.
    pub fn load(owner: &str, path: impl Into<PathBuf>, kind: ResourceKind) -> Result<Self, NodeError> {
        let path = path.into();
        let access = |source| NodeError::FileAccess {
            owner: owner.to_owned(),
            path: path.clone(),
            source,
        };
        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).map_err(access)?;
        let bytes = std::fs::read(&path).map_err(access)?;
        debug!(node = owner, path = %path.display(), "loaded resource");
        Ok(Self {
            owner: owner.to_owned(),
            key: path_key(&path),
            kind,
            modified: AtomicU64::new(mtime_nanos(modified)),
            state: RwLock::new(Snapshot { content: Content::decode(kind, bytes), version: 0 }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Identifier derived from the path; unchanged by reloads.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn access_error(&self, source: std::io::Error) -> NodeError {
        NodeError::FileAccess { owner: self.owner.clone(), path: self.path.clone(), source }
    }

    async fn disk_mtime(&self) -> Result<u64, NodeError> {
        let meta = tokio::fs::metadata(&self.path).await.map_err(|e| self.access_error(e))?;
        let modified = meta.modified().map_err(|e| self.access_error(e))?;
        Ok(mtime_nanos(modified))
    }

    /// Reload the file if its modification time changed since the last load.
    ///
    /// Returns `true` if this call performed the reload.
    pub async fn check_and_reload(&self) -> Result<bool, NodeError> {
        if self.disk_mtime().await? == self.modified.load(Ordering::Acquire) {
            return Ok(false);
        }

        let mut state = self.state.write().await;
        let on_disk = self.disk_mtime().await?;
        if on_disk == self.modified.load(Ordering::Acquire) {
            // Someone else reloaded while we waited for the lock.
            return Ok(false);
        }
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| self.access_error(e))?;
        state.content = Content::decode(self.kind, bytes);
        state.version += 1;
        self.modified.store(on_disk, Ordering::Release);
        info!(
            node = %self.owner,
            path = %self.path.display(),
            version = state.version,
            "resource changed on disk, reloaded"
        );
        Ok(true)
    }

    /// Hold the current content and version stable for the guard's lifetime.
    pub async fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.state.read().await
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
