// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Snapshot store
//!
//! One document per test source file, at
//! `<root>/<dir of file>/__snapshots__/<file name>.snap`. Documents are read
//! lazily and cached. Every write happens under the document lock: the
//! document is re-read from disk, the entry merged in, and the result written
//! back, so concurrent workers never lose each other's entries.

pub mod capture;
pub mod format;
pub mod lock;

use crate::testcase::SnapshotStatus;
use format::SnapshotDocument;
use lock::DocumentLock;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub use capture::capture;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed snapshot document {}: {source}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: format::ParseError,
    },
    #[error("snapshot lock {} is held by another worker", path.display())]
    LockBusy { path: PathBuf },
    #[error("snapshot `{name}` does not match the stored capture\n\n{diff}")]
    Mismatch { name: String, diff: String },
}

impl SnapshotError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Result of comparing one capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub status: SnapshotStatus,
    /// Unified diff from the stored entry to the capture, on failure
    pub diff: Option<String>,
}

/// Unused entries of one document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub obsolete: usize,
    pub removed: usize,
}

pub fn unified_diff(stored: &str, received: &str) -> String {
    similar::TextDiff::from_lines(stored, received)
        .unified_diff()
        .context_radius(3)
        .header("stored", "received")
        .to_string()
}

#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    update: bool,
    cache: Mutex<HashMap<String, SnapshotDocument>>,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, update: bool) -> Self {
        Self {
            root: root.into(),
            update,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn update_mode(&self) -> bool {
        self.update
    }

    pub fn document_path(&self, file: &str) -> PathBuf {
        let file = Path::new(file);
        let dir = file.parent().unwrap_or_else(|| Path::new(""));
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.root.join(dir).join("__snapshots__").join(format!("{name}.snap"))
    }

    async fn read_document(path: &Path) -> SnapshotResult<Option<SnapshotDocument>> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => SnapshotDocument::parse(&text)
                .map(Some)
                .map_err(|source| SnapshotError::Format {
                    path: path.to_path_buf(),
                    source,
                }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SnapshotError::io(path, source)),
        }
    }

    async fn write_document(path: &Path, doc: &SnapshotDocument) -> SnapshotResult<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, doc.serialize())
            .await
            .map_err(|e| SnapshotError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| SnapshotError::io(path, e))
    }

    /// Cached document of `file`, loading it on first access.
    pub async fn document(&self, file: &str) -> SnapshotResult<SnapshotDocument> {
        let mut cache = self.cache.lock().await;
        if let Some(doc) = cache.get(file) {
            return Ok(doc.clone());
        }
        let doc = Self::read_document(&self.document_path(file))
            .await?
            .unwrap_or_default();
        cache.insert(file.to_string(), doc.clone());
        Ok(doc)
    }

    /// Apply `edit` to the on-disk document under its lock and refresh the
    /// cache with the result.
    async fn edit_locked<F>(&self, file: &str, edit: F) -> SnapshotResult<SnapshotDocument>
    where
        F: FnOnce(&mut SnapshotDocument),
    {
        let path = self.document_path(file);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| SnapshotError::io(dir, e))?;
        }
        let lock = DocumentLock::acquire(&path).await?;
        let result = async {
            let mut doc = Self::read_document(&path).await?.unwrap_or_default();
            edit(&mut doc);
            Self::write_document(&path, &doc).await?;
            Ok::<_, SnapshotError>(doc)
        }
        .await;
        lock.release().await?;

        let doc = result?;
        self.cache.lock().await.insert(file.to_string(), doc.clone());
        Ok(doc)
    }

    /// Compare `content` with the stored entry `name` of `file`, writing it
    /// when missing or, in update mode, when different.
    pub async fn compare_or_write(&self, file: &str, name: &str, content: &str) -> SnapshotResult<Comparison> {
        let content = content.trim();
        let doc = self.document(file).await?;

        let status = match doc.get(name) {
            Some(stored) if stored == content => SnapshotStatus::Passed,
            Some(stored) if !self.update => {
                debug!(file, name, "Snapshot mismatch");
                return Ok(Comparison {
                    status: SnapshotStatus::Failed,
                    diff: Some(unified_diff(stored, content)),
                });
            }
            Some(_) => SnapshotStatus::Updated,
            None => SnapshotStatus::Written,
        };

        if status != SnapshotStatus::Passed {
            self.edit_locked(file, |doc| doc.insert(name, content)).await?;
            debug!(file, name, ?status, "Stored snapshot");
        }
        Ok(Comparison { status, diff: None })
    }

    /// Count the entries of `file` not in `retained`; update mode deletes them.
    pub async fn reconcile(&self, file: &str, retained: &HashSet<String>) -> SnapshotResult<Reconciliation> {
        let path = self.document_path(file);
        let Some(doc) = Self::read_document(&path).await? else {
            return Ok(Reconciliation::default());
        };
        let unused: Vec<String> = doc
            .names()
            .filter(|n| !retained.contains(*n))
            .map(str::to_string)
            .collect();
        if unused.is_empty() {
            return Ok(Reconciliation::default());
        }
        if !self.update {
            return Ok(Reconciliation {
                obsolete: unused.len(),
                removed: 0,
            });
        }

        self.edit_locked(file, |doc| {
            for name in &unused {
                doc.remove(name);
            }
        })
        .await?;
        info!(file, removed = unused.len(), "Removed unused snapshots");
        Ok(Reconciliation {
            obsolete: 0,
            removed: unused.len(),
        })
    }
}
