// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Cross-process lock on a snapshot document
//!
//! The lock is the sibling directory `<doc>.lock`. Directory creation is
//! atomic on every platform we run on, so whoever creates it owns the
//! document until the directory is removed.

use super::{SnapshotError, SnapshotResult};
use rand::Rng;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, warn};

pub const STALE_AFTER: Duration = Duration::from_secs(5);
/// Exceeds `STALE_AFTER` plus one backoff step
pub const WAIT_FOR: Duration = Duration::from_secs(8);
pub const MIN_BACKOFF: Duration = Duration::from_millis(50);
pub const MAX_BACKOFF: Duration = Duration::from_millis(1_000);

pub fn lock_path(doc: &Path) -> PathBuf {
    let mut path = OsString::from(doc.as_os_str());
    path.push(".lock");
    PathBuf::from(path)
}

/// Randomized exponential backoff for retry `attempt` (0-based).
pub fn backoff(attempt: u32) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(1.0..2.0);
    let base = MIN_BACKOFF.as_millis() as f64 * 2f64.powi(attempt.min(16) as i32) * factor;
    Duration::from_millis(base.min(MAX_BACKOFF.as_millis() as f64) as u64)
}

/// When a held lock counts as abandoned, and how long to wait for one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub stale_after: Duration,
    pub wait_for: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            stale_after: STALE_AFTER,
            wait_for: WAIT_FOR,
        }
    }
}

#[derive(Debug)]
pub struct DocumentLock {
    path: PathBuf,
    held: bool,
}

impl DocumentLock {
    pub async fn acquire(doc: &Path) -> SnapshotResult<Self> {
        Self::acquire_with(doc, LockPolicy::default()).await
    }

    pub async fn acquire_with(doc: &Path, policy: LockPolicy) -> SnapshotResult<Self> {
        let path = lock_path(doc);
        let deadline = Instant::now() + policy.wait_for;
        let mut attempt = 0;
        loop {
            match tokio::fs::create_dir(&path).await {
                Ok(()) => {
                    debug!(lock = %path.display(), "Acquired snapshot lock");
                    return Ok(Self { path, held: true });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path, policy.stale_after).await {
                        warn!(lock = %path.display(), "Breaking stale snapshot lock");
                        match tokio::fs::remove_dir(&path).await {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(source) => return Err(SnapshotError::io(&path, source)),
                        }
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SnapshotError::LockBusy { path });
                    }
                    tokio::time::sleep(backoff(attempt).min(deadline - now)).await;
                    attempt += 1;
                }
                Err(source) => return Err(SnapshotError::io(&path, source)),
            }
        }
    }

    pub async fn release(mut self) -> SnapshotResult<()> {
        self.held = false;
        match tokio::fs::remove_dir(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SnapshotError::io(&self.path, source)),
        }
    }
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        if self.held {
            let _ = std::fs::remove_dir(&self.path);
        }
    }
}

async fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .is_some_and(|age| age > stale_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds() {
        for attempt in 0..8 {
            let d = backoff(attempt);
            assert!(d >= MIN_BACKOFF.min(MAX_BACKOFF));
            assert!(d <= MAX_BACKOFF);
        }
        assert!(backoff(0) < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("a.rs.snap");
        let lock = DocumentLock::acquire(&doc).await.unwrap();
        assert!(lock_path(&doc).is_dir());

        let impatient = LockPolicy {
            stale_after: STALE_AFTER,
            wait_for: Duration::from_millis(200),
        };
        let err = DocumentLock::acquire_with(&doc, impatient).await.unwrap_err();
        assert!(matches!(err, SnapshotError::LockBusy { .. }));

        lock.release().await.unwrap();
        assert!(!lock_path(&doc).exists());
        let again = DocumentLock::acquire(&doc).await.unwrap();
        drop(again);
        assert!(!lock_path(&doc).exists());
    }

    #[test]
    fn test_waiters_outlast_the_stale_window() {
        let policy = LockPolicy::default();
        assert!(policy.wait_for > policy.stale_after + MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_abandoned_lock_is_broken_while_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("c.rs.snap");
        // Left behind by a holder that never released it
        std::fs::create_dir(lock_path(&doc)).unwrap();

        let policy = LockPolicy {
            stale_after: Duration::from_millis(150),
            wait_for: Duration::from_secs(3),
        };
        let lock = DocumentLock::acquire_with(&doc, policy).await.unwrap();
        assert!(lock_path(&doc).is_dir());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("b.rs.snap");
        let lock = DocumentLock::acquire(&doc).await.unwrap();
        let waiter = {
            let doc = doc.clone();
            tokio::spawn(async move { DocumentLock::acquire(&doc).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.release().await.unwrap();
        let second = waiter.await.unwrap().unwrap();
        second.release().await.unwrap();
    }
}
