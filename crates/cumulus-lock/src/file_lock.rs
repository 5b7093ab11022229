//! Named, TTL-bounded exclusive lock
//!
//! State machine: `Unheld → Held(by process P) → Unheld`. A holder that
//! crashes mid-section leaves the entry in place on purpose: waiters keep
//! polling until the TTL elapses and then fail closed with
//! [`LockError::Timeout`] instead of proceeding against shared state of
//! unknown consistency. Takeover of a stale lock is an operator decision,
//! not an automatic one.

use crate::backend::LockBackend;
use crate::error::{LockError, Result};
use std::sync::Arc;
use std::time::Duration;

/// Interval between existence checks in [`FileLock::wait`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A named exclusive lock backed by a [`LockBackend`] entry.
pub struct FileLock {
    backend: Arc<dyn LockBackend>,
    name: String,
    ttl: Duration,
    poll_interval: Duration,
    holder: String,
    acquired: bool,
}

impl FileLock {
    pub fn new(backend: Arc<dyn LockBackend>, name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            backend,
            name: name.into(),
            ttl,
            poll_interval: WAIT_POLL_INTERVAL,
            holder: std::process::id().to_string(),
            acquired: false,
        }
    }

    /// Override the polling interval used by [`wait`](Self::wait).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attempt to take the lock without blocking.
    ///
    /// Returns `true` on success and `false` when another live holder has
    /// it. An entry older than the TTL means a presumed-crashed holder;
    /// that raises [`LockError::Timeout`] rather than stealing ownership.
    pub async fn acquire(&mut self) -> Result<bool> {
        if self.backend.create_if_absent(&self.name, &self.holder).await? {
            tracing::debug!(lock = %self.name, "Acquired lock");
            self.acquired = true;
            return Ok(true);
        }

        match self.backend.age(&self.name).await? {
            Some(age) if age > self.ttl => Err(self.taint(self.timeout()).await),
            // Raced with a release between create and age check: report
            // contention, the caller will retry or wait.
            _ => Ok(false),
        }
    }

    /// Block until the lock entry disappears, polling at a fixed interval.
    ///
    /// Raises [`LockError::Timeout`] if the entry outlives the TTL without
    /// being released.
    pub async fn wait(&self) -> Result<()> {
        loop {
            match self.backend.age(&self.name).await? {
                None => return Ok(()),
                Some(age) if age > self.ttl => {
                    return Err(self.taint(self.timeout()).await);
                }
                Some(_) => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    /// Refresh the lock entry so waiters keep seeing a live holder.
    pub async fn renew(&self) -> Result<()> {
        if !self.acquired {
            return Err(self.taint(LockError::NotOwned(self.name.clone())).await);
        }
        if !self.backend.refresh(&self.name, &self.holder).await? {
            // Another process force-cleared the entry underneath us.
            return Err(self.taint(LockError::NotFound(self.name.clone())).await);
        }
        Ok(())
    }

    /// Release the lock by removing its entry.
    pub async fn release(&mut self) -> Result<()> {
        let removed = self.backend.remove(&self.name).await?;
        self.acquired = false;
        if !removed {
            return Err(self.taint(LockError::NotFound(self.name.clone())).await);
        }
        tracing::debug!(lock = %self.name, "Released lock");
        Ok(())
    }

    fn timeout(&self) -> LockError {
        LockError::Timeout {
            name: self.name.clone(),
            ttl_secs: self.ttl.as_secs(),
        }
    }

    /// Set the dirty marker before surfacing an unrecoverable lock error.
    async fn taint(&self, err: LockError) -> LockError {
        if err.taints_locks() {
            if let Err(mark_err) = self.backend.set_dirty().await {
                tracing::error!(lock = %self.name, error = %mark_err, "Failed to set dirty marker");
            }
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileBackend;
    use tempfile::tempdir;

    fn lock(backend: &Arc<FileBackend>, name: &str, ttl: Duration) -> FileLock {
        let backend: Arc<dyn LockBackend> = backend.clone();
        FileLock::new(backend, name, ttl).with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_acquire_release_round_trip() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path()));

        let mut a = lock(&backend, "grp", Duration::from_secs(30));
        let mut b = lock(&backend, "grp", Duration::from_secs(30));

        assert!(a.acquire().await.unwrap());
        assert!(!b.acquire().await.unwrap());

        a.release().await.unwrap();
        assert!(b.acquire().await.unwrap());
        b.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_fails_closed() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path()));

        let mut holder = lock(&backend, "grp", Duration::from_millis(20));
        assert!(holder.acquire().await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;

        let mut contender = lock(&backend, "grp", Duration::from_millis(20));
        let err = contender.acquire().await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        // Staleness must taint the lock directory.
        assert!(backend.is_dirty().await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_returns_once_released() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path()));

        let mut holder = lock(&backend, "grp", Duration::from_secs(30));
        assert!(holder.acquire().await.unwrap());

        let waiter = lock(&backend, "grp", Duration::from_secs(30));
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        holder.release().await.unwrap();

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_renew_requires_ownership() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path()));

        let never_acquired = lock(&backend, "grp", Duration::from_secs(30));
        let err = never_acquired.renew().await.unwrap_err();
        assert!(matches!(err, LockError::NotOwned(_)));
    }

    #[tokio::test]
    async fn test_renew_detects_vanished_entry() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path()));

        let mut holder = lock(&backend, "grp", Duration::from_secs(30));
        assert!(holder.acquire().await.unwrap());

        backend.remove("grp").await.unwrap();

        let err = holder.renew().await.unwrap_err();
        assert!(matches!(err, LockError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_release_of_missing_entry() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path()));

        let mut holder = lock(&backend, "grp", Duration::from_secs(30));
        assert!(holder.acquire().await.unwrap());
        backend.remove("grp").await.unwrap();

        let err = holder.release().await.unwrap_err();
        assert!(matches!(err, LockError::NotFound(_)));
    }
}
