//! Cross-process readers-writer lock
//!
//! Two-lock design: a writer lock plus a bookkeeping lock guarding a small
//! persisted reader counter. Readers collectively hold the writer lock —
//! the 0→1 reader takes it, the 1→0 reader releases it — so a writer can
//! only get in while no reader section is in progress, while readers run
//! concurrently with each other.
//!
//! `acquire_write` never blocks: a `false` return means the lock is held
//! (by readers or another writer) and the caller decides whether to wait or
//! skip. The orchestrator uses this for "delete the availability set only
//! if idle" semantics.

use crate::backend::LockBackend;
use crate::error::{LockError, Result};
use crate::file_lock::FileLock;
use std::sync::Arc;
use std::time::Duration;

pub struct ReadersWriterLock {
    backend: Arc<dyn LockBackend>,
    name: String,
    ttl: Duration,
    poll_interval: Duration,
}

impl ReadersWriterLock {
    pub fn new(backend: Arc<dyn LockBackend>, name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            backend,
            name: name.into(),
            ttl,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Override the polling interval used while waiting on contended locks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enter a reader section. Blocks while a writer holds the lock.
    pub async fn acquire_read(&self) -> Result<()> {
        let mut bookkeeping = self.bookkeeping_lock();
        self.wait_acquire(&mut bookkeeping).await?;

        let result = self.increment_readers().await;

        // The bookkeeping lock is released on both paths; only the
        // *protected* critical section (the reader's own work) must keep
        // its lock held across failures.
        let release = bookkeeping.release().await;
        result?;
        release
    }

    /// Leave a reader section. The last reader out releases the writer lock
    /// and removes the counter record.
    pub async fn release_read(&self) -> Result<()> {
        let mut bookkeeping = self.bookkeeping_lock();
        self.wait_acquire(&mut bookkeeping).await?;

        let result = self.decrement_readers().await;

        let release = bookkeeping.release().await;
        result?;
        release
    }

    /// Attempt to enter the writer section without blocking.
    ///
    /// `false` means a reader section is in progress (or another writer
    /// holds the lock); the caller must wait or skip.
    pub async fn acquire_write(&self) -> Result<bool> {
        self.writer_lock().acquire().await
    }

    /// Leave the writer section.
    pub async fn release_write(&self) -> Result<()> {
        self.writer_lock().release().await
    }

    /// Refresh the collectively-held writer entry from inside a reader
    /// section.
    ///
    /// The writer entry carries the same TTL as any lock; a reader section
    /// that outlives it without renewal looks abandoned to other processes,
    /// which then fail closed instead of seeing a busy lock. Long-running
    /// readers call this periodically. Raises [`LockError::NotOwned`] when
    /// no reader section is active.
    ///
    /// Deliberately takes no bookkeeping lock: the caller is an active
    /// reader, so the count cannot reach 0 and the writer entry cannot be
    /// released underneath it. That also makes renewal safe to cancel at
    /// any await point.
    pub async fn renew_read(&self) -> Result<()> {
        if self.read_counter().await? == 0 {
            return Err(self.taint(LockError::NotOwned(self.writer_key())).await);
        }
        let holder = std::process::id().to_string();
        if !self.backend.refresh(&self.writer_key(), &holder).await? {
            // The entry vanished while readers were registered.
            return Err(self.taint(LockError::NotFound(self.writer_key())).await);
        }
        Ok(())
    }

    /// Current persisted reader count.
    pub async fn reader_count(&self) -> Result<u32> {
        self.read_counter().await
    }

    async fn increment_readers(&self) -> Result<()> {
        let count = self.read_counter().await?;
        self.write_counter(count + 1).await?;

        if count == 0 {
            // First reader in: take the writer lock on all readers' behalf.
            let mut writer = self.writer_lock();
            let taken: Result<()> = async {
                loop {
                    if writer.acquire().await? {
                        return Ok(());
                    }
                    writer.wait().await?;
                }
            }
            .await;

            if let Err(e) = taken {
                // Roll the increment back before propagating.
                if let Err(undo) = self.write_counter(count).await {
                    tracing::error!(lock = %self.name, error = %undo, "Failed to roll back reader count");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn decrement_readers(&self) -> Result<()> {
        let count = self.read_counter().await?;
        let remaining = count.saturating_sub(1);
        self.write_counter(remaining).await?;

        if remaining == 0 && count > 0 {
            self.writer_lock().release().await?;
        }
        Ok(())
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

    async fn wait_acquire(&self, lock: &mut FileLock) -> Result<()> {
        loop {
            if lock.acquire().await? {
                return Ok(());
            }
            lock.wait().await?;
        }
    }

    async fn read_counter(&self) -> Result<u32> {
        match self.backend.read_value(&self.counter_key()).await? {
            None => Ok(0),
            Some(content) => {
                content
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| LockError::CorruptCounter {
                        name: self.name.clone(),
                        content,
                    })
            }
        }
    }

    /// The counter record exists only while count > 0.
    async fn write_counter(&self, count: u32) -> Result<()> {
        if count == 0 {
            self.backend.remove_value(&self.counter_key()).await
        } else {
            self.backend
                .write_value(&self.counter_key(), &count.to_string())
                .await
        }
    }

    fn writer_lock(&self) -> FileLock {
        FileLock::new(self.backend.clone(), self.writer_key(), self.ttl)
            .with_poll_interval(self.poll_interval)
    }

    fn writer_key(&self) -> String {
        format!("{}.writer", self.name)
    }

    fn bookkeeping_lock(&self) -> FileLock {
        FileLock::new(
            self.backend.clone(),
            format!("{}.readers-lock", self.name),
            self.ttl,
        )
        .with_poll_interval(self.poll_interval)
    }

    fn counter_key(&self) -> String {
        format!("{}.readers", self.name)
    }
}
