//! Lock error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock '{name}' has been held longer than its TTL of {ttl_secs}s")]
    Timeout { name: String, ttl_secs: u64 },

    #[error("Lock '{0}' not found (removed by another process?)")]
    NotFound(String),

    #[error("Lock '{0}' is not owned by this process")]
    NotOwned(String),

    #[error("Reader counter for '{name}' is corrupt: {content:?}")]
    CorruptCounter { name: String, content: String },

    #[error("Lock backend error: {0}")]
    Backend(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LockError>;

impl LockError {
    /// Whether this error leaves shared lock state in doubt and should set
    /// the dirty marker.
    pub fn taints_locks(&self) -> bool {
        matches!(
            self,
            LockError::Timeout { .. } | LockError::NotFound(_) | LockError::NotOwned(_)
        )
    }
}
