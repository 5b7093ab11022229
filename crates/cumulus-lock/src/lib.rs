//! Cross-process coordination for the Cumulus CPI
//!
//! Every CPI invocation runs as an independent OS process, so mutation of
//! shared named resources (an availability set referenced by many VMs, a
//! shared storage account) cannot be coordinated in memory. This crate
//! provides the two primitives the orchestrator uses instead:
//!
//! - [`FileLock`]: a named, TTL-bounded exclusive claim
//! - [`ReadersWriterLock`]: concurrent readers, exclusive writer, built from
//!   two `FileLock`s and a persisted reader counter
//!
//! Storage is abstracted behind [`LockBackend`] so the default
//! filesystem-based [`FileBackend`] (which only coordinates processes on one
//! host) can be swapped for a networked store without touching the lock
//! logic.
//!
//! A lock error is never recoverable in place: whichever primitive hits one
//! first sets the backend's dirty marker ("locks may be inconsistent, clear
//! before reuse") before propagating, so an operator knows the lock
//! directory needs attention.

pub mod backend;
pub mod error;
pub mod file_lock;
pub mod rw_lock;

pub use backend::{FileBackend, LockBackend};
pub use error::{LockError, Result};
pub use file_lock::FileLock;
pub use rw_lock::ReadersWriterLock;
