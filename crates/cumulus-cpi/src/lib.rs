//! Cumulus CPI core
//!
//! A Cloud Provider Interface: one process invocation per request, decoding
//! a JSON `{method, arguments, context}` frame, running the requested VM
//! lifecycle operation against the platform's resource-manager API, and
//! answering with `{result, error, log}`.
//!
//! The interesting parts live in [`orchestrator`]: multi-resource create and
//! delete transactions with compensating cleanup, coordinated across CPI
//! processes by the filesystem locks in `cumulus-lock` and executed through
//! the retrying, poll-driving client in `cumulus-arm`.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod orchestrator;
pub mod props;
pub mod stemcell;

pub use config::CpiConfig;
pub use dispatch::{CpiRequest, CpiResponse, Dispatcher, ErrorFrame};
pub use error::{CpiError, Result};
pub use ids::{DiskId, InstanceId};
pub use orchestrator::{OrchestratorConfig, VmOrchestrator};
pub use props::{Caching, DiskProps, NetworkProps, OsType, StemcellRef, VmProps, VmSpec};
pub use stemcell::{CatalogResolver, StemcellResolver};
