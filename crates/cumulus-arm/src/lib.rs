//! Resource-manager API plumbing for the Cumulus CPI
//!
//! The platform's resource-manager API is asynchronous: a mutating call is
//! merely *accepted* (202 + poll link) and completes later. This crate hides
//! that behind a synchronous-looking client:
//!
//! - [`TokenCache`]: one cached bearer credential, refreshed on expiry or
//!   forced invalidation
//! - [`ArmClient`]: authenticated GET/PUT/POST/DELETE with transparent
//!   401-refresh, bounded transient retry, and the long-running-operation
//!   poll loop driven to a terminal state
//! - [`ResourcePath`]: the subscription/resource-group/provider/type/name
//!   tuple request URLs are built from
//!
//! All HTTP goes through the [`HttpTransport`] trait; production uses
//! [`ReqwestTransport`], tests script responses in memory (enable the
//! `test-utils` feature for the scripted transport).

pub mod client;
pub mod config;
pub mod error;
pub mod path;
pub mod token;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use client::ArmClient;
pub use config::{ArmConfig, Environment, RetryPolicy};
pub use error::{ArmError, OperationStatus, Result};
pub use path::ResourcePath;
pub use token::TokenCache;
pub use transport::{Body, HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
