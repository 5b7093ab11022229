//! Resource-manager client error types

use serde::Deserialize;
use thiserror::Error;

/// Error code the platform reports when VM provisioning failed for a
/// transient platform-side reason. The orchestrator retries creation on it.
pub const PROVISIONING_FAILED_CODE: &str = "ProvisioningState/failed";

#[derive(Error, Debug)]
pub enum ArmError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Token exchange failed with status {status}")]
    TokenExchange { status: u16 },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Retries exhausted after {attempts} attempts (last failure: {last})")]
    RetryExhausted { attempts: u32, last: String },

    #[error("Async operation ended {status}: [{code}] {message}")]
    AsyncOperationFailed {
        status: OperationStatus,
        code: String,
        message: String,
        payload: serde_json::Value,
    },

    #[error("Conflict on {0}")]
    Conflict(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("Accepted response from {0} carried no poll link")]
    MissingPollLink(String),

    #[error("Malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ArmError>;

impl ArmError {
    /// Whether this is the platform's generic "provisioning failed" terminal
    /// state, which callers may retry wholesale.
    pub fn is_provisioning_failure(&self) -> bool {
        matches!(
            self,
            ArmError::AsyncOperationFailed { code, .. } if code == PROVISIONING_FAILED_CODE
        )
    }
}

/// Status of a long-running platform operation.
///
/// `Succeeded`, `Failed` and `Canceled` are terminal; `InProgress` keeps the
/// poll loop going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::InProgress)
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            // "Running" is an alias some providers report for in-flight
            // operations.
            "InProgress" | "Running" => Ok(OperationStatus::InProgress),
            "Succeeded" => Ok(OperationStatus::Succeeded),
            "Failed" => Ok(OperationStatus::Failed),
            "Canceled" | "Cancelled" => Ok(OperationStatus::Canceled),
            other => Err(format!("unknown operation status {other:?}")),
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::InProgress => write!(f, "InProgress"),
            OperationStatus::Succeeded => write!(f, "Succeeded"),
            OperationStatus::Failed => write!(f, "Failed"),
            OperationStatus::Canceled => write!(f, "Canceled"),
        }
    }
}
