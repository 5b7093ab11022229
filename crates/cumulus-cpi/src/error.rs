//! CPI error types

use cumulus_arm::ArmError;
use cumulus_lock::LockError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CpiError {
    #[error("Invalid {kind} id {value:?}: {reason}")]
    InvalidId {
        kind: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid VM configuration: {0}")]
    InvalidConfig(String),

    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("Stemcell '{0}' could not be resolved")]
    StemcellNotFound(String),

    #[error("No free disk slot on VM '{vm}': all {max} luns are in use")]
    DiskSlotsExhausted { vm: String, max: u32 },

    #[error(
        "Creation of VM '{vm_name}' failed: {source}; resources requiring cleanup: [{}]{}",
        .leftovers.join(", "),
        .cleanup_failure.as_ref().map(|c| format!("; cleanup also failed: {c}")).unwrap_or_default()
    )]
    VmCreationFailed {
        vm_name: String,
        /// Sub-resources left behind for manual operator cleanup; empty when
        /// compensating cleanup removed everything.
        leftovers: Vec<String>,
        #[source]
        source: Box<CpiError>,
        cleanup_failure: Option<String>,
    },

    #[error("Method not implemented: {0}")]
    NotImplemented(String),

    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Arm(#[from] ArmError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

pub type Result<T> = std::result::Result<T, CpiError>;

impl CpiError {
    /// Whether the director may safely re-issue the request.
    pub fn ok_to_retry(&self) -> bool {
        match self {
            // Exhausted transient retries and lock contention clear up on
            // their own; everything else needs human or config changes.
            CpiError::Arm(ArmError::RetryExhausted { .. }) => true,
            CpiError::Lock(_) => true,
            _ => false,
        }
    }

    /// Stable error type name for the response frame.
    pub fn type_name(&self) -> &'static str {
        match self {
            CpiError::InvalidId { .. } => "InvalidId",
            CpiError::InvalidConfig(_) => "InvalidConfig",
            CpiError::VmNotFound(_) => "VmNotFound",
            CpiError::StemcellNotFound(_) => "StemcellNotFound",
            CpiError::DiskSlotsExhausted { .. } => "DiskSlotsExhausted",
            CpiError::VmCreationFailed { .. } => "VmCreationFailed",
            CpiError::NotImplemented(_) => "NotImplemented",
            CpiError::BadRequest(_) => "BadRequest",
            CpiError::Arm(ArmError::Authentication(_)) => "AuthenticationError",
            CpiError::Arm(ArmError::TokenExchange { .. }) => "AuthenticationError",
            CpiError::Arm(ArmError::RetryExhausted { .. }) => "RetryExhausted",
            CpiError::Arm(ArmError::AsyncOperationFailed { .. }) => "AsyncOperationFailed",
            CpiError::Arm(ArmError::Conflict(_)) => "ConflictError",
            CpiError::Arm(_) => "CloudError",
            CpiError::Lock(LockError::Timeout { .. }) => "LockTimeout",
            CpiError::Lock(LockError::NotFound(_)) => "LockNotFound",
            CpiError::Lock(LockError::NotOwned(_)) => "LockNotOwned",
            CpiError::Lock(_) => "LockError",
        }
    }
}
