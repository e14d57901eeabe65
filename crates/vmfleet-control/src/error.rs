//! Error types for the orchestrator.
//!
//! Validation errors are raised before any hypervisor resource is touched.
//! Everything else raised while provisioning triggers a full rollback.

use thiserror::Error;
use vmfleet_hypervisor::DomainState;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in orchestrator operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The VM name is not a valid token.
    #[error("invalid VM name: {0}")]
    InvalidName(#[from] vmfleet_core::IdError),

    /// A VM or domain with this name already exists.
    #[error("VM already exists: {0}")]
    AlreadyExists(String),

    /// The requested VM was not found.
    #[error("VM not found: {0}")]
    NotFound(String),

    /// The VM is locked against destructive operations.
    #[error("VM {0} is locked")]
    Locked(String),

    /// A wait for the hypervisor or the guest did not finish in time.
    #[error("{0} timed out")]
    Timeout(String),

    /// The domain was observed in the crashed state.
    #[error("domain {0} crashed")]
    Crashed(String),

    /// The domain shut off without ever phoning home.
    #[error("domain {0} shut off before completing its boot handshake")]
    HandshakeMissing(String),

    /// The domain is not in the state the operation requires.
    #[error("domain {domain} is {actual}, expected {expected}")]
    UnexpectedState {
        /// Domain name.
        domain: String,
        /// Required state.
        expected: DomainState,
        /// Observed state.
        actual: DomainState,
    },

    /// A phone-home call carried a secret that belongs to no known VM.
    #[error("phone-home from unknown caller")]
    UnknownCaller,

    /// The network DHCP range has no free address left.
    #[error("no free address left on network {0}")]
    NoFreeAddress(String),

    /// The boot payload could not be generated.
    #[error("boot payload error: {0}")]
    Payload(String),

    /// Hypervisor error.
    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] vmfleet_hypervisor::HypervisorError),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] vmfleet_store::StoreError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidName(_) => 400,
            Self::UnknownCaller => 403,
            Self::NotFound(_) => 404,
            Self::AlreadyExists(_) | Self::Locked(_) | Self::UnexpectedState { .. } => 409,
            Self::Hypervisor(_) => 502,
            Self::NoFreeAddress(_) => 503,
            Self::Timeout(_) => 504,
            Self::Crashed(_)
            | Self::HandshakeMissing(_)
            | Self::Payload(_)
            | Self::Store(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Hypervisor(e) => e.is_retriable(),
            Self::Timeout(_) | Self::NoFreeAddress(_) | Self::Store(_) => true,
            _ => false,
        }
    }
}
