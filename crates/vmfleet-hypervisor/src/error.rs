//! Error types for the hypervisor crate.

use thiserror::Error;

/// Errors that can occur while driving the hypervisor.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// A hypervisor command ran but reported failure.
    #[error("{operation} failed: {message}")]
    CommandFailed {
        /// The operation that failed (e.g. `vol-clone`).
        operation: String,
        /// Error output reported by the hypervisor.
        message: String,
    },

    /// The hypervisor command could not be spawned.
    #[error("failed to run hypervisor command: {0}")]
    Io(#[from] std::io::Error),

    /// Domain not found.
    #[error("domain not found: {0}")]
    DomainNotFound(String),

    /// Volume not found.
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    /// Hypervisor output could not be understood.
    #[error("unexpected hypervisor output: {0}")]
    Parse(String),
}

impl HypervisorError {
    /// Build a `CommandFailed` error.
    pub fn command_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::CommandFailed { .. })
    }

    /// Check if this error means the target does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DomainNotFound(_) | Self::VolumeNotFound(_))
    }
}

/// A specialized Result type for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
