//! Error types for skiff-core.

use crate::controller::MachineId;
use skiff_api::{Violations, VmState};
use thiserror::Error;

/// Result type alias for skiff-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by a runtime adapter or its collaborators.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// An image, kernel or volume reference could not be resolved
    #[error("artifact resolution failed: {0}")]
    Resolution(String),

    /// The adapter reported an operation failure
    #[error("runtime failure: {0}")]
    Failure(String),

    /// The adapter did not answer in time
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The adapter itself is unreachable
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the lifecycle core.
///
/// Runtime-side failures are recorded in the observed status and retried on
/// a later tick; only validation blocks reconciliation outright.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Specification malformed; reported in full, never reaches a runtime
    #[error("validation failed: {0}")]
    Validation(#[from] Violations),

    /// An image, kernel or volume could not be fetched; retryable
    #[error("resource resolution failed: {0}")]
    ResourceResolution(String),

    /// Adapter-level create failure; surfaces as `failed`, retried later
    #[error("instance creation failed: {0}")]
    RuntimeCreate(String),

    /// Adapter-level delete failure; state is retained, retried later
    #[error("instance deletion failed: {0}")]
    RuntimeDelete(String),

    /// Status query failed or timed out; surfaces as `unknown`, never
    /// escalated directly to `failed`
    #[error("status query failed: {0}")]
    TransientQuery(String),

    /// A lifecycle transition outside the permitted table was attempted
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// State before the attempted transition
        from: VmState,
        /// Requested target state
        to: VmState,
    },

    /// No machine registered under the given identity
    #[error("machine not found: {0}")]
    MachineNotFound(MachineId),

    /// The machine still has live state and cannot be removed
    #[error("machine still live: {0}")]
    MachineLive(MachineId),
}

impl CoreError {
    /// Check if this error is retryable on a later reconcile tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ResourceResolution(_)
                | CoreError::RuntimeCreate(_)
                | CoreError::RuntimeDelete(_)
                | CoreError::TransientQuery(_)
        )
    }
}
