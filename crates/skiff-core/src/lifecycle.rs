//! Observed lifecycle record for a microvm instance.

use crate::error::{CoreError, Result};
use crate::runtime::InstanceHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_api::VmState;

/// Observed lifecycle status of a single microvm.
///
/// Owned by the lifecycle layer and joined to the desired specification
/// only by external identity; the spec is never embedded here. Every
/// degraded transition leaves an inspectable `reason` alongside the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicrovmStatus {
    /// Current lifecycle state
    pub state: VmState,
    /// Why the machine is in this state, when degraded or uncertain
    pub reason: Option<String>,
    /// Runtime handle, once a create has succeeded
    pub instance: Option<InstanceHandle>,
    /// Reconcile ticks spent in `pending` without confirmation
    pub pending_attempts: u32,
    /// When the record last changed
    pub updated_at: DateTime<Utc>,
}

impl MicrovmStatus {
    /// Create a record for a freshly submitted instance.
    pub fn pending(instance: InstanceHandle) -> Self {
        Self {
            state: VmState::Pending,
            reason: None,
            instance: Some(instance),
            pending_attempts: 0,
            updated_at: Utc::now(),
        }
    }

    /// Create a record for an instance whose creation failed outright.
    ///
    /// No handle is recorded; a later tick may retry the create.
    pub fn create_failed(reason: impl Into<String>) -> Self {
        Self {
            state: VmState::Failed,
            reason: Some(reason.into()),
            instance: None,
            pending_attempts: 0,
            updated_at: Utc::now(),
        }
    }

    /// Create a record for a withdrawn instance that never reached the
    /// runtime, or whose cleanup state is uncertain.
    pub fn detached(state: VmState, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: Some(reason.into()),
            instance: None,
            pending_attempts: 0,
            updated_at: Utc::now(),
        }
    }

    /// Check if the machine is confirmed running.
    pub fn is_running(&self) -> bool {
        self.state == VmState::Running
    }

    /// Check if the record is terminal.
    pub fn is_deleted(&self) -> bool {
        self.state == VmState::Deleted
    }

    /// Apply a lifecycle transition.
    ///
    /// Enforces the permitted-transition table: re-asserting the current
    /// state refreshes `reason` and the timestamp, a confirmed `running`
    /// resets the pending-attempt counter, and anything outside the table
    /// is rejected rather than coerced.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidTransition`] if the edge is not
    /// permitted.
    pub fn transition(&mut self, to: VmState, reason: Option<String>) -> Result<()> {
        if !self.state.permits(to) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        if self.state != to {
            tracing::info!(from = %self.state, to = %to, "Lifecycle transition");
        }
        self.state = to;
        self.reason = reason;
        self.updated_at = Utc::now();
        if to == VmState::Running {
            self.pending_attempts = 0;
        }
        Ok(())
    }

    /// Record one unconfirmed reconcile tick while `pending`.
    ///
    /// The state stays `pending` until the configured bound is reached;
    /// exhausting it transitions to `failed` with an attempts-exhausted
    /// reason.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidTransition`] if called outside `pending`.
    pub fn record_pending_attempt(&mut self, max_attempts: u32, detail: &str) -> Result<()> {
        if self.state != VmState::Pending {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: VmState::Pending,
            });
        }
        self.pending_attempts += 1;
        if self.pending_attempts >= max_attempts {
            return self.transition(
                VmState::Failed,
                Some(format!(
                    "no confirmation after {} pending attempts: {detail}",
                    self.pending_attempts
                )),
            );
        }
        tracing::debug!(
            attempts = self.pending_attempts,
            max = max_attempts,
            "Still pending, no confirmation yet"
        );
        self.reason = Some(detail.to_string());
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_record() {
        let status = MicrovmStatus::pending(InstanceHandle::new());
        assert_eq!(status.state, VmState::Pending);
        assert!(status.instance.is_some());
        assert!(status.reason.is_none());
    }

    #[test]
    fn test_transition_to_running_resets_attempts() {
        let mut status = MicrovmStatus::pending(InstanceHandle::new());
        status.pending_attempts = 3;
        status.transition(VmState::Running, None).unwrap();
        assert_eq!(status.state, VmState::Running);
        assert_eq!(status.pending_attempts, 0);
    }

    #[test]
    fn test_transition_out_of_deleted_rejected() {
        let mut status = MicrovmStatus::pending(InstanceHandle::new());
        status.transition(VmState::Deleted, None).unwrap();
        let err = status.transition(VmState::Pending, None).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidTransition {
                from: VmState::Deleted,
                to: VmState::Pending,
            }
        ));
        assert_eq!(status.state, VmState::Deleted);
    }

    #[test]
    fn test_transition_records_reason() {
        let mut status = MicrovmStatus::pending(InstanceHandle::new());
        status
            .transition(VmState::Failed, Some("boot error".to_string()))
            .unwrap();
        assert_eq!(status.reason.as_deref(), Some("boot error"));
    }

    #[test]
    fn test_pending_attempts_exhaust_to_failed() {
        let mut status = MicrovmStatus::pending(InstanceHandle::new());
        status.record_pending_attempt(3, "no status yet").unwrap();
        assert_eq!(status.state, VmState::Pending);
        status.record_pending_attempt(3, "no status yet").unwrap();
        assert_eq!(status.state, VmState::Pending);
        status.record_pending_attempt(3, "no status yet").unwrap();
        assert_eq!(status.state, VmState::Failed);
        assert!(status.reason.as_deref().unwrap().contains("3 pending attempts"));
    }

    #[test]
    fn test_pending_attempt_outside_pending_rejected() {
        let mut status = MicrovmStatus::pending(InstanceHandle::new());
        status.transition(VmState::Running, None).unwrap();
        assert!(status.record_pending_attempt(3, "x").is_err());
    }

    #[test]
    fn test_create_failed_has_no_handle() {
        let status = MicrovmStatus::create_failed("image pull failed");
        assert_eq!(status.state, VmState::Failed);
        assert!(status.instance.is_none());
    }
}
