//! Lifecycle states of a microvm instance.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Observed lifecycle state of a microvm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Declared and submitted to the runtime, not yet confirmed running
    Pending,
    /// Runtime reports the instance active
    Running,
    /// Creation failed, attempts were exhausted, or the runtime reported an
    /// unrecoverable error
    Failed,
    /// Instance torn down; terminal
    Deleted,
    /// Runtime status could not be determined; needs re-check, not a failure
    Unknown,
}

impl VmState {
    /// Check whether this state is terminal.
    ///
    /// Only `Deleted` is terminal. `Failed` is not: an updated specification
    /// may re-attempt creation.
    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Deleted)
    }

    /// Check whether the transition `self -> next` is permitted.
    ///
    /// Re-asserting the current state is always permitted, and any live
    /// state may be deleted. Nothing leaves `Deleted`.
    pub fn permits(self, next: VmState) -> bool {
        use VmState::*;
        match (self, next) {
            (Deleted, Deleted) => true,
            (Deleted, _) => false,
            (from, to) if from == to => true,
            (_, Deleted) => true,
            (Pending, Running | Failed | Unknown) => true,
            (Running, Unknown | Failed) => true,
            (Unknown, Running | Failed) => true,
            (Failed, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Pending => write!(f, "pending"),
            VmState::Running => write!(f, "running"),
            VmState::Failed => write!(f, "failed"),
            VmState::Deleted => write!(f, "deleted"),
            VmState::Unknown => write!(f, "unknown"),
        }
    }
}
