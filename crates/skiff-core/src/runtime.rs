//! Runtime adapter traits and collaborator interfaces.
//!
//! These traits are the narrow seam between the lifecycle core and the
//! hypervisor backend. Swapping backends (Firecracker, Cloud Hypervisor, an
//! in-memory test double) means implementing [`RuntimeAdapter`] and wiring
//! in an [`ArtifactResolver`] and [`NetworkProvisioner`]; the reconciler
//! never learns which one it is talking to.

use crate::error::RuntimeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skiff_api::{ContainerFileSource, NetworkInterface, ValidatedSpec, Volume};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Opaque handle to a runtime-managed microvm instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceHandle(String);

impl InstanceHandle {
    /// Create a new random handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a handle from an adapter-assigned string.
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for InstanceHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Status of an instance as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    /// The instance is active
    Running,
    /// The instance hit an unrecoverable error
    Failed,
    /// The runtime could not determine the instance status
    Unknown,
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeStatus::Running => write!(f, "running"),
            RuntimeStatus::Failed => write!(f, "failed"),
            RuntimeStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Lifecycle operations a hypervisor backend must provide.
///
/// Calls may block for a long time (image pull, VM boot); the reconciler
/// wraps them in timeouts and treats them as cancellable.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Create a microvm instance from a validated specification.
    ///
    /// # Errors
    /// Returns an error if artifacts cannot be resolved, host devices
    /// cannot be provisioned, or the hypervisor rejects the instance.
    async fn create(&self, spec: &ValidatedSpec) -> std::result::Result<InstanceHandle, RuntimeError>;

    /// Query the current status of an instance.
    ///
    /// # Errors
    /// Returns an error if the runtime cannot be reached. Callers map
    /// errors and timeouts to `unknown`, never to `failed`.
    async fn query(&self, handle: &InstanceHandle) -> std::result::Result<RuntimeStatus, RuntimeError>;

    /// Tear down an instance and release its resources.
    ///
    /// # Errors
    /// Returns an error if teardown fails; the instance is then assumed to
    /// still exist.
    async fn delete(&self, handle: &InstanceHandle) -> std::result::Result<(), RuntimeError>;
}

/// Resolves container-image references to local artifacts.
///
/// Consumed by adapters during create; failures propagate as create errors.
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    /// Resolve a kernel or initrd source to a file path on the host.
    async fn resolve_file(
        &self,
        source: &ContainerFileSource,
    ) -> std::result::Result<PathBuf, RuntimeError>;

    /// Resolve a volume's image to a block device or image path on the host.
    async fn resolve_volume(&self, volume: &Volume) -> std::result::Result<PathBuf, RuntimeError>;
}

/// Host-side result of provisioning one guest interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIface {
    /// Name of the created host device (tap/macvtap)
    pub host_dev: String,
    /// Guest MAC address, assigned by the provisioner if the spec left it
    /// unset
    pub guest_mac: String,
}

/// Creates host-side network devices for guest interfaces.
#[async_trait]
pub trait NetworkProvisioner: Send + Sync {
    /// Provision the host side of a guest interface.
    ///
    /// When the interface carries no MAC, the provisioner assigns one and
    /// returns it in the [`HostIface`].
    async fn provision(
        &self,
        iface: &NetworkInterface,
    ) -> std::result::Result<HostIface, RuntimeError>;

    /// Tear down a previously provisioned host device.
    async fn teardown(&self, host_dev: &str) -> std::result::Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_handle_uniqueness() {
        assert_ne!(InstanceHandle::new(), InstanceHandle::new());
    }

    #[test]
    fn test_instance_handle_from_string() {
        let handle = InstanceHandle::from_string("vm-42".to_string());
        assert_eq!(handle.as_str(), "vm-42");
        assert_eq!(handle.to_string(), "vm-42");
    }

    #[test]
    fn test_runtime_status_serde() {
        assert_eq!(
            serde_json::to_string(&RuntimeStatus::Running).unwrap(),
            "\"running\""
        );
        let status: RuntimeStatus = serde_json::from_str("\"unknown\"").unwrap();
        assert_eq!(status, RuntimeStatus::Unknown);
    }
}
