//! In-memory reference runtime adapter.
//!
//! [`InMemoryRuntime`] implements the full adapter surface against a
//! HashMap instead of a hypervisor. It is the reference implementation of
//! the adapter contract and the backend used by the reconciler and
//! controller test suites: faults, artificial latency and reported status
//! are all scriptable per call.

use crate::error::RuntimeError;
use crate::runtime::{
    ArtifactResolver, HostIface, InstanceHandle, NetworkProvisioner, RuntimeAdapter, RuntimeStatus,
};
use async_trait::async_trait;
use skiff_api::{ContainerFileSource, IfaceType, NetworkInterface, ValidatedSpec, Volume};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Artifact resolver that maps image references to synthetic host paths.
///
/// Any image can be marked missing to exercise resolution failures.
#[derive(Debug, Default)]
pub struct MemoryArtifacts {
    missing: Mutex<HashSet<String>>,
}

impl MemoryArtifacts {
    /// Create a resolver with every image present.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an image reference as unresolvable.
    pub async fn mark_missing(&self, image: impl Into<String>) {
        self.missing.lock().await.insert(image.into());
    }

    async fn resolve(&self, image: &str) -> Result<PathBuf, RuntimeError> {
        if self.missing.lock().await.contains(image) {
            return Err(RuntimeError::Resolution(format!(
                "image not found: {image}"
            )));
        }
        let sanitized = image.replace(['/', ':'], "_");
        Ok(PathBuf::from("/var/lib/skiff/artifacts").join(sanitized))
    }
}

#[async_trait]
impl ArtifactResolver for MemoryArtifacts {
    async fn resolve_file(&self, source: &ContainerFileSource) -> Result<PathBuf, RuntimeError> {
        let base = self.resolve(&source.image).await?;
        Ok(match &source.filename {
            Some(filename) => base.join(filename.trim_start_matches('/')),
            None => base.join("default"),
        })
    }

    async fn resolve_volume(&self, volume: &Volume) -> Result<PathBuf, RuntimeError> {
        let base = self.resolve(&volume.image).await?;
        Ok(base.with_extension("ext4"))
    }
}

/// Network provisioner assigning deterministic, locally administered MACs.
///
/// Device names and MAC addresses are drawn from a shared counter, so a
/// test run always sees the same sequence.
#[derive(Debug, Default)]
pub struct SequentialMacs {
    counter: AtomicU64,
}

impl SequentialMacs {
    /// Create a provisioner starting from the first address.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NetworkProvisioner for SequentialMacs {
    async fn provision(&self, iface: &NetworkInterface) -> Result<HostIface, RuntimeError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let host_dev = match iface.kind {
            IfaceType::Tap => format!("skiff-tap{n}"),
            IfaceType::Macvtap => format!("skiff-mvtap{n}"),
        };
        let guest_mac = match &iface.guest_mac {
            Some(mac) => mac.clone(),
            // Locally administered unicast range.
            None => format!("02:00:00:00:{:02x}:{:02x}", (n >> 8) & 0xff, n & 0xff),
        };
        Ok(HostIface {
            host_dev,
            guest_mac,
        })
    }

    async fn teardown(&self, _host_dev: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct InstanceRecord {
    status: RuntimeStatus,
    ifaces: Vec<HostIface>,
}

#[derive(Debug, Default)]
struct Faults {
    create: Option<RuntimeError>,
    query: Option<RuntimeError>,
    delete: Option<RuntimeError>,
}

/// In-memory runtime adapter with scriptable behavior.
pub struct InMemoryRuntime {
    artifacts: MemoryArtifacts,
    network: SequentialMacs,
    instances: Mutex<HashMap<InstanceHandle, InstanceRecord>>,
    faults: Mutex<Faults>,
    initial_status: Mutex<RuntimeStatus>,
    create_delay: Mutex<Option<Duration>>,
    query_delay: Mutex<Option<Duration>>,
    create_calls: AtomicU64,
    query_calls: AtomicU64,
    delete_calls: AtomicU64,
}

impl InMemoryRuntime {
    /// Create an adapter whose instances report `running` right after
    /// creation.
    pub fn new() -> Self {
        Self {
            artifacts: MemoryArtifacts::new(),
            network: SequentialMacs::new(),
            instances: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            initial_status: Mutex::new(RuntimeStatus::Running),
            create_delay: Mutex::new(None),
            query_delay: Mutex::new(None),
            create_calls: AtomicU64::new(0),
            query_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
        }
    }

    /// Access the artifact resolver, e.g. to mark images missing.
    pub fn artifacts(&self) -> &MemoryArtifacts {
        &self.artifacts
    }

    /// Set the status newly created instances report.
    pub async fn set_initial_status(&self, status: RuntimeStatus) {
        *self.initial_status.lock().await = status;
    }

    /// Set the reported status of an existing instance.
    ///
    /// Returns `false` if the instance does not exist.
    pub async fn set_status(&self, handle: &InstanceHandle, status: RuntimeStatus) -> bool {
        match self.instances.lock().await.get_mut(handle) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }

    /// Fail the next create call with the given message.
    pub async fn fail_next_create(&self, message: impl Into<String>) {
        self.faults.lock().await.create = Some(RuntimeError::Failure(message.into()));
    }

    /// Fail the next query call with the given message.
    pub async fn fail_next_query(&self, message: impl Into<String>) {
        self.faults.lock().await.query = Some(RuntimeError::Unavailable(message.into()));
    }

    /// Fail the next delete call with the given message.
    pub async fn fail_next_delete(&self, message: impl Into<String>) {
        self.faults.lock().await.delete = Some(RuntimeError::Failure(message.into()));
    }

    /// Delay every create call, e.g. to exercise cancellation.
    pub async fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().await = Some(delay);
    }

    /// Delay every query call, e.g. to exercise query timeouts.
    pub async fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock().await = Some(delay);
    }

    /// Number of create calls observed.
    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::Relaxed)
    }

    /// Number of query calls observed.
    pub fn query_calls(&self) -> u64 {
        self.query_calls.load(Ordering::Relaxed)
    }

    /// Number of delete calls observed.
    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::Relaxed)
    }

    /// Number of live instances.
    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    /// Check whether an instance exists.
    pub async fn contains(&self, handle: &InstanceHandle) -> bool {
        self.instances.lock().await.contains_key(handle)
    }

    /// Host interfaces provisioned for an instance.
    pub async fn host_ifaces(&self, handle: &InstanceHandle) -> Vec<HostIface> {
        self.instances
            .lock()
            .await
            .get(handle)
            .map(|record| record.ifaces.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeAdapter for InMemoryRuntime {
    async fn create(&self, spec: &ValidatedSpec) -> Result<InstanceHandle, RuntimeError> {
        self.create_calls.fetch_add(1, Ordering::Relaxed);

        let delay = *self.create_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(fault) = self.faults.lock().await.create.take() {
            return Err(fault);
        }

        self.artifacts.resolve_file(&spec.kernel).await?;
        if let Some(initrd) = &spec.initrd {
            self.artifacts.resolve_file(initrd).await?;
        }
        self.artifacts.resolve_volume(&spec.root_volume).await?;
        for volume in &spec.additional_volumes {
            self.artifacts.resolve_volume(volume).await?;
        }

        let mut ifaces = Vec::with_capacity(spec.network_interfaces.len());
        for iface in &spec.network_interfaces {
            ifaces.push(self.network.provision(iface).await?);
        }

        let handle = InstanceHandle::new();
        let status = *self.initial_status.lock().await;
        self.instances.lock().await.insert(
            handle.clone(),
            InstanceRecord {
                status,
                ifaces,
            },
        );
        tracing::debug!(instance = %handle, "In-memory instance created");
        Ok(handle)
    }

    async fn query(&self, handle: &InstanceHandle) -> Result<RuntimeStatus, RuntimeError> {
        self.query_calls.fetch_add(1, Ordering::Relaxed);

        let delay = *self.query_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(fault) = self.faults.lock().await.query.take() {
            return Err(fault);
        }

        match self.instances.lock().await.get(handle) {
            Some(record) => Ok(record.status),
            None => Ok(RuntimeStatus::Unknown),
        }
    }

    async fn delete(&self, handle: &InstanceHandle) -> Result<(), RuntimeError> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(fault) = self.faults.lock().await.delete.take() {
            return Err(fault);
        }

        let removed = self.instances.lock().await.remove(handle);
        if let Some(record) = removed {
            for iface in &record.ifaces {
                self.network.teardown(&iface.host_dev).await?;
            }
            tracing::debug!(instance = %handle, "In-memory instance deleted");
        }
        // Deleting an unknown instance is a no-op: the desired outcome
        // (instance gone) already holds.
        Ok(())
    }
}
