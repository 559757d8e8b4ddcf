//! Controller driving reconciliation for a set of machines.
//!
//! The controller is the cooperative scheduler around the [`Reconciler`]:
//! it keeps the desired specification and last observed state per machine
//! identity, serializes reconcile calls per identity, and runs distinct
//! identities in parallel.

use crate::config::ControllerConfig;
use crate::error::{CoreError, Result};
use crate::lifecycle::MicrovmStatus;
use crate::reconcile::{Observed, ReconcileAction, ReconcileOutcome, Reconciler};
use crate::runtime::RuntimeAdapter;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use skiff_api::{MicrovmSpec, ValidatedSpec, VmState};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Caller-chosen identity of a declared machine.
///
/// The identity is the only join between a desired specification and its
/// observed state. A machine deleted and re-applied under the same
/// identity is a new excursion, never a resurrection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(String);

impl MachineId {
    /// Create a new random machine ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a machine ID from a string.
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MachineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MachineId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Desired and observed state of one machine.
#[derive(Debug, Default)]
struct MachineEntry {
    desired: Option<ValidatedSpec>,
    status: Option<MicrovmStatus>,
    last_applied: Option<ValidatedSpec>,
}

impl MachineEntry {
    fn is_retired(&self) -> bool {
        self.desired.is_none()
            && self
                .status
                .as_ref()
                .map(|s| s.is_deleted())
                .unwrap_or(true)
    }
}

/// Drives reconciliation for a registry of declared machines.
///
/// # Thread Safety
///
/// The registry is behind an async `RwLock`; each machine entry sits
/// behind its own `Mutex`, so at most one reconcile is in flight per
/// identity while ticks for distinct identities run in parallel.
pub struct Controller<A: RuntimeAdapter> {
    machines: RwLock<HashMap<MachineId, Arc<Mutex<MachineEntry>>>>,
    reconciler: Reconciler,
    config: ControllerConfig,
    adapter: A,
}

impl<A: RuntimeAdapter> Controller<A> {
    /// Create a controller around a runtime adapter.
    pub fn new(adapter: A, config: ControllerConfig) -> Self {
        tracing::info!("Creating microvm controller");
        let reconciler = Reconciler::new(config.reconciler.clone());
        Self {
            machines: RwLock::new(HashMap::new()),
            reconciler,
            config,
            adapter,
        }
    }

    /// Get the controller configuration.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Access the underlying runtime adapter.
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Declare (or re-declare) the desired specification for a machine.
    ///
    /// The specification passes through defaulting and validation here;
    /// a malformed spec is rejected in full and never reaches a reconcile
    /// tick. Re-applying an equal specification is a no-op. Applying to a
    /// deleted machine resets it for a fresh excursion.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] with every violation found.
    pub async fn apply(&self, id: &MachineId, spec: &MicrovmSpec) -> Result<()> {
        let validated = spec.admit()?;

        let entry = {
            let mut machines = self.machines.write().await;
            Arc::clone(machines.entry(id.clone()).or_default())
        };
        let mut guard = entry.lock().await;

        if guard.desired.as_ref() == Some(&validated) {
            tracing::debug!(machine = %id, "Specification unchanged, apply is a no-op");
            return Ok(());
        }

        if guard
            .status
            .as_ref()
            .map(|s| s.state == VmState::Deleted)
            .unwrap_or(false)
        {
            tracing::info!(machine = %id, "Re-applying to a deleted machine, starting fresh");
            guard.status = None;
            guard.last_applied = None;
        }

        guard.desired = Some(validated);
        tracing::info!(machine = %id, "Specification applied");
        Ok(())
    }

    /// Withdraw the desired specification for a machine.
    ///
    /// Subsequent ticks will tear the instance down.
    ///
    /// # Errors
    /// Returns [`CoreError::MachineNotFound`] if the machine was never
    /// applied.
    pub async fn withdraw(&self, id: &MachineId) -> Result<()> {
        let entry = self.entry(id).await?;
        let mut guard = entry.lock().await;
        guard.desired = None;
        tracing::info!(machine = %id, "Specification withdrawn");
        Ok(())
    }

    /// Drop a fully retired machine from the registry.
    ///
    /// # Errors
    /// Returns [`CoreError::MachineNotFound`] if unknown, or
    /// [`CoreError::MachineLive`] if the machine still has desired or
    /// live observed state.
    pub async fn remove(&self, id: &MachineId) -> Result<()> {
        let mut machines = self.machines.write().await;
        let entry = machines
            .get(id)
            .ok_or_else(|| CoreError::MachineNotFound(id.clone()))?;
        if !entry.lock().await.is_retired() {
            return Err(CoreError::MachineLive(id.clone()));
        }
        machines.remove(id);
        tracing::debug!(machine = %id, "Machine removed from registry");
        Ok(())
    }

    /// Get the last observed status of a machine.
    ///
    /// `None` means the machine is declared but has not been reconciled
    /// yet.
    ///
    /// # Errors
    /// Returns [`CoreError::MachineNotFound`] if unknown.
    pub async fn status(&self, id: &MachineId) -> Result<Option<MicrovmStatus>> {
        let entry = self.entry(id).await?;
        let guard = entry.lock().await;
        Ok(guard.status.clone())
    }

    /// List all registered machine identities.
    pub async fn machines(&self) -> Vec<MachineId> {
        self.machines.read().await.keys().cloned().collect()
    }

    /// Number of registered machines.
    pub async fn count(&self) -> usize {
        self.machines.read().await.len()
    }

    /// Run one reconcile tick for a single machine.
    ///
    /// # Errors
    /// Returns [`CoreError::MachineNotFound`] if unknown. Runtime errors
    /// hit during the tick are recorded in the outcome, not returned.
    pub async fn tick(&self, id: &MachineId) -> Result<ReconcileOutcome> {
        let entry = self.entry(id).await?;
        Ok(self
            .tick_entry(id, &entry, &CancellationToken::new())
            .await)
    }

    /// Run one reconcile tick for every machine, in parallel.
    ///
    /// Per-identity serialization still holds: each entry's lock is taken
    /// for the duration of its tick.
    pub async fn tick_all(&self) -> Vec<(MachineId, ReconcileAction)> {
        self.tick_all_with(&CancellationToken::new()).await
    }

    /// Drive interval ticks until the shutdown token fires.
    ///
    /// The token is propagated into each tick, so an in-flight create is
    /// cancelled (with best-effort cleanup) rather than abandoned.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        tracing::info!(
            interval_secs = self.config.tick_interval_secs,
            "Controller loop started"
        );

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    tracing::info!("Controller loop received shutdown signal");
                    break;
                }

                _ = interval.tick() => {
                    self.tick_all_with(&shutdown).await;
                }
            }
        }
    }

    async fn entry(&self, id: &MachineId) -> Result<Arc<Mutex<MachineEntry>>> {
        self.machines
            .read()
            .await
            .get(id)
            .map(Arc::clone)
            .ok_or_else(|| CoreError::MachineNotFound(id.clone()))
    }

    async fn tick_all_with(
        &self,
        cancel: &CancellationToken,
    ) -> Vec<(MachineId, ReconcileAction)> {
        let entries: Vec<(MachineId, Arc<Mutex<MachineEntry>>)> = {
            let machines = self.machines.read().await;
            machines
                .iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
                .collect()
        };

        let ticks = entries.iter().map(|(id, entry)| async {
            let outcome = self.tick_entry(id, entry, cancel).await;
            (id.clone(), outcome.action)
        });
        join_all(ticks).await
    }

    async fn tick_entry(
        &self,
        id: &MachineId,
        entry: &Arc<Mutex<MachineEntry>>,
        cancel: &CancellationToken,
    ) -> ReconcileOutcome {
        let mut guard = entry.lock().await;
        tracing::debug!(machine = %id, "Reconcile tick");

        let outcome = self
            .reconciler
            .reconcile_with_cancel(
                guard.desired.as_ref(),
                Observed::new(guard.status.as_ref(), guard.last_applied.as_ref()),
                &self.adapter,
                cancel,
            )
            .await;

        if let Some(error) = &outcome.error {
            tracing::warn!(machine = %id, error = %error, "Reconcile tick degraded");
        }
        if let Some(status) = &outcome.status {
            guard.status = Some(status.clone());
        }
        guard.last_applied = outcome.applied.clone();

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRuntime;
    use skiff_api::{IfaceType, NetworkInterface, Volume};

    fn controller() -> Controller<InMemoryRuntime> {
        Controller::new(InMemoryRuntime::new(), ControllerConfig::default())
    }

    fn valid_spec() -> MicrovmSpec {
        MicrovmSpec::builder()
            .vcpu(2)
            .memory_mb(2048)
            .root_volume(Volume::new("root", "img:v1"))
            .kernel("kernel:5.10")
            .network_interface(NetworkInterface::new("eth0", IfaceType::Tap))
            .build()
    }

    #[test]
    fn test_machine_id_roundtrip() {
        let id = MachineId::from("web-0");
        assert_eq!(id.as_str(), "web-0");
        assert_eq!(id.to_string(), "web-0");
        assert_ne!(MachineId::new(), MachineId::new());
    }

    #[tokio::test]
    async fn test_apply_rejects_invalid_spec_in_full() {
        let controller = controller();
        let spec = MicrovmSpec::builder().build();

        let err = controller
            .apply(&MachineId::from("bad"), &spec)
            .await
            .unwrap_err();
        let CoreError::Validation(violations) = err else {
            panic!("expected validation error");
        };
        assert!(violations.len() >= 4);

        // The malformed spec was never registered; no adapter traffic.
        assert_eq!(controller.count().await, 0);
        assert_eq!(controller.adapter().create_calls(), 0);
    }

    #[tokio::test]
    async fn test_status_of_unknown_machine() {
        let controller = controller();
        let result = controller.status(&MachineId::from("ghost")).await;
        assert!(matches!(result, Err(CoreError::MachineNotFound(_))));
    }

    #[tokio::test]
    async fn test_apply_equal_spec_is_noop() {
        let controller = controller();
        let id = MachineId::from("web-0");
        controller.apply(&id, &valid_spec()).await.unwrap();
        controller.apply(&id, &valid_spec()).await.unwrap();
        assert_eq!(controller.count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_live_machine_refused() {
        let controller = controller();
        let id = MachineId::from("web-0");
        controller.apply(&id, &valid_spec()).await.unwrap();

        let err = controller.remove(&id).await.unwrap_err();
        assert!(matches!(err, CoreError::MachineLive(_)));
    }

    #[tokio::test]
    async fn test_remove_after_full_teardown() {
        let controller = controller();
        let id = MachineId::from("web-0");
        controller.apply(&id, &valid_spec()).await.unwrap();
        controller.tick(&id).await.unwrap();
        controller.withdraw(&id).await.unwrap();
        controller.tick(&id).await.unwrap();

        controller.remove(&id).await.unwrap();
        assert_eq!(controller.count().await, 0);
    }

    #[tokio::test]
    async fn test_tick_unknown_machine() {
        let controller = controller();
        let result = controller.tick(&MachineId::from("ghost")).await;
        assert!(matches!(result, Err(CoreError::MachineNotFound(_))));
    }
}
