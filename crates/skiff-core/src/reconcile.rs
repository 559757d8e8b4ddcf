//! Reconciliation of desired specifications against observed state.
//!
//! One [`Reconciler::reconcile`] call is one convergence attempt: given the
//! desired (validated) specification, the last observed status and the last
//! specification actually applied, it decides on a single action (create,
//! query, delete, or report unsupported drift), performs it against the
//! runtime adapter, and returns the resulting status.
//!
//! The reconciler holds no state of its own. Calling it twice with the same
//! inputs and an unchanged runtime yields the same outcome and no duplicate
//! create calls, which is what lets an external scheduler retry it freely.

use crate::config::ReconcilerConfig;
use crate::error::{CoreError, RuntimeError};
use crate::lifecycle::MicrovmStatus;
use crate::runtime::{RuntimeAdapter, RuntimeStatus};
use skiff_api::{ValidatedSpec, VmState};
use tokio_util::sync::CancellationToken;

/// Last observed state of one machine, borrowed for a single reconcile.
///
/// `last_applied` is the specification most recently submitted to the
/// runtime. It lives beside the status rather than inside it, so desired
/// and observed state stay decoupled and drift detection is a plain value
/// comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct Observed<'a> {
    /// Lifecycle status from the previous tick, if any
    pub status: Option<&'a MicrovmStatus>,
    /// Specification last submitted to the runtime, if any
    pub last_applied: Option<&'a ValidatedSpec>,
}

impl<'a> Observed<'a> {
    /// Observation of a machine never seen before.
    pub fn none() -> Self {
        Self::default()
    }

    /// Observation from explicit parts.
    pub fn new(
        status: Option<&'a MicrovmStatus>,
        last_applied: Option<&'a ValidatedSpec>,
    ) -> Self {
        Self {
            status,
            last_applied,
        }
    }

    /// Observation carried over from a previous reconcile outcome.
    pub fn from_outcome(outcome: &'a ReconcileOutcome) -> Self {
        Self {
            status: outcome.status.as_ref(),
            last_applied: outcome.applied.as_ref(),
        }
    }
}

/// The action a reconcile tick decided on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing to do
    None,
    /// The runtime's create operation was invoked
    Create,
    /// The runtime's query operation was invoked
    Query,
    /// The runtime's delete operation was invoked (or the record was
    /// retired directly when no instance existed)
    Delete,
    /// The desired specification drifted on fields that require
    /// recreation; the caller must delete and re-apply. Not an error.
    UpdateUnsupported {
        /// Wire names of the drifted fields
        changed: Vec<String>,
    },
}

/// Result of one reconcile tick.
///
/// Errors are recorded data, never loop-fatal: the caller persists `status`
/// and `applied` and simply ticks again later.
#[derive(Debug)]
pub struct ReconcileOutcome {
    /// New observed status, if the machine has one
    pub status: Option<MicrovmStatus>,
    /// Specification now considered applied to the runtime
    pub applied: Option<ValidatedSpec>,
    /// Action taken this tick
    pub action: ReconcileAction,
    /// Error hit while acting, already reflected in `status.reason`
    pub error: Option<CoreError>,
}

/// Converges one machine's observed state toward its desired state.
pub struct Reconciler {
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a reconciler with the given tuning.
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    /// Get the reconciler configuration.
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one reconcile tick.
    ///
    /// `desired = None` means the specification was withdrawn and the
    /// machine should be torn down.
    pub async fn reconcile<A: RuntimeAdapter>(
        &self,
        desired: Option<&ValidatedSpec>,
        observed: Observed<'_>,
        adapter: &A,
    ) -> ReconcileOutcome {
        self.reconcile_with_cancel(desired, observed, adapter, &CancellationToken::new())
            .await
    }

    /// Run one reconcile tick under a cancellation token.
    ///
    /// Cancellation matters for the create path, which may block on image
    /// pulls and VM boot. If cancellation wins before the runtime answers,
    /// the machine is recorded `unknown` with an unconfirmed-cleanup
    /// reason. If the create completes under a fired token, a best-effort
    /// delete runs; only a confirmed cleanup yields `deleted`.
    pub async fn reconcile_with_cancel<A: RuntimeAdapter>(
        &self,
        desired: Option<&ValidatedSpec>,
        observed: Observed<'_>,
        adapter: &A,
        cancel: &CancellationToken,
    ) -> ReconcileOutcome {
        // A deleted record is never resurrected: it counts as "no live
        // state", and a still-desired spec starts a fresh excursion.
        let live = observed.status.filter(|s| !s.is_deleted());

        match (desired, live) {
            (Some(spec), None) => self.create(spec, adapter, cancel).await,

            (Some(spec), Some(status)) => {
                let changed: Vec<String> = observed
                    .last_applied
                    .map(|last| {
                        spec.changed_fields(last)
                            .into_iter()
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();

                match status.state {
                    VmState::Pending | VmState::Running | VmState::Unknown => {
                        if !changed.is_empty() {
                            return Self::update_unsupported(status, observed.last_applied, changed);
                        }
                        self.query(status, observed.last_applied, adapter).await
                    }
                    VmState::Failed => {
                        if status.instance.is_none() {
                            // Create never succeeded; retry with the
                            // current (possibly remediated) spec.
                            self.create(spec, adapter, cancel).await
                        } else if !changed.is_empty() {
                            Self::update_unsupported(status, observed.last_applied, changed)
                        } else {
                            // A failed instance awaits withdraw-then-reapply.
                            ReconcileOutcome {
                                status: Some(status.clone()),
                                applied: observed.last_applied.cloned(),
                                action: ReconcileAction::None,
                                error: None,
                            }
                        }
                    }
                    // Filtered out above; kept for exhaustiveness.
                    VmState::Deleted => ReconcileOutcome {
                        status: Some(status.clone()),
                        applied: None,
                        action: ReconcileAction::None,
                        error: None,
                    },
                }
            }

            (None, Some(status)) => self.delete(status, observed.last_applied, adapter).await,

            (None, None) => ReconcileOutcome {
                status: observed.status.cloned(),
                applied: None,
                action: ReconcileAction::None,
                error: None,
            },
        }
    }

    async fn create<A: RuntimeAdapter>(
        &self,
        spec: &ValidatedSpec,
        adapter: &A,
        cancel: &CancellationToken,
    ) -> ReconcileOutcome {
        let result = tokio::select! {
            biased;
            result = adapter.create(spec) => Some(result),
            () = cancel.cancelled() => None,
        };

        match result {
            None => {
                // No handle was learned, so cleanup cannot be confirmed.
                tracing::warn!("Create cancelled in flight, cleanup unconfirmed");
                ReconcileOutcome {
                    status: Some(MicrovmStatus::detached(
                        VmState::Unknown,
                        "create cancelled in flight; cleanup unconfirmed",
                    )),
                    applied: None,
                    action: ReconcileAction::Create,
                    error: None,
                }
            }

            Some(Ok(handle)) => {
                if cancel.is_cancelled() {
                    return match adapter.delete(&handle).await {
                        Ok(()) => {
                            tracing::info!(instance = %handle, "Cancelled create cleaned up");
                            ReconcileOutcome {
                                status: Some(MicrovmStatus::detached(
                                    VmState::Deleted,
                                    "create cancelled; instance removed",
                                )),
                                applied: None,
                                action: ReconcileAction::Create,
                                error: None,
                            }
                        }
                        Err(e) => {
                            let error = CoreError::RuntimeDelete(e.to_string());
                            tracing::error!(instance = %handle, error = %error,
                                "Cleanup of cancelled create failed");
                            let mut status = MicrovmStatus::pending(handle);
                            let transition_err = status
                                .transition(
                                    VmState::Unknown,
                                    Some(format!("create cancelled; cleanup failed: {e}")),
                                )
                                .err();
                            ReconcileOutcome {
                                status: Some(status),
                                applied: Some(spec.clone()),
                                action: ReconcileAction::Create,
                                error: transition_err.or(Some(error)),
                            }
                        }
                    };
                }

                tracing::info!(instance = %handle, "Instance created, awaiting confirmation");
                ReconcileOutcome {
                    status: Some(MicrovmStatus::pending(handle)),
                    applied: Some(spec.clone()),
                    action: ReconcileAction::Create,
                    error: None,
                }
            }

            Some(Err(e)) => {
                let error = match &e {
                    RuntimeError::Resolution(msg) => CoreError::ResourceResolution(msg.clone()),
                    other => CoreError::RuntimeCreate(other.to_string()),
                };
                tracing::warn!(error = %error, "Instance creation failed");
                ReconcileOutcome {
                    status: Some(MicrovmStatus::create_failed(error.to_string())),
                    applied: None,
                    action: ReconcileAction::Create,
                    error: Some(error),
                }
            }
        }
    }

    async fn query<A: RuntimeAdapter>(
        &self,
        status: &MicrovmStatus,
        last_applied: Option<&ValidatedSpec>,
        adapter: &A,
    ) -> ReconcileOutcome {
        let mut next = status.clone();

        let Some(handle) = next.instance.clone() else {
            // Live record without a handle (e.g. unconfirmed cleanup after
            // a cancelled create). Nothing to ask the runtime; the escape
            // hatch is withdraw-then-reapply.
            let error = self.degrade(&mut next, "no instance handle recorded");
            return ReconcileOutcome {
                status: Some(next),
                applied: last_applied.cloned(),
                action: ReconcileAction::None,
                error,
            };
        };

        let timeout = self.config.query_timeout();
        let error = match tokio::time::timeout(timeout, adapter.query(&handle)).await {
            Ok(Ok(RuntimeStatus::Running)) => next.transition(VmState::Running, None).err(),
            Ok(Ok(RuntimeStatus::Failed)) => next
                .transition(
                    VmState::Failed,
                    Some("runtime reported instance failed".to_string()),
                )
                .err(),
            Ok(Ok(RuntimeStatus::Unknown)) => {
                self.degrade(&mut next, "runtime reported status unknown")
            }
            Ok(Err(e)) => self.degrade(&mut next, &format!("query failed: {e}")),
            Err(_) => self.degrade(&mut next, &format!("query timed out after {timeout:?}")),
        };

        ReconcileOutcome {
            status: Some(next),
            applied: last_applied.cloned(),
            action: ReconcileAction::Query,
            error,
        }
    }

    /// Handle an unconfirmed or failed query result.
    ///
    /// A timeout or ambiguous answer never escalates straight to `failed`:
    /// a pending machine burns one bounded attempt (and fails only when
    /// the bound is exhausted), anything else degrades to `unknown`.
    fn degrade(&self, next: &mut MicrovmStatus, detail: &str) -> Option<CoreError> {
        let applied = if next.state == VmState::Pending {
            next.record_pending_attempt(self.config.max_pending_attempts, detail)
        } else {
            next.transition(VmState::Unknown, Some(detail.to_string()))
        };
        match applied {
            Ok(()) => Some(CoreError::TransientQuery(detail.to_string())),
            Err(err) => Some(err),
        }
    }

    async fn delete<A: RuntimeAdapter>(
        &self,
        status: &MicrovmStatus,
        last_applied: Option<&ValidatedSpec>,
        adapter: &A,
    ) -> ReconcileOutcome {
        let mut next = status.clone();

        let Some(handle) = next.instance.clone() else {
            // Withdrawn before any instance existed; retire the record.
            let error = next
                .transition(
                    VmState::Deleted,
                    Some("withdrawn before any instance existed".to_string()),
                )
                .err();
            return ReconcileOutcome {
                status: Some(next),
                applied: None,
                action: ReconcileAction::Delete,
                error,
            };
        };

        match adapter.delete(&handle).await {
            Ok(()) => {
                tracing::info!(instance = %handle, "Instance deleted");
                let error = next.transition(VmState::Deleted, None).err();
                ReconcileOutcome {
                    status: Some(next),
                    applied: None,
                    action: ReconcileAction::Delete,
                    error,
                }
            }
            Err(e) => {
                let error = CoreError::RuntimeDelete(e.to_string());
                tracing::error!(instance = %handle, error = %error, "Instance deletion failed");
                // State retained; only the reason is refreshed so the
                // failure stays inspectable until the retry succeeds.
                let current = next.state;
                let transition_err = next.transition(current, Some(error.to_string())).err();
                ReconcileOutcome {
                    status: Some(next),
                    applied: last_applied.cloned(),
                    action: ReconcileAction::Delete,
                    error: transition_err.or(Some(error)),
                }
            }
        }
    }

    fn update_unsupported(
        status: &MicrovmStatus,
        last_applied: Option<&ValidatedSpec>,
        changed: Vec<String>,
    ) -> ReconcileOutcome {
        tracing::warn!(fields = ?changed, "Specification drift requires recreation");
        ReconcileOutcome {
            status: Some(status.clone()),
            applied: last_applied.cloned(),
            action: ReconcileAction::UpdateUnsupported { changed },
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRuntime;
    use skiff_api::{IfaceType, MicrovmSpec, NetworkInterface, Volume};
    use std::time::Duration;

    fn spec() -> ValidatedSpec {
        MicrovmSpec::builder()
            .vcpu(2)
            .memory_mb(2048)
            .root_volume(Volume::new("root", "img:v1"))
            .kernel("kernel:5.10")
            .network_interface(NetworkInterface::new("eth0", IfaceType::Tap))
            .build()
            .admit()
            .unwrap()
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(ReconcilerConfig::default())
    }

    #[tokio::test]
    async fn test_first_tick_creates_exactly_once() {
        let runtime = InMemoryRuntime::new();
        let desired = spec();

        let outcome = reconciler()
            .reconcile(Some(&desired), Observed::none(), &runtime)
            .await;

        assert_eq!(outcome.action, ReconcileAction::Create);
        assert!(outcome.error.is_none());
        let status = outcome.status.as_ref().unwrap();
        assert_eq!(status.state, VmState::Pending);
        assert!(status.instance.is_some());
        assert_eq!(runtime.create_calls(), 1);
        assert_eq!(outcome.applied.as_ref(), Some(&desired));
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let runtime = InMemoryRuntime::new();
        let desired = spec();
        let r = reconciler();

        let first = r.reconcile(Some(&desired), Observed::none(), &runtime).await;
        let second = r
            .reconcile(Some(&desired), Observed::from_outcome(&first), &runtime)
            .await;
        let third = r
            .reconcile(Some(&desired), Observed::from_outcome(&second), &runtime)
            .await;

        // Pending -> running on confirmation, then steady state; only the
        // initial create ever hit the adapter.
        assert_eq!(second.status.as_ref().unwrap().state, VmState::Running);
        assert_eq!(third.status.as_ref().unwrap().state, VmState::Running);
        assert_eq!(third.action, ReconcileAction::Query);
        assert_eq!(runtime.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_is_recorded_and_retried() {
        let runtime = InMemoryRuntime::new();
        runtime.fail_next_create("hypervisor out of memory").await;
        let desired = spec();
        let r = reconciler();

        let first = r.reconcile(Some(&desired), Observed::none(), &runtime).await;
        let status = first.status.as_ref().unwrap();
        assert_eq!(status.state, VmState::Failed);
        assert!(status.instance.is_none());
        assert!(status.reason.as_deref().unwrap().contains("out of memory"));
        assert!(matches!(first.error, Some(CoreError::RuntimeCreate(_))));

        // Failed-without-handle retries create on the next tick.
        let second = r
            .reconcile(Some(&desired), Observed::from_outcome(&first), &runtime)
            .await;
        assert_eq!(second.action, ReconcileAction::Create);
        assert_eq!(second.status.as_ref().unwrap().state, VmState::Pending);
        assert_eq!(runtime.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_resolution_failure_classified() {
        let runtime = InMemoryRuntime::new();
        runtime.artifacts().mark_missing("kernel:5.10").await;

        let outcome = reconciler()
            .reconcile(Some(&spec()), Observed::none(), &runtime)
            .await;
        assert!(matches!(
            outcome.error,
            Some(CoreError::ResourceResolution(_))
        ));
        assert_eq!(outcome.status.as_ref().unwrap().state, VmState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_timeout_degrades_running_to_unknown() {
        let runtime = InMemoryRuntime::new();
        let desired = spec();
        let r = reconciler();

        let first = r.reconcile(Some(&desired), Observed::none(), &runtime).await;
        let second = r
            .reconcile(Some(&desired), Observed::from_outcome(&first), &runtime)
            .await;
        assert!(second.status.as_ref().unwrap().is_running());

        runtime.set_query_delay(Duration::from_secs(120)).await;
        let third = r
            .reconcile(Some(&desired), Observed::from_outcome(&second), &runtime)
            .await;

        let status = third.status.as_ref().unwrap();
        assert_eq!(status.state, VmState::Unknown);
        assert!(status.reason.as_deref().unwrap().contains("timed out"));
        assert!(matches!(third.error, Some(CoreError::TransientQuery(_))));
    }

    #[tokio::test]
    async fn test_query_error_never_escalates_to_failed() {
        let runtime = InMemoryRuntime::new();
        let desired = spec();
        let r = reconciler();

        let first = r.reconcile(Some(&desired), Observed::none(), &runtime).await;
        let second = r
            .reconcile(Some(&desired), Observed::from_outcome(&first), &runtime)
            .await;

        runtime.fail_next_query("control socket gone").await;
        let third = r
            .reconcile(Some(&desired), Observed::from_outcome(&second), &runtime)
            .await;
        assert_eq!(third.status.as_ref().unwrap().state, VmState::Unknown);

        // Next successful query resolves unknown back to running.
        let fourth = r
            .reconcile(Some(&desired), Observed::from_outcome(&third), &runtime)
            .await;
        assert_eq!(fourth.status.as_ref().unwrap().state, VmState::Running);
    }

    #[tokio::test]
    async fn test_pending_attempts_exhaust_to_failed() {
        let runtime = InMemoryRuntime::new();
        runtime.set_initial_status(RuntimeStatus::Unknown).await;
        let desired = spec();
        let r = Reconciler::new(ReconcilerConfig {
            max_pending_attempts: 2,
            ..ReconcilerConfig::default()
        });

        let create = r.reconcile(Some(&desired), Observed::none(), &runtime).await;
        let first = r
            .reconcile(Some(&desired), Observed::from_outcome(&create), &runtime)
            .await;
        assert_eq!(first.status.as_ref().unwrap().state, VmState::Pending);
        assert_eq!(first.status.as_ref().unwrap().pending_attempts, 1);

        let second = r
            .reconcile(Some(&desired), Observed::from_outcome(&first), &runtime)
            .await;
        let status = second.status.as_ref().unwrap();
        assert_eq!(status.state, VmState::Failed);
        assert!(status.reason.as_deref().unwrap().contains("pending attempts"));
    }

    #[tokio::test]
    async fn test_runtime_reported_failure() {
        let runtime = InMemoryRuntime::new();
        runtime.set_initial_status(RuntimeStatus::Failed).await;
        let desired = spec();
        let r = reconciler();

        let create = r.reconcile(Some(&desired), Observed::none(), &runtime).await;
        let next = r
            .reconcile(Some(&desired), Observed::from_outcome(&create), &runtime)
            .await;

        let status = next.status.as_ref().unwrap();
        assert_eq!(status.state, VmState::Failed);
        assert!(status.instance.is_some());
        assert!(status
            .reason
            .as_deref()
            .unwrap()
            .contains("runtime reported instance failed"));

        // Failed-with-handle holds steady until withdraw or spec change.
        let again = r
            .reconcile(Some(&desired), Observed::from_outcome(&next), &runtime)
            .await;
        assert_eq!(again.action, ReconcileAction::None);
        assert_eq!(runtime.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_withdraw_deletes_running_instance() {
        let runtime = InMemoryRuntime::new();
        let desired = spec();
        let r = reconciler();

        let create = r.reconcile(Some(&desired), Observed::none(), &runtime).await;
        let running = r
            .reconcile(Some(&desired), Observed::from_outcome(&create), &runtime)
            .await;

        let outcome = r
            .reconcile(None, Observed::from_outcome(&running), &runtime)
            .await;
        assert_eq!(outcome.action, ReconcileAction::Delete);
        assert_eq!(outcome.status.as_ref().unwrap().state, VmState::Deleted);
        assert!(outcome.applied.is_none());
        assert_eq!(runtime.instance_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_delete_retains_state() {
        let runtime = InMemoryRuntime::new();
        let desired = spec();
        let r = reconciler();

        let create = r.reconcile(Some(&desired), Observed::none(), &runtime).await;
        let running = r
            .reconcile(Some(&desired), Observed::from_outcome(&create), &runtime)
            .await;

        runtime.fail_next_delete("device busy").await;
        let outcome = r
            .reconcile(None, Observed::from_outcome(&running), &runtime)
            .await;

        let status = outcome.status.as_ref().unwrap();
        assert_eq!(status.state, VmState::Running);
        assert!(status.reason.as_deref().unwrap().contains("device busy"));
        assert!(matches!(outcome.error, Some(CoreError::RuntimeDelete(_))));

        // The retry succeeds once the fault clears.
        let retry = r
            .reconcile(None, Observed::from_outcome(&outcome), &runtime)
            .await;
        assert_eq!(retry.status.as_ref().unwrap().state, VmState::Deleted);
    }

    #[tokio::test]
    async fn test_drift_reports_update_unsupported_without_adapter_calls() {
        let runtime = InMemoryRuntime::new();
        let desired = spec();
        let r = reconciler();

        let create = r.reconcile(Some(&desired), Observed::none(), &runtime).await;
        let running = r
            .reconcile(Some(&desired), Observed::from_outcome(&create), &runtime)
            .await;
        let queries_before = runtime.query_calls();

        let mut drifted = desired.as_ref().clone();
        drifted.memory_mb = 4096;
        drifted
            .additional_volumes
            .push(Volume::new("scratch", "scratch:v1"));
        let drifted = drifted.admit().unwrap();

        let outcome = r
            .reconcile(Some(&drifted), Observed::from_outcome(&running), &runtime)
            .await;

        assert_eq!(
            outcome.action,
            ReconcileAction::UpdateUnsupported {
                changed: vec!["memoryMb".to_string(), "volumes".to_string()],
            }
        );
        assert!(outcome.error.is_none());
        // Status untouched, no adapter traffic this tick.
        assert_eq!(outcome.status.as_ref().unwrap().state, VmState::Running);
        assert_eq!(runtime.query_calls(), queries_before);
        assert_eq!(runtime.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_reapply_after_delete_creates_fresh_instance() {
        let runtime = InMemoryRuntime::new();
        let desired = spec();
        let r = reconciler();

        let create = r.reconcile(Some(&desired), Observed::none(), &runtime).await;
        let first_handle = create.status.as_ref().unwrap().instance.clone().unwrap();
        let deleted = r
            .reconcile(None, Observed::from_outcome(&create), &runtime)
            .await;
        assert_eq!(deleted.status.as_ref().unwrap().state, VmState::Deleted);

        // The deleted record is treated as absent; a new excursion begins.
        let recreated = r
            .reconcile(Some(&desired), Observed::from_outcome(&deleted), &runtime)
            .await;
        let second_handle = recreated.status.as_ref().unwrap().instance.clone().unwrap();
        assert_eq!(recreated.status.as_ref().unwrap().state, VmState::Pending);
        assert_ne!(first_handle, second_handle);
        assert_eq!(runtime.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_nothing_desired_nothing_observed() {
        let runtime = InMemoryRuntime::new();
        let outcome = reconciler()
            .reconcile(None, Observed::none(), &runtime)
            .await;
        assert_eq!(outcome.action, ReconcileAction::None);
        assert!(outcome.status.is_none());
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_create_without_handle_is_unknown() {
        let runtime = InMemoryRuntime::new();
        runtime.set_create_delay(Duration::from_secs(600)).await;
        let desired = spec();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = reconciler()
            .reconcile_with_cancel(Some(&desired), Observed::none(), &runtime, &cancel)
            .await;

        let status = outcome.status.as_ref().unwrap();
        assert_eq!(status.state, VmState::Unknown);
        assert!(status.instance.is_none());
        assert!(status.reason.as_deref().unwrap().contains("cleanup unconfirmed"));
        assert!(outcome.applied.is_none());
    }

    #[tokio::test]
    async fn test_create_completing_under_fired_token_is_cleaned_up() {
        // No create delay: the biased select sees the completed create
        // before noticing the fired token, then best-effort delete runs.
        let runtime = InMemoryRuntime::new();
        let desired = spec();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = reconciler()
            .reconcile_with_cancel(Some(&desired), Observed::none(), &runtime, &cancel)
            .await;

        assert_eq!(outcome.status.as_ref().unwrap().state, VmState::Deleted);
        assert_eq!(runtime.create_calls(), 1);
        assert_eq!(runtime.delete_calls(), 1);
        assert_eq!(runtime.instance_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_create_with_failed_cleanup_is_unknown_with_handle() {
        let runtime = InMemoryRuntime::new();
        runtime.fail_next_delete("teardown wedged").await;
        let desired = spec();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = reconciler()
            .reconcile_with_cancel(Some(&desired), Observed::none(), &runtime, &cancel)
            .await;

        let status = outcome.status.as_ref().unwrap();
        assert_eq!(status.state, VmState::Unknown);
        assert!(status.instance.is_some());
        assert!(matches!(outcome.error, Some(CoreError::RuntimeDelete(_))));
    }
}
