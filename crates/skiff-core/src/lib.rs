//! # skiff-core
//!
//! Lifecycle machinery for skiff microvms.
//!
//! This crate converges declared microvm specifications (from `skiff-api`)
//! against a pluggable runtime adapter. It owns the observed lifecycle
//! record, the transition rules between states, and the reconciler that
//! decides per tick whether to create, query, or delete an instance.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Controller (host)                      │
//! ├─────────────────────────────────────────────────────────┤
//! │                                                         │
//! │  ┌──────────────┐      ┌─────────────────────────────┐  │
//! │  │ apply()      │─────▶│ HashMap<MachineId,          │  │
//! │  │ withdraw()   │      │   Mutex<MachineEntry>>      │  │
//! │  │ tick()       │      │ (desired + observed state)  │  │
//! │  └──────────────┘      └─────────────────────────────┘  │
//! │         │                                               │
//! │         ▼ one in-flight reconcile per machine           │
//! │  ┌──────────────┐      ┌─────────────────────────────┐  │
//! │  │  Reconciler  │─────▶│ RuntimeAdapter              │  │
//! │  │  - create    │      │   create / query / delete   │  │
//! │  │  - query     │      ├─────────────────────────────┤  │
//! │  │  - delete    │      │ ArtifactResolver            │  │
//! │  └──────────────┘      │ NetworkProvisioner          │  │
//! │         │              └─────────────────────────────┘  │
//! │         ▼                                               │
//! │  ┌──────────────┐                                       │
//! │  │ MicrovmStatus│  pending / running / failed /         │
//! │  │ (VmState)    │  deleted / unknown                    │
//! │  └──────────────┘                                       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Validation failures never reach this crate's adapter calls: the
//! controller admits specifications through `MicrovmSpec::admit`, and the
//! reconciler only accepts the resulting `ValidatedSpec`.

mod config;
mod controller;
mod error;
mod lifecycle;
mod memory;
mod reconcile;
mod runtime;

pub use config::{ControllerConfig, ReconcilerConfig};
pub use controller::{Controller, MachineId};
pub use error::{CoreError, Result, RuntimeError};
pub use lifecycle::MicrovmStatus;
pub use memory::{InMemoryRuntime, MemoryArtifacts, SequentialMacs};
pub use reconcile::{Observed, ReconcileAction, ReconcileOutcome, Reconciler};
pub use runtime::{
    ArtifactResolver, HostIface, InstanceHandle, NetworkProvisioner, RuntimeAdapter, RuntimeStatus,
};
