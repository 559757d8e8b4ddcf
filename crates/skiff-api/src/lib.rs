//! # skiff-api
//!
//! Declarative surface of the skiff microvm platform.
//!
//! This crate defines the desired-state specification for a microvm
//! ([`MicrovmSpec`]), the pure validation and defaulting passes that make a
//! submitted specification well-formed, and the [`VmState`] lifecycle
//! vocabulary shared with the reconciliation layer in `skiff-core`.
//!
//! Everything here is synchronous and side-effect free: validation and
//! defaulting take values and return values, so callers can diff a
//! specification against a previous generation without it being mutated
//! underneath them.
//!
//! ## Quick Start
//!
//! ```
//! use skiff_api::{IfaceType, MicrovmSpec, NetworkInterface, Volume};
//!
//! let spec = MicrovmSpec::builder()
//!     .vcpu(2)
//!     .memory_mb(2048)
//!     .root_volume(Volume::new("root", "ghcr.io/skiff/ubuntu:22.04"))
//!     .kernel("ghcr.io/skiff/kernel:5.10")
//!     .network_interface(NetworkInterface::new("eth0", IfaceType::Tap))
//!     .build();
//!
//! // Single admission gate: defaults applied, then every violation collected.
//! let validated = spec.admit().expect("spec is well-formed");
//! assert_eq!(validated.root_volume.mount_point, "/");
//! ```

mod defaults;
mod machine;
mod state;
mod validate;

pub use defaults::{apply_defaults, DEFAULT_KERNEL_CMDLINE, DEFAULT_MOUNT_POINT};
pub use machine::{
    ContainerFileSource, IfaceType, MachineTemplate, MicrovmSpec, MicrovmSpecBuilder,
    NetworkInterface, Volume,
};
pub use state::VmState;
pub use validate::{validate, ValidatedSpec, Violation, ViolationKind, Violations};
