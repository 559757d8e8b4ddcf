//! Validation of microvm specifications.
//!
//! Validation is a pure pass over a [`MicrovmSpec`] that collects every
//! violation rather than failing fast, so a caller gets one complete report
//! per submission. The [`ValidatedSpec`] newtype is the proof that a
//! specification passed through [`MicrovmSpec::admit`]: the reconciliation
//! layer only accepts `ValidatedSpec`, so a malformed specification can
//! never reach a runtime adapter.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use thiserror::Error;

use crate::defaults::apply_defaults;
use crate::machine::{MicrovmSpec, Volume};

/// Category of a single validation violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    /// A required field is missing or empty
    MissingRequiredField,
    /// A numeric or length constraint was undershot
    BelowMinimum,
    /// An identifier collides with another in the same specification
    DuplicateIdentifier,
    /// A value is outside a closed enumeration
    InvalidEnumValue,
    /// A value does not parse in its expected format
    InvalidFormat,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationKind::MissingRequiredField => "MissingRequiredField",
            ViolationKind::BelowMinimum => "BelowMinimum",
            ViolationKind::DuplicateIdentifier => "DuplicateIdentifier",
            ViolationKind::InvalidEnumValue => "InvalidEnumValue",
            ViolationKind::InvalidFormat => "InvalidFormat",
        };
        write!(f, "{name}")
    }
}

/// A single validation violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Wire-name path of the offending field (e.g. `volumes[1].id`)
    pub field: String,
    /// Violation category
    pub kind: ViolationKind,
    /// Human-readable detail
    pub detail: String,
}

impl Violation {
    /// Create a violation.
    pub fn new(field: impl Into<String>, kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.kind, self.detail)
    }
}

/// The complete set of violations found in one specification.
///
/// This is the `ValidationError` of the platform taxonomy: it is surfaced
/// to the caller in full and blocks reconciliation entirely.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid microvm specification: {}", summarize(.0))]
pub struct Violations(pub Vec<Violation>);

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Violations {
    /// Number of violations.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the violations in field order.
    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.0.iter()
    }

    /// Check whether any violation targets the given field path.
    pub fn contains_field(&self, field: &str) -> bool {
        self.0.iter().any(|v| v.field == field)
    }
}

/// Validate a specification, collecting all violations in field order.
///
/// The pass is pure and judges `kernelCmdline` by its effective value: an
/// empty command line passes because defaulting fills it, so `validate` and
/// [`apply_defaults`](crate::apply_defaults) commute.
pub fn validate(spec: &MicrovmSpec) -> Result<(), Violations> {
    let mut violations = Vec::new();

    if spec.vcpu < 1 {
        violations.push(Violation::new(
            "vcpu",
            ViolationKind::BelowMinimum,
            format!("must be at least 1, got {}", spec.vcpu),
        ));
    }

    if spec.memory_mb < 1024 {
        violations.push(Violation::new(
            "memoryMb",
            ViolationKind::BelowMinimum,
            format!("must be at least 1024, got {}", spec.memory_mb),
        ));
    }

    check_volume(&spec.root_volume, "rootVolume", &mut violations);

    let mut seen_ids = vec![spec.root_volume.id.as_str()];
    for (i, volume) in spec.additional_volumes.iter().enumerate() {
        let path = format!("volumes[{i}]");
        check_volume(volume, &path, &mut violations);
        if !volume.id.is_empty() && seen_ids.contains(&volume.id.as_str()) {
            violations.push(Violation::new(
                format!("{path}.id"),
                ViolationKind::DuplicateIdentifier,
                format!("volume id {:?} is already in use", volume.id),
            ));
        }
        seen_ids.push(volume.id.as_str());
    }

    if spec.kernel.image.is_empty() {
        violations.push(Violation::new(
            "kernel.image",
            ViolationKind::MissingRequiredField,
            "kernel image is required",
        ));
    }

    // Judged post-defaulting: empty means the default string will apply.
    if !spec.kernel_cmdline.is_empty() && spec.kernel_cmdline.len() < 5 {
        violations.push(Violation::new(
            "kernelCmdline",
            ViolationKind::BelowMinimum,
            format!(
                "must be at least 5 characters, got {}",
                spec.kernel_cmdline.len()
            ),
        ));
    }

    if spec.network_interfaces.is_empty() {
        violations.push(Violation::new(
            "networkInterfaces",
            ViolationKind::MissingRequiredField,
            "at least one network interface is required",
        ));
    }
    for (i, iface) in spec.network_interfaces.iter().enumerate() {
        if iface.guest_device_name.is_empty() {
            violations.push(Violation::new(
                format!("networkInterfaces[{i}].guestDeviceName"),
                ViolationKind::MissingRequiredField,
                "guest device name is required",
            ));
        }
        if let Some(mac) = &iface.guest_mac {
            if !is_valid_mac(mac) {
                violations.push(Violation::new(
                    format!("networkInterfaces[{i}].guestMac"),
                    ViolationKind::InvalidFormat,
                    format!("{mac:?} is not a valid hardware address"),
                ));
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(Violations(violations))
    }
}

fn check_volume(volume: &Volume, path: &str, violations: &mut Vec<Violation>) {
    if volume.id.is_empty() {
        violations.push(Violation::new(
            format!("{path}.id"),
            ViolationKind::MissingRequiredField,
            "volume id is required",
        ));
    }
    if volume.image.is_empty() {
        violations.push(Violation::new(
            format!("{path}.image"),
            ViolationKind::MissingRequiredField,
            "volume image is required",
        ));
    }
}

/// Check a colon-separated 6-octet hardware address, e.g. `02:00:00:00:00:01`.
fn is_valid_mac(s: &str) -> bool {
    let mut octets = 0;
    for octet in s.split(':') {
        if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
            return false;
        }
        octets += 1;
    }
    octets == 6
}

/// A specification that has passed defaulting and validation.
///
/// Constructed only by [`MicrovmSpec::admit`]; holding one is proof the
/// contained spec is well-formed and fully defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidatedSpec(MicrovmSpec);

impl ValidatedSpec {
    /// Consume the wrapper and return the inner specification.
    pub fn into_inner(self) -> MicrovmSpec {
        self.0
    }
}

impl Deref for ValidatedSpec {
    type Target = MicrovmSpec;

    fn deref(&self) -> &MicrovmSpec {
        &self.0
    }
}

impl AsRef<MicrovmSpec> for ValidatedSpec {
    fn as_ref(&self) -> &MicrovmSpec {
        &self.0
    }
}

impl MicrovmSpec {
    /// Admit this specification: apply defaults, then validate.
    ///
    /// This is the single gate to reconciliation. The input is not mutated;
    /// the returned [`ValidatedSpec`] wraps a defaulted copy.
    ///
    /// # Errors
    /// Returns all violations found, together, if the specification is
    /// malformed.
    pub fn admit(&self) -> Result<ValidatedSpec, Violations> {
        let defaulted = apply_defaults(self);
        validate(&defaulted)?;
        Ok(ValidatedSpec(defaulted))
    }
}
