//! Defaulting resolver for microvm specifications.

use crate::machine::MicrovmSpec;

/// Kernel command line used when a specification leaves it unset.
pub const DEFAULT_KERNEL_CMDLINE: &str =
    "console=ttyS0 reboot=k panic=1 pci=off i8042.noaux i8042.nomux i8042.nopnp i8042.dumbkbd";

/// Mount point used when a volume leaves it unset.
pub const DEFAULT_MOUNT_POINT: &str = "/";

/// Fill in unset-but-defaultable fields of a specification.
///
/// Returns a new value; the input is never mutated, so callers can keep the
/// original for diffing against a previous generation. The pass is
/// deterministic and idempotent.
///
/// Guest MAC addresses are deliberately left untouched: assignment belongs
/// to the runtime adapter at creation time, so an unset MAC stays unset
/// here.
pub fn apply_defaults(spec: &MicrovmSpec) -> MicrovmSpec {
    let mut defaulted = spec.clone();

    if defaulted.kernel_cmdline.is_empty() {
        defaulted.kernel_cmdline = DEFAULT_KERNEL_CMDLINE.to_string();
    }

    if defaulted.root_volume.mount_point.is_empty() {
        defaulted.root_volume.mount_point = DEFAULT_MOUNT_POINT.to_string();
    }
    for volume in &mut defaulted.additional_volumes {
        if volume.mount_point.is_empty() {
            volume.mount_point = DEFAULT_MOUNT_POINT.to_string();
        }
    }

    defaulted
}
